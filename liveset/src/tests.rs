#![cfg(test)]

use std::{
    alloc::{GlobalAlloc, Layout, System},
    collections::BTreeSet,
    ptr::NonNull,
};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{sizes, Error, LiveSetBuilder, Subject};

/// A subject backed by the system allocator which tracks every outstanding
/// block.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    pub(crate) allocations: usize,
    pub(crate) live_bytes: usize,
    outstanding: BTreeSet<usize>,
    limit: Option<usize>,
}

impl Heap {
    /// Fails every allocation after the first `limit`.
    pub(crate) fn with_limit(limit: usize) -> Heap {
        Heap {
            limit: Some(limit),
            ..Heap::default()
        }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, 8).unwrap()
    }
}

impl Subject for Heap {
    type AllocError = ();

    fn allocate(&mut self, len: usize) -> Result<NonNull<u8>, ()> {
        if self.limit.is_some_and(|l| self.allocations >= l) {
            return Err(());
        }

        let ptr = NonNull::new(unsafe { System.alloc(Self::layout(len)) }).ok_or(())?;
        assert!(self.outstanding.insert(ptr.as_ptr() as usize));

        self.allocations += 1;
        self.live_bytes += len;
        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, len: usize) {
        assert!(
            self.outstanding.remove(&(ptr.as_ptr() as usize)),
            "double free of {ptr:p}"
        );
        self.live_bytes -= len;
        unsafe { System.dealloc(ptr.as_ptr(), Self::layout(len)) };
    }

    fn name(&self) -> &str {
        "heap"
    }
}

#[derive(Clone, Debug)]
enum LiveSetOp {
    Inject { size: u32, total: usize },
    Drop { at_least: usize },
    FreeAll,
}

impl Arbitrary for LiveSetOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 8 {
            0 => LiveSetOp::FreeAll,
            1 | 2 => LiveSetOp::Drop {
                at_least: usize::arbitrary(g) % 20_000,
            },
            _ => LiveSetOp::Inject {
                size: 1 + u32::arbitrary(g) % 2_000,
                total: usize::arbitrary(g) % 50_000,
            },
        }
    }
}

#[test]
fn live_totals_match_tables() {
    fn prop(ops: Vec<LiveSetOp>) -> bool {
        let max_live = 10_000;
        let mut set = LiveSetBuilder::new(max_live)
            .slots(4096)
            .seed(1)
            .build(Heap::default())
            .unwrap();

        for op in ops {
            match op {
                LiveSetOp::Inject { size, total } => {
                    // Tiny objects can outnumber the slots before the budget
                    // is reached.
                    match set.inject(sizes::constant(size), total) {
                        Ok(_) | Err(Error::CapacityExceeded { table: "locs", .. }) => (),
                        Err(_) => return false,
                    }
                }
                LiveSetOp::Drop { at_least } => {
                    set.drop(at_least).unwrap();
                    if set.live() > max_live.saturating_sub(at_least) {
                        return false;
                    }
                }
                LiveSetOp::FreeAll => set.free_all(),
            }

            if !set.check_invariants() || set.subject().live_bytes != set.live() {
                return false;
            }
        }

        true
    }

    let mut qc = QuickCheck::new().max_tests(100);
    qc.quickcheck(prop as fn(_) -> bool);
}
