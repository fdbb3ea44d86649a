#![no_main]

use std::ptr::NonNull;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use liveset::{LiveSetBuilder, Subject};
use wss_alloc::{AllocError, BuddyAllocator};

struct Buddy(BuddyAllocator);

impl Subject for Buddy {
    type AllocError = AllocError;

    fn allocate(&mut self, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.allocate(len).map(NonNull::cast)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _len: usize) {
        unsafe { self.0.deallocate(ptr) };
    }

    fn name(&self) -> &str {
        "buddy"
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum LiveSetOp {
    Inject { sizes: Vec<u16>, total: u32 },
    Drop(u32),
    FreeAll,
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    max_live: u16,
    seed: u64,
    ops: Vec<LiveSetOp>,
}

fuzz_target!(|args: Args| {
    let buddy = match BuddyAllocator::try_new(22) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut set = match LiveSetBuilder::new(usize::from(args.max_live))
        .slots(1 << 16)
        .seed(args.seed)
        .build(Buddy(buddy))
    {
        Ok(s) => s,
        Err(_) => return,
    };

    for op in args.ops {
        match op {
            LiveSetOp::Inject { sizes, total } => {
                let sizes = sizes.into_iter().map(u32::from);
                if set.inject(sizes, total as usize).is_err() {
                    return;
                }
            }
            LiveSetOp::Drop(at_least) => {
                set.drop(at_least as usize).unwrap();
                assert!(set.live() <= set.max_live().saturating_sub(at_least as usize));
            }
            LiveSetOp::FreeAll => set.free_all(),
        }

        assert!(set.check_invariants());
    }
});
