#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use wss_alloc::CacheAllocator;

#[derive(Clone, Debug, Arbitrary)]
enum CacheOp {
    Allocate(u16),
    Deallocate(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    power: u8,
    growth: u8,
    ops: Vec<CacheOp>,
}

fuzz_target!(|args: Args| {
    let power = 12 + usize::from(args.power % 9);
    let growth = 1.0 + f64::from(args.growth % 32 + 1) / 16.0;

    let alloc = match CacheAllocator::try_new(power, growth) {
        Ok(a) => a,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            CacheOp::Allocate(len) => {
                if let Ok(slot) = alloc.allocate(usize::from(len)) {
                    assert!(slot.len() >= usize::from(len));
                    outstanding.push(slot);
                }
            }

            CacheOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }
                let idx = raw_idx % outstanding.len();
                let slot = outstanding.swap_remove(idx);
                unsafe { alloc.deallocate(slot.cast()) };
            }
        }
    }

    for slot in outstanding {
        unsafe { alloc.deallocate(slot.cast()) };
    }

    assert_eq!(alloc.slab_count(), 0);
});
