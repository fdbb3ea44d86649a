#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use wss_alloc::{buddy::HEADER_SIZE, BuddyAllocator};

const MAX_FUZZ_POWER: u8 = 20;

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(u32),
    Deallocate(usize),
    Reset,
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    power: u8,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let alloc = match BuddyAllocator::try_new(usize::from(args.power % (MAX_FUZZ_POWER + 1))) {
        Ok(a) => a,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Allocate(len) => {
                if let Ok(block) = alloc.allocate(len as usize) {
                    assert!(block.len() >= len as usize);
                    assert!((block.len() + HEADER_SIZE).is_power_of_two());
                    outstanding.push(block);
                }
            }

            BuddyOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }
                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                unsafe { alloc.deallocate(block.cast()) };
            }

            BuddyOp::Reset => {
                outstanding.clear();
                alloc.reset();
            }
        }

        let used: usize = outstanding.iter().map(|b| b.len() + HEADER_SIZE).sum();
        assert_eq!(used + alloc.free_bytes(), alloc.region_len());
    }

    for block in outstanding {
        unsafe { alloc.deallocate(block.cast()) };
    }

    if alloc.max_alloc() > 0 {
        assert!(alloc.allocate(alloc.max_alloc()).is_ok());
    }
});
