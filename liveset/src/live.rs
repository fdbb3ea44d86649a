use core::{mem, ptr::NonNull};
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, Rng, SeedableRng};
use wss_alloc::region::page_round_up;

use crate::{table::Table, Error, Measure, Subject};

/// The number of tracking slots used when no capacity is given.
pub const DEFAULT_SLOTS: usize = 200_000_000;

/// Configures and constructs a [`LiveSet`].
#[derive(Clone, Debug)]
pub struct LiveSetBuilder {
    max_live: usize,
    slots: usize,
    seed: Option<u64>,
}

impl LiveSetBuilder {
    /// Starts configuring a live set holding at most `max_live` bytes.
    pub fn new(max_live: usize) -> LiveSetBuilder {
        LiveSetBuilder {
            max_live,
            slots: DEFAULT_SLOTS,
            seed: None,
        }
    }

    /// Sets the number of objects the live set can track.
    pub fn slots(mut self, slots: usize) -> LiveSetBuilder {
        self.slots = slots;
        self
    }

    /// Seeds eviction, making runs reproducible.
    pub fn seed(mut self, seed: u64) -> LiveSetBuilder {
        self.seed = Some(seed);
        self
    }

    /// Maps the tracking tables and constructs the live set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `max_live` or the slot count is
    /// zero, and `Map` if a tracking table could not be mapped.
    pub fn build<S: Subject>(self, subject: S) -> Result<LiveSet<S>, Error> {
        if self.max_live < 1 {
            return Err(Error::InvalidConfiguration(
                "live set must hold at least one byte".into(),
            ));
        }
        if self.slots == 0 || u32::try_from(self.slots).is_err() {
            return Err(Error::InvalidConfiguration(format!(
                "slot count {} out of range",
                self.slots
            )));
        }

        let rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let set = LiveSet {
            locs: Table::map("locs", self.slots)?,
            sizes: Table::map("sizes", self.slots)?,
            free_slots: Table::map("freelist", self.slots)?,
            nfree: 0,
            high_water: 0,
            subject,
            max_live: self.max_live,
            live: 0,
            nobjs: 0,
            injected: 0,
            alloc_time: Duration::ZERO,
            rng,
        };

        log::debug!(
            "live set over {}: max_live {} bytes, {} slots, overhead {} bytes",
            set.subject.name(),
            set.max_live,
            self.slots,
            set.overhead()
        );

        Ok(set)
    }
}

/// A bounded set of live allocations, churned by injecting new objects and
/// evicting random old ones.
///
/// Every object is allocated from the subject `S`; the tracking tables are
/// mapped separately and never touch it.
pub struct LiveSet<S: Subject> {
    subject: S,

    /// Address of the object in each slot, or `None` if the slot is empty.
    locs: Table<Option<NonNull<u8>>>,
    /// Size of the object in each slot, or zero if the slot is empty.
    sizes: Table<u32>,
    /// Stack of emptied slots below `high_water`.
    free_slots: Table<u32>,
    nfree: usize,
    /// No slot at or above this index has ever been used.
    high_water: usize,

    max_live: usize,
    live: usize,
    nobjs: usize,
    injected: usize,
    alloc_time: Duration,

    rng: StdRng,
}

impl<S: Subject> LiveSet<S> {
    /// Constructs a live set with [`DEFAULT_SLOTS`] tracking slots.
    pub fn new(subject: S, max_live: usize) -> Result<LiveSet<S>, Error> {
        LiveSetBuilder::new(max_live).build(subject)
    }

    /// Constructs a live set with room for `slots` objects.
    pub fn with_capacity(subject: S, max_live: usize, slots: usize) -> Result<LiveSet<S>, Error> {
        LiveSetBuilder::new(max_live).slots(slots).build(subject)
    }

    /// Returns the subject objects are allocated from.
    pub fn subject(&self) -> &S {
        &self.subject
    }

    /// Returns the live-byte budget.
    pub fn max_live(&self) -> usize {
        self.max_live
    }

    /// Returns the total size of all live objects.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Returns the number of live objects.
    pub fn nobjs(&self) -> usize {
        self.nobjs
    }

    /// Returns the total size of all objects ever injected.
    pub fn injected(&self) -> usize {
        self.injected
    }

    /// Returns the time spent inside the subject's `allocate`.
    pub fn alloc_time(&self) -> Duration {
        self.alloc_time
    }

    /// Returns the number of objects that can be tracked at once.
    pub fn capacity(&self) -> usize {
        self.locs.capacity()
    }

    /// Draws a seed for a size generator from the live set's own generator.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Allocates objects with sizes taken from `sizes` until `total_bytes`
    /// have been injected or the generator is exhausted.
    ///
    /// Before each allocation, enough random objects are evicted to leave
    /// room for four objects of the new size. Zero sizes are skipped.
    ///
    /// Returns the number of objects injected.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the subject fails, and
    /// `CapacityExceeded` if every tracking slot is occupied.
    pub fn inject<I>(&mut self, sizes: I, total_bytes: usize) -> Result<usize, Error>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut sizes = sizes.into_iter();
        let mut remaining = total_bytes;
        let mut count = 0;

        while remaining > 0 {
            let Some(size) = sizes.next() else {
                log::debug!("size generator exhausted after {count} objects");
                break;
            };
            if size == 0 {
                continue;
            }

            self.drop(4 * size as usize)?;

            let slot = self.take_slot()?;

            let start = Instant::now();
            let res = self.subject.allocate(size as usize);
            self.alloc_time += start.elapsed();

            let ptr = match res {
                Ok(p) => p,
                Err(e) => {
                    log::warn!(
                        "{}: allocation of {size} bytes failed: {e:?}",
                        self.subject.name()
                    );
                    self.release_slot(slot)?;
                    return Err(Error::AllocationFailure { size });
                }
            };

            self.locs.set(slot, Some(ptr));
            self.sizes.set(slot, size);
            self.live += size as usize;
            self.nobjs += 1;
            self.injected += size as usize;

            count += 1;
            remaining = remaining.saturating_sub(size as usize);
        }

        Ok(count)
    }

    /// Evicts random objects until at least `at_least` bytes of the budget are
    /// unused.
    ///
    /// Returns the number of objects evicted.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the stack of free slots is full.
    pub fn drop(&mut self, at_least: usize) -> Result<usize, Error> {
        let target = self.max_live.saturating_sub(at_least);
        let mut evicted = 0;

        while self.live > target {
            let idx = self.rng.gen_range(0..self.high_water);
            if let Some(ptr) = self.locs.get(idx) {
                self.evict(idx, ptr)?;
                evicted += 1;
            }
        }

        if evicted > 0 {
            log::trace!("evicted {evicted} objects, {} bytes live", self.live);
        }

        Ok(evicted)
    }

    /// Frees every live object, empties the tracking tables and resets every
    /// counter to zero.
    pub fn free_all(&mut self) {
        for idx in 0..self.high_water {
            if let Some(ptr) = self.locs.get(idx) {
                let size = self.sizes.get(idx);
                unsafe { self.subject.deallocate(ptr, size as usize) };
                self.locs.set(idx, None);
                self.sizes.set(idx, 0);
            }
        }

        log::debug!("freed {} objects ({} bytes)", self.nobjs, self.live);

        self.live = 0;
        self.nobjs = 0;
        self.injected = 0;
        self.alloc_time = Duration::ZERO;
        self.high_water = 0;
        self.nfree = 0;
    }

    /// Returns the memory used by the live set itself, rounded to pages.
    pub fn overhead(&self) -> usize {
        self.locs.mapped_len()
            + self.sizes.mapped_len()
            + self.free_slots.mapped_len()
            + page_round_up(mem::size_of::<Self>())
    }

    /// Returns the resident memory used by the live set itself.
    ///
    /// Untouched table pages are not resident, so this is the overhead to
    /// subtract from a resident-set measurement.
    pub fn resident_overhead(&self) -> usize {
        self.locs.resident_len()
            + self.sizes.resident_len()
            + self.free_slots.resident_len()
            + page_round_up(mem::size_of::<Self>())
    }

    /// Returns the overhead matching a process measurement of kind
    /// `measure`.
    pub fn overhead_for(&self, measure: Measure) -> usize {
        match measure {
            Measure::Vm => self.overhead(),
            Measure::Rss => self.resident_overhead(),
        }
    }

    /// Recomputes the live totals from the tracking tables and compares them
    /// with the running counters.
    pub fn check_invariants(&self) -> bool {
        let locs = &self.locs.as_slice()[..self.high_water];
        let sizes = &self.sizes.as_slice()[..self.high_water];

        let mut live = 0;
        let mut nobjs = 0;
        for (loc, &size) in locs.iter().zip(sizes) {
            match loc {
                Some(_) if size > 0 => {
                    live += size as usize;
                    nobjs += 1;
                }
                None if size == 0 => (),
                _ => return false,
            }
        }

        live == self.live && nobjs == self.nobjs && nobjs + self.nfree == self.high_water
    }

    fn take_slot(&mut self) -> Result<usize, Error> {
        if self.nfree > 0 {
            self.nfree -= 1;
            return Ok(self.free_slots.get(self.nfree) as usize);
        }

        if self.high_water == self.locs.capacity() {
            return Err(self.locs.exceeded());
        }

        self.high_water += 1;
        Ok(self.high_water - 1)
    }

    fn release_slot(&mut self, idx: usize) -> Result<(), Error> {
        if self.nfree == self.free_slots.capacity() {
            return Err(self.free_slots.exceeded());
        }

        // Slot counts are bounded by `u32::MAX` at construction.
        self.free_slots.set(self.nfree, idx as u32);
        self.nfree += 1;
        Ok(())
    }

    fn evict(&mut self, idx: usize, ptr: NonNull<u8>) -> Result<(), Error> {
        let size = self.sizes.get(idx);
        unsafe { self.subject.deallocate(ptr, size as usize) };

        self.locs.set(idx, None);
        self.sizes.set(idx, 0);
        self.live -= size as usize;
        self.nobjs -= 1;

        self.release_slot(idx)
    }
}

impl<S: Subject> Drop for LiveSet<S> {
    fn drop(&mut self) {
        self.free_all();
    }
}

impl<S: Subject> core::fmt::Debug for LiveSet<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LiveSet")
            .field("subject", &self.subject.name())
            .field("max_live", &self.max_live)
            .field("live", &self.live)
            .field("nobjs", &self.nobjs)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sizes, tests::Heap};

    const MIB: usize = 1 << 20;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn live_set(max_live: usize, slots: usize) -> LiveSet<Heap> {
        LiveSetBuilder::new(max_live)
            .slots(slots)
            .seed(0x5eed)
            .build(Heap::default())
            .unwrap()
    }

    #[test]
    fn rejects_empty_budget() {
        assert!(matches!(
            LiveSet::with_capacity(Heap::default(), 0, 10),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_zero_slots() {
        assert!(matches!(
            LiveSet::with_capacity(Heap::default(), 10, 0),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn default_capacity() {
        let set = LiveSet::new(Heap::default(), MIB).unwrap();
        assert_eq!(set.capacity(), DEFAULT_SLOTS);
    }

    #[test]
    fn one_mib_objects_stay_within_budget() {
        init_logging();
        let mut set = live_set(10 * MIB, 1000);

        let n = set.inject(sizes::constant(MIB as u32), 50 * MIB).unwrap();

        assert_eq!(n, 50);
        assert_eq!(set.injected(), 50 * MIB);
        assert!(set.live() <= 10 * MIB);
        assert!(set.nobjs() <= 10);
        assert!(set.check_invariants());
        assert_eq!(set.subject().live_bytes, set.live());
    }

    #[test]
    fn exhausted_generator_stops_injection() {
        let mut set = live_set(MIB, 100);

        let n = set.inject(sizes::constant(100).take(5), 50 * MIB).unwrap();

        assert_eq!(n, 5);
        assert_eq!(set.subject().allocations, 5);
        assert_eq!(set.live(), 500);
    }

    #[test]
    fn zero_sizes_are_skipped() {
        let mut set = live_set(MIB, 100);

        let n = set.inject([0, 10, 0, 20], 1000).unwrap();

        assert_eq!(n, 2);
        assert_eq!(set.live(), 30);
        assert_eq!(set.subject().allocations, 2);
    }

    #[test]
    fn budget_converges() {
        let max_live = 100_000;
        let mut set = live_set(max_live, 10_000);

        for _ in 0..5 {
            let sizes = sizes::Uniform::with_seed(50, 150, Some(9)).unwrap();
            set.inject(sizes, 200_000).unwrap();
            assert!(set.live() <= max_live);
            assert!(set.check_invariants());
        }

        // Eviction keeps the set close to the budget, not just under it.
        assert!(set.live() > max_live / 2, "live {}", set.live());
    }

    #[test]
    fn drop_evicts_down_to_target() {
        let mut set = live_set(10_000, 1000);
        set.inject(sizes::constant(100), 9_000).unwrap();

        assert_eq!(set.drop(0).unwrap(), 0);

        let evicted = set.drop(5_000).unwrap();
        assert!(evicted > 0);
        assert!(set.live() <= 5_000);
        assert!(set.check_invariants());

        set.drop(usize::MAX).unwrap();
        assert_eq!(set.live(), 0);
        assert_eq!(set.nobjs(), 0);
    }

    #[test]
    fn slots_are_reused() {
        let mut set = live_set(1_000, 16);
        // Far more objects than slots; eviction must recycle slots.
        set.inject(sizes::constant(100), 100_000).unwrap();
        assert!(set.check_invariants());
        assert!(set.nobjs() <= 16);
    }

    #[test]
    fn capacity_exceeded() {
        let mut set = live_set(MIB, 4);

        let err = set.inject(sizes::constant(10), 1_000).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                table: "locs",
                capacity: 4
            }
        ));
        assert_eq!(set.nobjs(), 4);
        assert!(set.check_invariants());
    }

    #[test]
    fn tiny_objects_exhaust_slots_before_budget() {
        let mut set = live_set(10_000, 4096);

        let err = set.inject(sizes::constant(2), 40_000).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                table: "locs",
                capacity: 4096
            }
        ));
        assert_eq!(set.nobjs(), 4096);
        assert_eq!(set.subject().live_bytes, set.live());
        assert!(set.check_invariants());
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut set = LiveSetBuilder::new(MIB)
            .slots(100)
            .build(Heap::with_limit(3))
            .unwrap();

        let err = set.inject(sizes::constant(10), 1_000).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { size: 10 }));
        assert_eq!(set.nobjs(), 3);
        assert!(set.check_invariants());
    }

    #[test]
    fn free_all_releases_everything() {
        let mut set = live_set(MIB, 1000);
        set.inject(sizes::constant(64), 10_000).unwrap();

        set.free_all();

        assert_eq!(set.live(), 0);
        assert_eq!(set.nobjs(), 0);
        assert_eq!(set.injected(), 0);
        assert_eq!(set.alloc_time(), Duration::ZERO);
        assert_eq!(set.subject().live_bytes, 0);
        assert!(set.check_invariants());

        // The set is usable again afterwards.
        set.inject(sizes::constant(64), 640).unwrap();
        assert_eq!(set.nobjs(), 10);
    }

    #[test]
    fn overhead_counts_tables() {
        let set = live_set(MIB, 1024);
        // 8-byte locations plus two 4-byte tables, plus one page for the set.
        assert_eq!(set.overhead(), 8192 + 4096 + 4096 + 4096);
    }

    #[test]
    fn resident_overhead_tracks_touched_tables() {
        let mut set = live_set(MIB, 1 << 20);
        let untouched = set.resident_overhead();
        assert!(untouched < set.overhead());

        set.inject(sizes::constant(16), 1 << 20).unwrap();
        assert!(set.resident_overhead() > untouched);
        assert!(set.resident_overhead() <= set.overhead());

        assert_eq!(set.overhead_for(Measure::Vm), set.overhead());
        assert_eq!(set.overhead_for(Measure::Rss), set.resident_overhead());
    }

    #[test]
    fn seeded_runs_repeat() {
        let run = || {
            let mut set = live_set(5_000, 1000);
            set.inject(sizes::constant(100), 50_000).unwrap();
            (0..set.high_water)
                .map(|i| set.locs.get(i).is_some())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }
}
