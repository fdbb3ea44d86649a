//! Allocator adapters and the driver behind the `wss-bench` binary.
#![deny(unsafe_op_in_unsafe_fn)]

use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::NonNull,
};

use anyhow::Context;
use liveset::{LiveSetBuilder, Measure, ProcessMemory, Report, Subject, Workload};
use wss_alloc::{AllocError, AllocInitError, BuddyAllocator, CacheAllocator};

const MIB: usize = 1 << 20;

/// Alignment requested from the system allocator, matching the buddy header.
const ALIGN: usize = 8;

/// The process-wide system allocator.
#[derive(Debug, Default)]
pub struct SystemSubject;

impl Subject for SystemSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, len: usize) -> Result<NonNull<u8>, AllocError> {
        let layout = Layout::from_size_align(len, ALIGN).map_err(|_| AllocError)?;
        if layout.size() == 0 {
            return Err(AllocError);
        }
        NonNull::new(unsafe { System.alloc(layout) }).ok_or(AllocError)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: `len` produced a valid layout when `ptr` was allocated.
        let layout = unsafe { Layout::from_size_align_unchecked(len, ALIGN) };
        unsafe { System.dealloc(ptr.as_ptr(), layout) };
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// A [`BuddyAllocator`] over its own region.
#[derive(Debug)]
pub struct BuddySubject(BuddyAllocator);

impl BuddySubject {
    /// Maps a region of `2^power` bytes.
    pub fn new(power: usize) -> Result<Self, AllocInitError> {
        Ok(BuddySubject(BuddyAllocator::try_new(power)?))
    }

    /// Returns the wrapped allocator.
    pub fn allocator(&self) -> &BuddyAllocator {
        &self.0
    }
}

impl Subject for BuddySubject {
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

/// A [`CacheAllocator`] over its own buddy region.
#[derive(Debug)]
pub struct CacheSubject(CacheAllocator);

impl CacheSubject {
    /// Maps a region of `2^power` bytes with caches growing by `growth`.
    pub fn new(power: usize, growth: f64) -> Result<Self, AllocInitError> {
        Ok(CacheSubject(CacheAllocator::try_new(power, growth)?))
    }

    /// Returns the wrapped allocator.
    pub fn allocator(&self) -> &CacheAllocator {
        &self.0
    }
}

impl Subject for CacheSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.allocate(len).map(NonNull::cast)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _len: usize) {
        unsafe { self.0.deallocate(ptr) };
    }

    fn name(&self) -> &str {
        "cache"
    }
}

/// The allocator a run is measured against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AllocatorKind {
    /// The system allocator.
    #[default]
    System,
    /// The buddy allocator.
    Buddy,
    /// The slab cache allocator over a buddy allocator.
    Cache,
}

/// Everything needed to perform one run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// The allocator under test.
    pub allocator: AllocatorKind,
    /// The workload to drive it with.
    pub workload: &'static Workload,
    /// Live-byte budget in MiB.
    pub live_mib: usize,
    /// Bytes injected per workload phase, in MiB.
    pub inject_mib: usize,
    /// Region size of the buddy allocator, as a power of two.
    pub buddy_power: usize,
    /// Growth factor between cache sizes.
    pub cache_growth: f64,
    /// Number of objects the live set can track.
    pub slots: usize,
    /// Seed for eviction and size generation.
    pub seed: Option<u64>,
    /// The process counter reported.
    pub measure: Measure,
}

/// Performs one run and collects its report.
pub fn run(config: &RunConfig) -> anyhow::Result<Report> {
    match config.allocator {
        AllocatorKind::System => run_with(config, SystemSubject),
        AllocatorKind::Buddy => {
            let subject = BuddySubject::new(config.buddy_power)
                .with_context(|| format!("failed to create 2^{} byte buddy", config.buddy_power))?;
            run_with(config, subject)
        }
        AllocatorKind::Cache => {
            let subject = CacheSubject::new(config.buddy_power, config.cache_growth)
                .context("failed to create cache allocator")?;
            run_with(config, subject)
        }
    }
}

fn run_with<S: Subject>(config: &RunConfig, subject: S) -> anyhow::Result<Report> {
    let max_live = config
        .live_mib
        .checked_mul(MIB)
        .context("live budget too large")?;
    let inject = config
        .inject_mib
        .checked_mul(MIB)
        .context("inject size too large")?;

    let mut builder = LiveSetBuilder::new(max_live).slots(config.slots);
    if let Some(seed) = config.seed {
        builder = builder.seed(seed);
    }
    let mut set = builder.build(subject).context("failed to create live set")?;

    let name = config.workload.name;
    let count = config
        .workload
        .run(&mut set, inject)
        .with_context(|| format!("workload {name} failed"))?;
    log::info!("{name}: injected {count} objects, {} bytes live", set.live());

    let mem = ProcessMemory::current().context("failed to read process memory")?;

    Ok(Report {
        prog: set.subject().name().to_owned(),
        workload: name.to_owned(),
        live_mib: config.live_mib,
        inject_mib: config.inject_mib,
        vm: config.measure.of(mem),
        overhead: set.overhead_for(config.measure),
        nobjs: set.nobjs(),
        alloc_time: set.alloc_time(),
    })
}

#[cfg(test)]
mod tests {
    use wss_alloc::cache::DEFAULT_GROWTH;

    use super::*;

    fn config(allocator: AllocatorKind, workload: &str) -> RunConfig {
        RunConfig {
            allocator,
            workload: Workload::by_name(workload).unwrap(),
            live_mib: 1,
            inject_mib: 2,
            buddy_power: 24,
            cache_growth: DEFAULT_GROWTH,
            slots: 100_000,
            seed: Some(11),
            measure: Measure::Rss,
        }
    }

    fn exercise<S: Subject>(subject: &mut S) {
        let ptrs: Vec<_> = [1, 8, 100, 4000]
            .into_iter()
            .map(|len| {
                let p = subject.allocate(len).unwrap();
                assert_eq!(p.as_ptr() as usize % ALIGN, 0);
                unsafe { p.as_ptr().write_bytes(0xa5, len) };
                (p, len)
            })
            .collect();

        for (p, len) in ptrs {
            unsafe { subject.deallocate(p, len) };
        }
    }

    #[test]
    fn subjects_allocate_and_free() {
        exercise(&mut SystemSubject);
        exercise(&mut BuddySubject::new(16).unwrap());
        exercise(&mut CacheSubject::new(16, DEFAULT_GROWTH).unwrap());
    }

    #[test]
    fn buddy_subject_returns_memory() {
        let mut s = BuddySubject::new(16).unwrap();
        exercise(&mut s);
        assert_eq!(s.allocator().free_bytes(), 1 << 16);
    }

    #[test]
    fn cache_subject_returns_slabs() {
        let mut s = CacheSubject::new(16, DEFAULT_GROWTH).unwrap();
        exercise(&mut s);
        assert_eq!(s.allocator().slab_count(), 0);
    }

    #[test]
    fn system_rejects_zero() {
        assert_eq!(SystemSubject.allocate(0), Err(AllocError));
    }

    #[test]
    fn runs_produce_reports() {
        for kind in [AllocatorKind::System, AllocatorKind::Buddy, AllocatorKind::Cache] {
            let report = run(&config(kind, "w3")).unwrap();
            assert_eq!(report.workload, "w3");
            assert!(report.nobjs > 0);
            assert!(report.vm > 0);
        }
    }

    #[test]
    fn rss_reports_count_live_memory() {
        for kind in [AllocatorKind::System, AllocatorKind::Buddy, AllocatorKind::Cache] {
            let report = run(&config(kind, "w8")).unwrap();
            assert!(report.wss() > 0, "{report}");
            assert!(report.efficiency() > 0.0, "{report}");
        }
    }

    #[test]
    fn bad_buddy_power_is_an_error() {
        let mut c = config(AllocatorKind::Buddy, "w1");
        c.buddy_power = 0;
        assert!(run(&c).is_err());
    }

    #[test]
    fn oversized_budget_is_an_error() {
        let mut c = config(AllocatorKind::System, "w1");
        c.live_mib = usize::MAX;
        assert!(run(&c).is_err());
    }
}
