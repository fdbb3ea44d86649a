//! Process memory statistics and run reports.

use std::{fmt, fs, io, str::FromStr, time::Duration};

use crate::Error;

const MIB: f64 = (1 << 20) as f64;

/// The memory counters of a process, in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessMemory {
    /// Total program size.
    pub vm: usize,
    /// Resident set size.
    pub rss: usize,
}

impl ProcessMemory {
    /// Reads the counters of the calling process from `/proc/self/statm`.
    pub fn current() -> Result<ProcessMemory, Error> {
        let statm = fs::read_to_string("/proc/self/statm")?;
        Self::parse(&statm, page_size())
    }

    /// Parses the contents of a `statm` file, whose fields are in pages.
    pub fn parse(statm: &str, page_size: usize) -> Result<ProcessMemory, Error> {
        let mut fields = statm.split_whitespace().map(usize::from_str);

        let mut next = |what: &str| match fields.next() {
            Some(Ok(pages)) => Ok(pages * page_size),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed statm: missing {what}"),
            )),
        };

        let vm = next("size")?;
        let rss = next("resident")?;

        Ok(ProcessMemory { vm, rss })
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(sz).unwrap_or(wss_alloc::region::PAGE_SIZE)
}

/// Which process counter a run is measured by.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Measure {
    /// Total program size.
    #[default]
    Vm,
    /// Resident set size.
    Rss,
}

impl Measure {
    /// Selects the measured counter from `mem`.
    pub fn of(self, mem: ProcessMemory) -> usize {
        match self {
            Measure::Vm => mem.vm,
            Measure::Rss => mem.rss,
        }
    }
}

impl FromStr for Measure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(Measure::Vm),
            "rss" => Ok(Measure::Rss),
            _ => Err(Error::InvalidConfiguration(format!("unknown measure {s:?}"))),
        }
    }
}

/// The results of one workload run.
#[derive(Clone, Debug)]
pub struct Report {
    /// Name of the allocator under test.
    pub prog: String,
    /// Name of the workload.
    pub workload: String,
    /// Live-byte budget in MiB.
    pub live_mib: usize,
    /// Bytes injected per phase, in MiB.
    pub inject_mib: usize,
    /// Measured process memory in bytes.
    pub vm: usize,
    /// Memory used by the live set's own tables, in bytes.
    pub overhead: usize,
    /// Number of live objects at the end of the run.
    pub nobjs: usize,
    /// Time spent allocating.
    pub alloc_time: Duration,
}

impl Report {
    /// Column names, in the order `Display` writes them.
    pub const HEADER: &'static str =
        "prog workload live_mib inject_mib vm_mib wss_mib eff overhead_mib nobjs alloc_ms";

    /// Returns process memory not attributable to the live set's tables.
    pub fn wss(&self) -> usize {
        self.vm.saturating_sub(self.overhead)
    }

    /// Returns the ratio of the working set to the live budget.
    pub fn efficiency(&self) -> f64 {
        self.wss() as f64 / (self.live_mib as f64 * MIB)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {:.3} {:.3} {:.5} {:.3} {} {:.3}",
            self.prog,
            self.workload,
            self.live_mib,
            self.inject_mib,
            self.vm as f64 / MIB,
            self.wss() as f64 / MIB,
            self.efficiency(),
            self.overhead as f64 / MIB,
            self.nobjs,
            self.alloc_time.as_secs_f64() * 1e3,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_statm() {
        let mem = ProcessMemory::parse("1000 250 100 10 0 300 0\n", 4096).unwrap();
        assert_eq!(mem.vm, 1000 * 4096);
        assert_eq!(mem.rss, 250 * 4096);
        assert_eq!(Measure::Vm.of(mem), mem.vm);
        assert_eq!(Measure::Rss.of(mem), mem.rss);
    }

    #[test]
    fn parse_malformed_statm() {
        assert!(matches!(
            ProcessMemory::parse("1000", 4096),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::InvalidData
        ));
        assert!(ProcessMemory::parse("x 1", 4096).is_err());
    }

    #[test]
    fn current_process() {
        let mem = ProcessMemory::current().unwrap();
        assert!(mem.vm >= mem.rss);
        assert!(mem.rss > 0);
    }

    #[test]
    fn measure_from_str() {
        assert_eq!("vm".parse::<Measure>().unwrap(), Measure::Vm);
        assert_eq!("rss".parse::<Measure>().unwrap(), Measure::Rss);
        assert!("pss".parse::<Measure>().is_err());
    }

    #[test]
    fn report_line() {
        let r = Report {
            prog: "buddy".into(),
            workload: "w1".into(),
            live_mib: 10,
            inject_mib: 50,
            vm: 25 << 20,
            overhead: 5 << 20,
            nobjs: 42,
            alloc_time: Duration::from_millis(1500),
        };

        assert_eq!(r.wss(), 20 << 20);
        assert_eq!(r.efficiency(), 2.0);
        assert_eq!(
            r.to_string(),
            "buddy w1 10 50 25.000 20.000 2.00000 5.000 42 1500.000"
        );
        assert_eq!(Report::HEADER.split(' ').count(), 10);
    }
}
