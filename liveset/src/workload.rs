//! Named synthetic workloads.
//!
//! The `w1` through `w8` workloads are modeled on the synthetic workloads of
//! Rumble et al., "Log-structured Memory for DRAM-based Storage" (FAST'14).
//! Each injects objects from a `before` distribution, optionally drops part of
//! the live set, then injects objects from an `after` distribution.

use std::{
    fmt,
    io::{self, BufRead},
};

use crate::{
    sizes::{self, LineSizes, Normal, Uniform},
    Error, LiveSet, Subject,
};

/// A distribution of object sizes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizeSpec {
    /// Every object has the same size.
    Fixed(u32),
    /// Sizes drawn uniformly from an inclusive range.
    Uniform(u32, u32),
    /// Sizes drawn from a normal distribution.
    Normal {
        /// Mean size in bytes.
        mean: f64,
        /// Standard deviation in bytes.
        std_dev: f64,
    },
    /// Newline-delimited sizes read from an input stream.
    Input,
}

impl SizeSpec {
    /// Builds a generator for this distribution.
    ///
    /// `input` is consumed only by [`SizeSpec::Input`].
    pub fn generator<'a, R>(
        &self,
        seed: Option<u64>,
        input: R,
    ) -> Result<Box<dyn Iterator<Item = u32> + 'a>, Error>
    where
        R: BufRead + 'a,
    {
        Ok(match *self {
            SizeSpec::Fixed(n) => Box::new(sizes::constant(n)),
            SizeSpec::Uniform(lo, hi) => Box::new(Uniform::with_seed(lo, hi, seed)?),
            SizeSpec::Normal { mean, std_dev } => {
                Box::new(Normal::with_seed(mean, std_dev, seed)?)
            }
            SizeSpec::Input => Box::new(LineSizes::new(input)),
        })
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Fixed(n) => write!(f, "fixed {n}"),
            SizeSpec::Uniform(lo, hi) => write!(f, "uniform {lo}-{hi}"),
            SizeSpec::Normal { mean, std_dev } => write!(f, "normal({mean}, {std_dev})"),
            SizeSpec::Input => f.write_str("input"),
        }
    }
}

/// A named two-phase workload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Workload {
    /// The name the workload is selected by.
    pub name: &'static str,
    /// Sizes injected in the first phase.
    pub before: SizeSpec,
    /// Fraction of the live budget dropped between phases.
    pub drop: Option<f64>,
    /// Sizes injected in the second phase.
    pub after: Option<SizeSpec>,
}

const fn two_phase(
    name: &'static str,
    before: SizeSpec,
    drop: Option<f64>,
    after: SizeSpec,
) -> Workload {
    Workload {
        name,
        before,
        drop,
        after: Some(after),
    }
}

const fn one_phase(name: &'static str, before: SizeSpec) -> Workload {
    Workload {
        name,
        before,
        drop: None,
        after: None,
    }
}

/// Every named workload.
pub const WORKLOADS: &[Workload] = &[
    one_phase("w1", SizeSpec::Fixed(100)),
    two_phase("w2", SizeSpec::Fixed(100), None, SizeSpec::Fixed(130)),
    two_phase("w3", SizeSpec::Fixed(100), Some(0.9), SizeSpec::Fixed(130)),
    two_phase("w4", SizeSpec::Uniform(100, 150), None, SizeSpec::Uniform(200, 250)),
    two_phase("w5", SizeSpec::Uniform(100, 150), Some(0.9), SizeSpec::Uniform(200, 250)),
    two_phase("w6", SizeSpec::Uniform(100, 200), Some(0.5), SizeSpec::Uniform(1000, 2000)),
    two_phase("w7", SizeSpec::Uniform(1000, 2000), Some(0.9), SizeSpec::Uniform(1500, 2500)),
    two_phase("w8", SizeSpec::Uniform(50, 150), Some(0.9), SizeSpec::Uniform(5000, 15000)),
    one_phase(
        "img",
        SizeSpec::Normal {
            mean: 15000.0,
            std_dev: 1000.0,
        },
    ),
    one_phase("stdin", SizeSpec::Input),
];

impl Workload {
    /// Looks up a workload by name.
    pub fn by_name(name: &str) -> Option<&'static Workload> {
        WORKLOADS.iter().find(|w| w.name == name)
    }

    /// Returns the names of all workloads.
    pub fn names() -> impl Iterator<Item = &'static str> {
        WORKLOADS.iter().map(|w| w.name)
    }

    /// Runs the workload against `set`, injecting `inject_bytes` in each
    /// phase. Input-driven sizes are read from standard input.
    ///
    /// Returns the number of objects injected.
    pub fn run<S: Subject>(&self, set: &mut LiveSet<S>, inject_bytes: usize) -> Result<usize, Error> {
        self.run_with_input(set, inject_bytes, io::stdin().lock())
    }

    /// Runs the workload, reading input-driven sizes from `input`.
    pub fn run_with_input<S, R>(
        &self,
        set: &mut LiveSet<S>,
        inject_bytes: usize,
        mut input: R,
    ) -> Result<usize, Error>
    where
        S: Subject,
        R: BufRead,
    {
        log::info!("{}: injecting {inject_bytes} bytes of {}", self.name, self.before);
        let seed = set.next_seed();
        let mut count = set.inject(self.before.generator(Some(seed), &mut input)?, inject_bytes)?;

        if let Some(frac) = self.drop {
            let bytes = (frac * set.max_live() as f64) as usize;
            let evicted = set.drop(bytes)?;
            log::info!("{}: dropped {evicted} objects", self.name);
        }

        if let Some(after) = self.after {
            log::info!("{}: injecting {inject_bytes} bytes of {after}", self.name);
            let seed = set.next_seed();
            count += set.inject(after.generator(Some(seed), &mut input)?, inject_bytes)?;
        }

        Ok(count)
    }
}
