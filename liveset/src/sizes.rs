//! Object size generators.
//!
//! A generator is any `Iterator<Item = u32>`. Returning `None` signals that
//! the generator is exhausted.

use std::{f64::consts::TAU, io::BufRead, iter};

use rand::{distributions, rngs::StdRng, Rng, SeedableRng};

use crate::Error;

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Returns a generator which yields `size` forever.
pub fn constant(size: u32) -> iter::Repeat<u32> {
    iter::repeat(size)
}

/// Sizes drawn uniformly from an inclusive range.
#[derive(Debug)]
pub struct Uniform {
    dist: distributions::Uniform<u32>,
    rng: StdRng,
}

impl Uniform {
    /// Constructs a generator over `lo..=hi`, seeded from system entropy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `lo > hi`.
    pub fn new(lo: u32, hi: u32) -> Result<Uniform, Error> {
        Self::with_seed(lo, hi, None)
    }

    /// Constructs a generator over `lo..=hi` with an optional fixed seed.
    pub fn with_seed(lo: u32, hi: u32, seed: Option<u64>) -> Result<Uniform, Error> {
        if lo > hi {
            return Err(Error::InvalidConfiguration(format!(
                "empty size range {lo}..={hi}"
            )));
        }

        Ok(Uniform {
            dist: distributions::Uniform::new_inclusive(lo, hi),
            rng: rng_from(seed),
        })
    }
}

impl Iterator for Uniform {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        Some(self.rng.sample(self.dist))
    }
}

/// Sizes drawn from a normal distribution, rounded and clamped to
/// `1..=u32::MAX`.
#[derive(Debug)]
pub struct Normal {
    mean: f64,
    std_dev: f64,
    rng: StdRng,
    /// The second variate of the last Box-Muller pair.
    spare: Option<f64>,
}

impl Normal {
    /// Constructs a generator seeded from system entropy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if either parameter is not finite or
    /// `std_dev` is negative.
    pub fn new(mean: f64, std_dev: f64) -> Result<Normal, Error> {
        Self::with_seed(mean, std_dev, None)
    }

    /// Constructs a generator with an optional fixed seed.
    pub fn with_seed(mean: f64, std_dev: f64, seed: Option<u64>) -> Result<Normal, Error> {
        if !mean.is_finite() || !std_dev.is_finite() || std_dev < 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "bad normal parameters: mean {mean}, std_dev {std_dev}"
            )));
        }

        Ok(Normal {
            mean,
            std_dev,
            rng: rng_from(seed),
            spare: None,
        })
    }

    fn standard(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }

        // `gen` yields [0, 1); flip it so the logarithm stays finite.
        let u1 = 1.0 - self.rng.gen::<f64>();
        let u2 = self.rng.gen::<f64>();
        let r = (-2.0 * u1.ln()).sqrt();

        self.spare = Some(r * (TAU * u2).sin());
        r * (TAU * u2).cos()
    }
}

impl Iterator for Normal {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let x = self.mean + self.std_dev * self.standard();
        Some(x.round().clamp(1.0, u32::MAX as f64) as u32)
    }
}

/// Sizes read as newline-delimited decimal integers.
///
/// Blank lines are skipped. The generator is exhausted at end of input or at
/// the first line that is not a valid size.
#[derive(Debug)]
pub struct LineSizes<R> {
    reader: R,
    line: String,
    lineno: usize,
}

impl<R: BufRead> LineSizes<R> {
    /// Constructs a generator reading from `reader`.
    pub fn new(reader: R) -> LineSizes<R> {
        LineSizes {
            reader,
            line: String::new(),
            lineno: 0,
        }
    }
}

impl<R: BufRead> Iterator for LineSizes<R> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            self.line.clear();
            self.lineno += 1;

            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => (),
                Err(e) => {
                    log::warn!("line {}: read failed: {e}", self.lineno);
                    return None;
                }
            }

            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }

            return match text.parse() {
                Ok(size) => Some(size),
                Err(e) => {
                    log::warn!("line {}: bad size {text:?}: {e}", self.lineno);
                    None
                }
            };
        }
    }
}
