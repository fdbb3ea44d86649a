//! # wss-bench
//!
//! Drives an allocator with a named live-working-set workload and prints the
//! resulting memory efficiency.
//!
//! ## Usage
//! ```bash
//! # 10 GiB live, 50 GiB injected per phase, against the system allocator
//! wss-bench w3 10240 51200
//!
//! # The same workload against the buddy allocator, measuring RSS
//! wss-bench w3 512 2048 --allocator buddy --measure rss
//!
//! # Sizes from a file
//! wss-bench stdin 64 256 < sizes.txt
//! ```

use std::process::ExitCode;

use clap::{error::ErrorKind, Parser};
use liveset::{Measure, Report, Workload, DEFAULT_SLOTS};
use wss_alloc::{buddy::MAX_POWER, cache::DEFAULT_GROWTH};
use wss_bench::{AllocatorKind, RunConfig};

#[derive(Parser)]
#[command(
    name = "wss-bench",
    about = "Measures allocator memory efficiency under live-working-set workloads",
    version
)]
struct Cli {
    /// Workload to run: w1 through w8, img, or stdin.
    workload: String,

    /// Live-byte budget in MiB.
    live_wss_mib: usize,

    /// Bytes injected per workload phase, in MiB.
    inject_wss_mib: usize,

    /// Allocator under test.
    #[arg(short, long, value_enum, default_value_t = AllocatorKind::System)]
    allocator: AllocatorKind,

    /// Size of the buddy region, as a power of two.
    #[arg(long, default_value_t = MAX_POWER)]
    buddy_power: usize,

    /// Growth factor between cache sizes.
    #[arg(long, default_value_t = DEFAULT_GROWTH)]
    cache_growth: f64,

    /// Number of objects the live set can track.
    #[arg(long, default_value_t = DEFAULT_SLOTS)]
    slots: usize,

    /// Seed for eviction and size generation.
    #[arg(long)]
    seed: Option<u64>,

    /// Process counter to report: vm or rss.
    #[arg(long, default_value = "vm")]
    measure: Measure,

    /// Omit the header row.
    #[arg(long)]
    no_header: bool,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    init_logging(cli.verbose);

    let Some(workload) = Workload::by_name(&cli.workload) else {
        let names: Vec<_> = Workload::names().collect();
        eprintln!(
            "error: unknown workload {:?} (expected one of: {})",
            cli.workload,
            names.join(", ")
        );
        return ExitCode::from(1);
    };

    let config = RunConfig {
        allocator: cli.allocator,
        workload,
        live_mib: cli.live_wss_mib,
        inject_mib: cli.inject_wss_mib,
        buddy_power: cli.buddy_power,
        cache_growth: cli.cache_growth,
        slots: cli.slots,
        seed: cli.seed,
        measure: cli.measure,
    };
    log::debug!("{config:?}");

    match wss_bench::run(&config) {
        Ok(report) => {
            if !cli.no_header {
                println!("{}", Report::HEADER);
            }
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
