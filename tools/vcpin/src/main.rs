// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod config;
mod virsh;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::EnvFilter;
use vcpin_utils::collect_guests;
use vcpin_utils::run_cycle;
use vcpin_utils::Hypervisor;
use vcpin_utils::Placement;
use vcpin_utils::Topology;

use config::Config;
use virsh::Virsh;

/// vcpin: topology-aware vCPU pinning for libvirt hosts
///
/// Every vCPU of every running guest is pinned to one physical core of the
/// host, and may run on all hyperthreads of that core. Guests are packed from
/// the highest numbered cores downwards in domain name order.
///
/// Unless --cli is given, vcpin keeps running and re-applies the pinning
/// periodically, picking up guests that were started or stopped.
#[derive(Debug, Parser)]
struct Opts {
    /// Enable debug logging. RUST_LOG takes precedence when set.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    debug: bool,

    /// Run a single pinning cycle and exit. The exit status is non-zero when
    /// the cycle failed, which makes it usable from cron.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    cli: bool,

    /// Output logs in JSON instead of text.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    jsonlog: bool,

    /// Configuration file. Defaults to /etc/vcpin/config.toml if it exists.
    #[clap(long)]
    config: Option<PathBuf>,

    /// libvirt connection URI (default: qemu:///system).
    #[clap(long)]
    connect: Option<String>,

    /// Delay between two pinning cycles in daemon mode (default: 300).
    #[clap(long)]
    interval_s: Option<u64>,

    /// Allow each vCPU on its whole core (sibling-group) or on one hardware
    /// thread only (single-thread).
    #[clap(long)]
    placement: Option<Placement>,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

impl Opts {
    fn apply_to(&self, config: &mut Config) {
        if let Some(uri) = &self.connect {
            config.uri = uri.clone();
        }
        if let Some(interval_s) = self.interval_s {
            config.interval_s = interval_s;
        }
        if let Some(placement) = self.placement {
            config.placement = placement;
        }
    }
}

fn init_logging(opts: &Opts) -> Result<()> {
    let level = if opts.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stdout)
        .with_target(false);
    let res = if opts.jsonlog {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|e| anyhow!("failed to init logger: {e}"))
}

struct Pinner {
    hv: Virsh,
    config: Config,
}

impl Pinner {
    /// Run one pinning cycle. Returns whether every vCPU got pinned; errors
    /// are reserved for failures that should stop the process.
    fn cycle(&self) -> Result<bool> {
        let topo = Topology::with_root(&self.config.sysfs_cpu_root)
            .context("Failed to read the host CPU topology")?;
        let host_threads = self
            .hv
            .count_host_threads()
            .context("Failed to query node info")?;
        debug!(cpus = host_threads, threads = topo.len(), "Node info");

        let guests = collect_guests(&self.hv).context("Failed to list active domains")?;

        match run_cycle(&self.hv, &guests, host_threads, &topo, self.config.placement) {
            Ok(report) => {
                for skipped in report.skipped.iter() {
                    error!(name = %skipped.guest, reason = %skipped.reason, "Domain left unpinned");
                }
                for failure in report.failures.iter() {
                    error!(
                        name = %failure.guest,
                        vcpu = failure.vcpu,
                        error = %failure.error,
                        "vCPU left unpinned"
                    );
                }
                info!(
                    guests = report.nr_guests,
                    pinned = report.nr_pinned,
                    failed = report.failures.len(),
                    skipped = report.skipped.len(),
                    "Pinning cycle done"
                );
                Ok(report.success())
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Pinning cycle aborted");
                Ok(false)
            }
            Err(e) => Err(e).context("Pinning cycle failed"),
        }
    }
}

/// Sleep for `intv` or until shutdown is requested, whichever comes first.
fn wait_next_cycle(intv: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + intv;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_secs(1)));
    }
}

/// Config file (or defaults) with the command line applied on top.
fn load_config(opts: &Opts) -> Result<Config> {
    let mut config = config::init_config(opts.config.as_deref())?;
    opts.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

fn run(opts: &Opts) -> Result<ExitCode> {
    let config = load_config(opts)?;
    debug!(config = ?config, "Effective configuration");

    let hv = Virsh::connect(&config.virsh, &config.uri)?;
    let pinner = Pinner { hv, config };

    if opts.cli {
        // Run once and exit. Easy to use within a crontab.
        return Ok(if pinner.cycle()? {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let intv = Duration::from_secs(pinner.config.interval_s);
    while !shutdown.load(Ordering::Relaxed) {
        if pinner.cycle()? {
            info!(
                "CPU pinning successful. Will check again in {}s.",
                intv.as_secs()
            );
        } else {
            info!(
                "CPU pinning failed. Will retry again in {}s.",
                intv.as_secs()
            );
        }
        wait_next_cycle(intv, &shutdown);
    }

    info!("Shutting down");
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let opts = Opts::parse();
    if opts.version {
        println!("vcpin {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    init_logging(&opts)?;
    debug!(opts = ?opts, "Parsed options");

    match run(&opts) {
        Ok(code) => Ok(code),
        Err(e) => {
            error!("{:#}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
