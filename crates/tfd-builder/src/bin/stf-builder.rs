//! SubTimeFrame builder daemon.
//!
//! Wires the configuration, the readout source and the output channel into
//! a [`StfBuilderDevice`] and runs it. Without a deployed transport this
//! binary drives the pipeline from the built-in mock readout source, which
//! makes it a self-contained smoke run:
//!
//! ```bash
//! DATADIST_RDH_VERSION=6 stf-builder --mock-tfs 500 --run-seconds 30
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tfd_builder::device::StfBuilderDevice;
use tfd_builder::mock::{MockReadout, MockReadoutConfig};
use tfd_core::channel::mem::output_pair;
use tfd_core::channel::OutputChannel;
use tfd_core::config::BuilderConfig;
use tfd_core::rdh::RdhVersion;

/// SubTimeFrame builder node.
#[derive(Parser, Debug)]
#[command(name = "stf-builder", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run without an output channel (overrides the config file).
    #[arg(long)]
    standalone: bool,

    /// Number of TFs the mock readout source generates.
    #[arg(long, default_value_t = 100)]
    mock_tfs: u32,

    /// HBFs generated per TF.
    #[arg(long, default_value_t = 8)]
    mock_hbfs: usize,

    /// Stop after this many seconds if the device is still running.
    #[arg(long, default_value_t = 30)]
    run_seconds: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format_args!("{e:#}"), "startup failed");
            // Give log collectors a chance to pick the message up.
            std::thread::sleep(Duration::from_secs(1));
            ExitCode::from(255)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = BuilderConfig::load(cli.config.as_deref())
        .context("loading the builder configuration")?;
    if cli.standalone {
        config.standalone = true;
    }

    let rdh_version = config.rdh_version.unwrap_or(RdhVersion::V6);
    let source = MockReadout::new(MockReadoutConfig {
        tf_count: cli.mock_tfs,
        hbfs_per_tf: cli.mock_hbfs,
        rdh_version,
        ..MockReadoutConfig::default()
    });

    // Without a deployed transport the output channel is an in-process
    // loopback that drains and drops the serialized bursts.
    let output: Option<Box<dyn OutputChannel>> = if config.standalone {
        None
    } else {
        let (channel, sink) = output_pair(&config.output_channel);
        std::thread::Builder::new()
            .name("out-drain".into())
            .spawn(move || loop {
                // Bursts are dropped on receipt; exits with the process.
                let _ = sink.recv_timeout(Duration::from_millis(500));
            })
            .context("spawning the output drain")?;
        Some(Box::new(channel))
    };

    let mut device = StfBuilderDevice::start(config, Box::new(source), output)
        .context("starting the builder device")?;

    if device.wait_for_exit(Duration::from_secs(cli.run_seconds)) {
        info!("device finished");
    } else {
        info!(seconds = cli.run_seconds, "run time elapsed, stopping");
    }
    device.stop();
    Ok(())
}
