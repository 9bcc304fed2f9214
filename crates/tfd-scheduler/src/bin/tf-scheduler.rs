//! TimeFrame scheduler daemon.
//!
//! Starts the registry and housekeeping and runs the placement loop.
//! Without a deployed RPC transport this binary exercises the scheduler
//! against a simulated fleet, which makes it a self-contained smoke run:
//!
//! ```bash
//! tf-scheduler --builders 4 --tfs 1000
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tfd_core::config::SchedulerConfig;
use tfd_core::error::DataDistError;
use tfd_proto::{BasicInfo, BuildTfResponse, BuildTfStatus, TfBuilderUpdateMessage, TfBuildingInformation};
use tfd_scheduler::{TfBuilderConnection, TfBuilderRegistry, TfSchedulerInstance};

/// TimeFrame scheduler.
#[derive(Parser, Debug)]
#[command(name = "tf-scheduler", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated TF builders.
    #[arg(long, default_value_t = 4)]
    builders: u32,

    /// Simulated per-builder buffer size in bytes.
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    buffer_size: u64,

    /// Number of TFs to schedule before exiting.
    #[arg(long, default_value_t = 1000)]
    tfs: u64,

    /// Announced size of each TF in bytes.
    #[arg(long, default_value_t = 512 * 1024)]
    tf_size: u64,
}

/// Fleet stand-in: accepts every request and mirrors the buffer accounting
/// back through periodic updates.
struct SimulatedFleet {
    buffer_size: u64,
    used: Mutex<std::collections::HashMap<String, u64>>,
}

impl SimulatedFleet {
    fn new(buffer_size: u64) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            used: Mutex::new(Default::default()),
        })
    }

    fn update_for(&self, id: &str) -> TfBuilderUpdateMessage {
        let used = self.used.lock().get(id).copied().unwrap_or(0);
        TfBuilderUpdateMessage {
            info: Some(BasicInfo {
                process_id: id.into(),
                partition_id: "standalone".into(),
            }),
            buffer_size: self.buffer_size,
            free_memory: self.buffer_size.saturating_sub(used),
            num_buffered_tfs: 0,
            last_built_tf_id: 0,
        }
    }

    /// A TF leaves a builder's buffer (aggregation finished downstream).
    fn drain(&self, amount: u64) {
        let mut used = self.used.lock();
        for value in used.values_mut() {
            *value = value.saturating_sub(amount);
        }
    }
}

impl TfBuilderConnection for SimulatedFleet {
    fn build_tf_request(
        &self,
        builder_id: &str,
        request: &TfBuildingInformation,
    ) -> Result<BuildTfResponse, DataDistError> {
        let mut used = self.used.lock();
        let entry = used.entry(builder_id.to_owned()).or_insert(0);
        if *entry + request.tf_size > self.buffer_size {
            return Ok(BuildTfResponse::with_status(BuildTfStatus::ErrorNomem));
        }
        *entry += request.tf_size;
        Ok(BuildTfResponse::with_status(BuildTfStatus::Ok))
    }
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
            std::thread::sleep(Duration::from_secs(1));
            ExitCode::from(255)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = SchedulerConfig::load(cli.config.as_deref())
        .context("loading the scheduler configuration")?;
    let required = cli.tf_size + cli.tf_size * config.overestimate_percent / 100;
    anyhow::ensure!(
        required <= cli.buffer_size,
        "tf_size plus the overestimate margin ({required} B) exceeds the builder buffer ({} B)",
        cli.buffer_size
    );

    let registry = TfBuilderRegistry::new(config);
    registry.start();

    let fleet = SimulatedFleet::new(cli.buffer_size);
    let instance = TfSchedulerInstance::new(Arc::clone(&registry), Arc::clone(&fleet) as _);

    let builder_ids: Vec<String> = (0..cli.builders).map(|n| format!("tfb-{n:02}")).collect();
    for id in &builder_ids {
        instance.update_tf_builder_info(fleet.update_for(id));
    }
    info!(builders = builder_ids.len(), "simulated fleet registered");

    let mut scheduled = 0u64;
    let mut tf_id = 1u64;
    while scheduled < cli.tfs {
        if instance.schedule_tf(tf_id, cli.tf_size) {
            scheduled += 1;
            tf_id += 1;
        } else {
            // No capacity: drain the fleet a little and refresh heartbeats.
            fleet.drain(cli.tf_size * 2);
            for id in &builder_ids {
                instance.update_tf_builder_info(fleet.update_for(id));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    info!(
        scheduled = instance
            .counters()
            .scheduled_tfs
            .load(std::sync::atomic::Ordering::Relaxed),
        deferred = instance
            .counters()
            .deferred_tfs
            .load(std::sync::atomic::Ordering::Relaxed),
        "scheduling run finished"
    );
    registry.stop();
    Ok(())
}
