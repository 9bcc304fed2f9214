//! Builder-node composition root.
//!
//! Owns the queues, the memory pool, the admission flag and every stage
//! handle. Construction validates configuration and wires the stages with
//! narrow handles only; `stop()` encodes the teardown order that keeps the
//! shared-memory region valid until the last worker is joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tfd_core::channel::{OutputChannel, ReadoutChannel};
use tfd_core::config::{BuilderConfig, ReadoutConfig};
use tfd_core::error::Result;
use tfd_core::pool::MemoryPool;
use tfd_core::queue::ConcurrentFifo;
use tfd_core::stats::PipelineCounters;

use crate::assembly::AssemblyStage;
use crate::ingress::ReadoutInterface;
use crate::output::OutputStage;
use crate::sequencer::SequencerStage;
use crate::serializer::{InterleavedHdrDataSerializer, StfProcessorAdapter, StfSerializer};
use crate::telemetry::InfoStage;
use crate::{BundleQueue, StfQueue};

/// The running builder node.
pub struct StfBuilderDevice {
    running: Arc<AtomicBool>,
    accepting_data: Arc<AtomicBool>,
    pool: Arc<MemoryPool>,
    pipeline: Arc<PipelineCounters>,

    bundle_queue: BundleQueue,
    seq_queue: StfQueue,
    out_queue: StfQueue,

    ingress: Option<ReadoutInterface>,
    assembly: Option<AssemblyStage>,
    sequencer: Option<SequencerStage>,
    output: Option<OutputStage>,
    info: Option<InfoStage>,

    stopped: bool,
}

impl StfBuilderDevice {
    /// Validate the configuration and start every stage.
    ///
    /// `output` is `None` in standalone mode. Startup errors are returned to
    /// the caller; only the binary entry point turns them into an exit code.
    pub fn start(
        mut config: BuilderConfig,
        input: Box<dyn ReadoutChannel>,
        output: Option<Box<dyn OutputChannel>>,
    ) -> Result<Self> {
        config.validate()?;
        let readout = ReadoutConfig::from_builder(&config)?;

        info!(
            detector = ?config.detector,
            rdh_version = %readout.rdh_version,
            subspec_mode = ?readout.subspec_mode,
            "starting the SubTimeFrame builder"
        );
        if config.standalone && output.is_none() {
            warn!("standalone mode with no output: data will be dropped after accounting");
        }

        let running = Arc::new(AtomicBool::new(true));
        let accepting_data = Arc::new(AtomicBool::new(true));
        let pool = MemoryPool::new(config.region_size);
        let pipeline = Arc::new(PipelineCounters::new());

        let bundle_queue: BundleQueue = Arc::new(ConcurrentFifo::new());
        let (seq_queue, out_queue): (StfQueue, StfQueue) = match config.pipeline_bound() {
            Some(bound) => (
                Arc::new(ConcurrentFifo::bounded(bound)),
                Arc::new(ConcurrentFifo::bounded(bound)),
            ),
            None => (Arc::new(ConcurrentFifo::new()), Arc::new(ConcurrentFifo::new())),
        };

        let serializer: Option<Box<dyn StfSerializer>> = match (config.standalone, output) {
            (true, _) | (false, None) => None,
            (false, Some(channel)) => {
                if config.processor_enabled() {
                    info!(channel = channel.name(), "sending data to the processor bridge");
                    Some(Box::new(StfProcessorAdapter::new(channel)))
                } else {
                    info!(channel = channel.name(), "sending data in stream mode");
                    Some(Box::new(InterleavedHdrDataSerializer::new(channel)))
                }
            }
        };

        // Start sink-side first so queues always have a consumer.
        let output_stage = OutputStage::start(
            serializer,
            Arc::clone(&out_queue),
            Arc::clone(&pipeline),
            Arc::clone(&running),
            config.max_built_stfs,
        );
        let sequencer = SequencerStage::start(
            Arc::clone(&seq_queue),
            Arc::clone(&out_queue),
            Arc::clone(&pipeline),
            Arc::clone(&running),
            Arc::clone(&accepting_data),
        );
        let assembly = AssemblyStage::start(
            readout,
            Arc::clone(&bundle_queue),
            Arc::clone(&seq_queue),
            Arc::clone(&pool),
            Arc::clone(&pipeline),
            Arc::clone(&running),
            config.build_on_timeout,
        );
        let ingress = ReadoutInterface::start(
            input,
            Arc::clone(&bundle_queue),
            Arc::clone(&running),
            Arc::clone(&accepting_data),
            config.keep_decreasing_tf_ids,
        );
        let info = InfoStage::start(
            Arc::clone(&pipeline),
            Arc::clone(&pool),
            Arc::clone(&running),
        );

        info!("builder device started");
        Ok(Self {
            running,
            accepting_data,
            pool,
            pipeline,
            bundle_queue,
            seq_queue,
            out_queue,
            ingress: Some(ingress),
            assembly: Some(assembly),
            sequencer: Some(sequencer),
            output: Some(output_stage),
            info: Some(info),
            stopped: false,
        })
    }

    /// Pipeline statistics handle.
    pub fn pipeline(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.pipeline)
    }

    /// Ingress counters, when the ingress stage is alive.
    pub fn ingress_counters(&self) -> Option<Arc<crate::ingress::IngressCounters>> {
        self.ingress.as_ref().map(|i| i.counters())
    }

    /// Gate data admission without stopping the threads.
    pub fn set_accepting_data(&self, accepting: bool) {
        self.accepting_data.store(accepting, Ordering::SeqCst);
    }

    /// True until a stop was requested or the outbound stage finished.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Block until the device stops on its own or `timeout` elapses.
    ///
    /// Returns true when the device stopped (e.g. `max_built_stfs` reached).
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        true
    }

    /// Tear the pipeline down in dependency order.
    ///
    /// Order is part of the contract: stop pipeline admission, stop and join
    /// the input source, then each queue/stage pair downstream, the memory
    /// pool last. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        debug!("stopping the builder device");
        self.running.store(false, Ordering::SeqCst);
        self.accepting_data.store(false, Ordering::SeqCst);

        // Stop every pipeline queue up front: a stage blocked pushing into a
        // full bounded queue must be released before its join below.
        self.bundle_queue.stop();
        self.seq_queue.stop();
        self.out_queue.stop();

        // Joins strictly upstream to downstream: input source, builder,
        // sequencer, outbound.
        if let Some(mut ingress) = self.ingress.take() {
            ingress.stop();
        }
        if let Some(mut assembly) = self.assembly.take() {
            assembly.stop();
        }
        if let Some(mut sequencer) = self.sequencer.take() {
            sequencer.stop();
        }
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
        if let Some(mut info) = self.info.take() {
            info.stop();
        }

        // Drop anything still queued, releasing leases, then the pool.
        self.bundle_queue.clear();
        self.seq_queue.clear();
        self.out_queue.clear();
        self.pool.stop();

        info!(
            built = self.pipeline.built_total.load(Ordering::Relaxed),
            sent = self.pipeline.sent_total.load(Ordering::Relaxed),
            dropped = self.pipeline.dropped_total.load(Ordering::Relaxed),
            "builder device stopped"
        );
    }
}

impl Drop for StfBuilderDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
