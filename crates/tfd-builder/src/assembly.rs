//! Assembly stage: HbfBundles in, finished SubTimeFrames out.
//!
//! Exactly one builder worker is active per node; it owns the in-progress
//! STF. Bundles are segmented into runs of equal subspecification and each
//! run is inserted as one equipment group. The end-of-TF marker (or a stale
//! timeout, or a missed marker detected by an id change) finalizes the STF
//! onto the sequencer queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use tfd_core::config::ReadoutConfig;
use tfd_core::detector::DataOrigin;
use tfd_core::pool::{MemoryPool, PooledMessage};
use tfd_core::queue::PopResult;
use tfd_core::rdh::{is_empty_hbf, sanity_check_hbf, RdhReader, RdhVersion, SanityCheckMode};
use tfd_core::readout::ReadoutMsgHeader;
use tfd_core::stats::{LogRatelimit, PipelineCounters};
use tfd_core::stf::{EquipmentIdentifier, StfAccumulator};

use crate::{BundleQueue, HbfBundle, StfQueue};

/// How long the builder waits for input before treating the TF as stale.
const STF_DATA_WAIT: Duration = Duration::from_secs(2);

/// Counters exported by the assembly stage.
#[derive(Default)]
pub struct AssemblyCounters {
    /// HBFs inserted into STFs.
    pub inserted_hbfs: AtomicU64,
    /// HBFs removed by the sanity check or the empty-trigger filter.
    pub filtered_hbfs: AtomicU64,
    /// Bundles abandoned on an RDH parse failure.
    pub abandoned_bundles: AtomicU64,
    /// Partial STFs dropped on a stale timeout.
    pub timeout_dropped_stfs: AtomicU64,
}

/// Handle of the running assembly worker.
pub struct AssemblyStage {
    running: Arc<AtomicBool>,
    counters: Arc<AssemblyCounters>,
    input: BundleQueue,
    thread: Option<JoinHandle<()>>,
}

impl AssemblyStage {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        readout: ReadoutConfig,
        input: BundleQueue,
        output: StfQueue,
        pool: Arc<MemoryPool>,
        pipeline: Arc<PipelineCounters>,
        running: Arc<AtomicBool>,
        build_on_timeout: bool,
    ) -> Self {
        let counters = Arc::new(AssemblyCounters::default());
        let worker = Worker {
            readout,
            input: Arc::clone(&input),
            output,
            pipeline,
            counters: Arc::clone(&counters),
            running: Arc::clone(&running),
            build_on_timeout,
            accumulator: StfAccumulator::new(pool),
            started: false,
            last_finalized: Instant::now(),
            bundle_log: LogRatelimit::new(Duration::from_secs(1)),
            rdh_log: LogRatelimit::new(Duration::from_secs(1)),
            mismatch_log: LogRatelimit::new(Duration::from_secs(10)),
            accounting_log: LogRatelimit::new(Duration::from_millis(500)),
        };

        let thread = thread::Builder::new()
            .name("stfb-builder".into())
            .spawn(move || worker.run())
            .expect("failed to spawn the assembly thread");

        Self {
            running,
            counters,
            input,
            thread: Some(thread),
        }
    }

    pub fn counters(&self) -> Arc<AssemblyCounters> {
        Arc::clone(&self.counters)
    }

    /// Stop the builder input queue and wait for the worker.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.input.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("assembly stage stopped");
    }
}

impl Drop for AssemblyStage {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    readout: ReadoutConfig,
    input: BundleQueue,
    output: StfQueue,
    pipeline: Arc<PipelineCounters>,
    counters: Arc<AssemblyCounters>,
    running: Arc<AtomicBool>,
    build_on_timeout: bool,
    accumulator: StfAccumulator,
    started: bool,
    last_finalized: Instant,
    bundle_log: LogRatelimit,
    rdh_log: LogRatelimit,
    mismatch_log: LogRatelimit,
    accounting_log: LogRatelimit,
}

impl Worker {
    fn run(mut self) {
        let after_stop_log = LogRatelimit::new(Duration::from_secs(1));
        let mut after_stop_bundles: u64 = 0;

        loop {
            match self.input.pop_wait_for(STF_DATA_WAIT) {
                PopResult::Stopped => break,
                PopResult::Timeout => {
                    if !self.running.load(Ordering::Relaxed) {
                        break;
                    }
                    if self.started && self.accumulator.current_stf_id().is_some() {
                        self.finish_on_timeout();
                    }
                }
                PopResult::Item(bundle) => {
                    if !self.running.load(Ordering::Relaxed) {
                        after_stop_bundles += 1;
                        if after_stop_log.check() {
                            warn!(
                                after_stop_bundles,
                                "building SubTimeFrames after the stop signal"
                            );
                        }
                    }
                    if self.process_bundle(bundle).is_err() {
                        // Pool stopped: nothing further can be built.
                        break;
                    }
                }
            }
        }

        debug!("exiting the assembly thread");
    }

    fn finish_on_timeout(&mut self) {
        if self.build_on_timeout {
            if let Some(id) = self.accumulator.current_stf_id() {
                warn!(stf_id = id, "finishing SubTimeFrame on a timeout");
            }
            self.finish_current();
        } else {
            // Drop the partial build and flag the stall in the timing EMA.
            if let Some(stf) = self.accumulator.take() {
                self.counters
                    .timeout_dropped_stfs
                    .fetch_add(1, Ordering::Relaxed);
                self.pipeline.dropped_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stf_id = stf.id(),
                    size = stf.data_size(),
                    "dropping a stale partial SubTimeFrame"
                );
            }
            self.pipeline.stf_time.penalize_double();
        }
    }

    /// Queue the completed STF and restart the inter-STF clock.
    fn finish_current(&mut self) {
        match self.accumulator.take() {
            Some(stf) => {
                self.pipeline.built_total.fetch_add(1, Ordering::Relaxed);
                self.pipeline.stfs_in_pipeline.fetch_add(1, Ordering::Relaxed);
                self.pipeline
                    .stf_time
                    .update(self.last_finalized.elapsed().as_secs_f64());
                self.last_finalized = Instant::now();
                if !self.output.push(stf) {
                    self.pipeline.stfs_in_pipeline.fetch_sub(1, Ordering::Relaxed);
                }
            }
            None => {
                // Everything in this TF was invalid; bookkeeping only.
                self.pipeline.stf_time.penalize_double();
            }
        }
    }

    fn process_bundle(&mut self, mut bundle: HbfBundle) -> Result<(), ()> {
        if bundle.is_empty() {
            if self.bundle_log.check() {
                error!("empty readout multipart");
            }
            return Ok(());
        }

        self.started = true;

        let Some(header) = ReadoutMsgHeader::parse(&bundle[0].data) else {
            if self.bundle_log.check() {
                error!("readout multipart without a parseable header");
            }
            return Ok(());
        };

        if bundle.len() == 1 && !header.last_tf_message() {
            if self.bundle_log.check() {
                error!(
                    stf_id = header.time_frame_id,
                    "received only a header message without the STF stop bit set"
                );
            }
            return Ok(());
        }

        // First-HBF link check; a mismatch is logged, not fatal.
        if bundle.len() > 1 && header.is_rdh_format() {
            match RdhReader::new(self.readout.rdh_version, &bundle[1].data) {
                Ok(rdh) => {
                    if rdh.link_id() != header.link_id && self.mismatch_log.check() {
                        error!(
                            hdr_link_id = header.link_id,
                            rdh_link_id = rdh.link_id(),
                            "update link id does not match the RDH in the data block"
                        );
                    }
                }
                Err(e) => {
                    if self.rdh_log.check() {
                        error!(error = %e, "cannot parse the RDH of the first HBF");
                    }
                    self.counters
                        .abandoned_bundles
                        .fetch_add(1, Ordering::Relaxed);
                    self.pipeline.dropped_total.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }

        let bundle_id = header.time_frame_id as u64;
        if let Some(in_building) = self.accumulator.current_stf_id() {
            if in_building != bundle_id {
                // The previous lastTfMessage was missed.
                error!(
                    current_id = in_building,
                    new_id = bundle_id,
                    "update with a new STF id but no stop flag for the current STF"
                );
                self.finish_current();
            }
        }

        let finish_after = header.last_tf_message();
        if bundle.len() > 1 {
            bundle.remove(0); // the header part is not forwarded
            self.insert_hbfs(bundle_id, header.link_id, bundle)?;
        }

        if finish_after {
            self.finish_current();
        }
        Ok(())
    }

    /// Walk the HBF list, flushing runs of equal subspecification.
    fn insert_hbfs(&mut self, stf_id: u64, link_id: u8, hbfs: Vec<PooledMessage>) -> Result<(), ()> {
        let total = hbfs.len();
        let mut inserted = 0usize;
        let mut filtered = 0usize;
        let mut error_while_adding = false;

        let mut origin: Option<DataOrigin> = None;
        let mut orbit = 0u32;
        let mut run_subspec: Option<u32> = None;
        let mut run: Vec<PooledMessage> = Vec::with_capacity(total);

        for (index, msg) in hbfs.into_iter().enumerate() {
            let rdh = match RdhReader::new(self.readout.rdh_version, &msg.data) {
                Ok(rdh) => rdh,
                Err(e) => {
                    if self.rdh_log.check() {
                        error!(index, error = %e, "cannot parse the RDH of a received HBF");
                    }
                    // Abandon the rest of the bundle, current run included.
                    error_while_adding = true;
                    self.counters
                        .abandoned_bundles
                        .fetch_add(1, Ordering::Relaxed);
                    self.pipeline.dropped_total.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };

            if origin.is_none() {
                origin = Some(self.data_origin(&rdh));
                orbit = rdh.orbit();
            }

            if self.filter_hbf(&msg, index) {
                filtered += 1;
                continue;
            }

            let subspec = rdh.subspecification(self.readout.subspec_mode);
            match run_subspec {
                Some(current) if current != subspec => {
                    if self.mismatch_log.check() {
                        warn!(
                            run_subspec = format_args!("{current:#06x}"),
                            block = index,
                            block_subspec = format_args!("{subspec:#06x}"),
                            "update with mismatched subspecifications"
                        );
                    }
                    inserted += self.flush_run(
                        stf_id,
                        origin.expect("origin set with the first HBF"),
                        current,
                        link_id,
                        orbit,
                        std::mem::take(&mut run),
                    )?;
                    run_subspec = Some(subspec);
                }
                Some(_) => {}
                None => run_subspec = Some(subspec),
            }
            run.push(msg);
        }

        if !error_while_adding {
            if let (Some(subspec), Some(origin)) = (run_subspec, origin) {
                inserted += self.flush_run(stf_id, origin, subspec, link_id, orbit, run)?;
            }
            if inserted + filtered != total && self.accounting_log.check() {
                error!(inserted, filtered, total, "not all received HBFrames added to the STF");
            }
        }

        self.counters
            .inserted_hbfs
            .fetch_add(inserted as u64, Ordering::Relaxed);
        self.counters
            .filtered_hbfs
            .fetch_add(filtered as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Apply the sanity check and the empty-trigger filter to one HBF.
    ///
    /// Returns true when the HBF must be skipped.
    fn filter_hbf(&self, msg: &PooledMessage, index: usize) -> bool {
        match self.readout.sanity_check {
            SanityCheckMode::Off => {}
            mode => {
                if let Err(e) = sanity_check_hbf(self.readout.rdh_version, &msg.data) {
                    if self.rdh_log.check() {
                        warn!(index, error = %e, "RDH sanity check failed");
                    }
                    if mode == SanityCheckMode::Drop {
                        return true;
                    }
                }
            }
        }

        if self.readout.filter_empty_trigger_hbf
            && self.readout.rdh_version == RdhVersion::V4
            && is_empty_hbf(&msg.data)
        {
            return true;
        }
        false
    }

    fn flush_run(
        &mut self,
        stf_id: u64,
        origin: DataOrigin,
        subspec: u32,
        link_id: u8,
        orbit: u32,
        run: Vec<PooledMessage>,
    ) -> Result<usize, ()> {
        let equipment = EquipmentIdentifier {
            origin,
            subspec: self.readout.effective_subspec(subspec),
            link_id,
        };
        match self.accumulator.add_hbf_run(stf_id, equipment, orbit, run) {
            Ok(count) => Ok(count),
            Err(_) => {
                // The pool only fails once stopped; shut the stage down.
                warn!("memory pool stopped while inserting HBFs");
                Err(())
            }
        }
    }

    /// Detector tag for the data: configured value, or the RDHv6 source id.
    fn data_origin(&self, rdh: &RdhReader<'_>) -> DataOrigin {
        if let Some(detector) = self.readout.detector {
            return detector;
        }
        rdh.source_id()
            .and_then(DataOrigin::from_source_id)
            .unwrap_or_else(|| {
                if self.rdh_log.check() {
                    warn!("RDH carries no known source id; tagging as TST");
                }
                DataOrigin::Tst
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tfd_core::config::ReadoutConfig;
    use tfd_core::queue::ConcurrentFifo;
    use tfd_core::rdh::{RdhFrame, SubSpecMode};
    use tfd_core::stf::StfOrigin;

    fn readout_config() -> ReadoutConfig {
        ReadoutConfig {
            rdh_version: RdhVersion::V6,
            detector: Some(DataOrigin::Tst),
            subspec_mode: SubSpecMode::CruLinkId,
            sanity_check: SanityCheckMode::Off,
            filter_empty_trigger_hbf: false,
            fee_id_mask: u32::MAX,
        }
    }

    fn header_part(tf_id: u32, link: u8, last: bool) -> PooledMessage {
        let hdr = ReadoutMsgHeader::new(tf_id, link, last, true);
        PooledMessage::unpooled(Bytes::copy_from_slice(&hdr.encode()))
    }

    fn hbf_part(cru: u16, link: u8) -> PooledMessage {
        let frame = RdhFrame::single_page(RdhVersion::V6, cru, link, 0, 10);
        PooledMessage::unpooled(Bytes::copy_from_slice(&frame.encode()))
    }

    struct Fixture {
        input: BundleQueue,
        output: StfQueue,
        stage: AssemblyStage,
        pipeline: Arc<PipelineCounters>,
    }

    fn start_stage(cfg: ReadoutConfig, build_on_timeout: bool) -> Fixture {
        let input: BundleQueue = Arc::new(ConcurrentFifo::new());
        let output: StfQueue = Arc::new(ConcurrentFifo::new());
        let pipeline = Arc::new(PipelineCounters::new());
        let stage = AssemblyStage::start(
            cfg,
            Arc::clone(&input),
            Arc::clone(&output),
            MemoryPool::new(1 << 24),
            Arc::clone(&pipeline),
            Arc::new(AtomicBool::new(true)),
            build_on_timeout,
        );
        Fixture {
            input,
            output,
            stage,
            pipeline,
        }
    }

    fn pop_stf(fixture: &Fixture) -> tfd_core::stf::SubTimeFrame {
        fixture
            .output
            .pop_wait_for(Duration::from_secs(2))
            .into_item()
            .expect("an STF should have been produced")
    }

    #[test]
    fn test_single_bundle_builds_one_stf() {
        let mut f = start_stage(readout_config(), false);
        f.input.push(vec![
            header_part(42, 3, true),
            hbf_part(0, 3),
            hbf_part(0, 3),
            hbf_part(0, 3),
        ]);

        let stf = pop_stf(&f);
        assert_eq!(stf.id(), 42);
        assert_eq!(stf.origin(), StfOrigin::Readout);
        assert_eq!(stf.groups().len(), 1);
        assert_eq!(stf.hbf_count(), 3);
        assert_eq!(f.pipeline.built_total.load(Ordering::Relaxed), 1);
        f.stage.stop();
    }

    #[test]
    fn test_subspec_runs_split_groups() {
        let mut f = start_stage(readout_config(), false);
        // Subspec pattern A A B A across one bundle.
        f.input.push(vec![
            header_part(7, 1, true),
            hbf_part(0xa, 1),
            hbf_part(0xa, 1),
            hbf_part(0xb, 1),
            hbf_part(0xa, 1),
        ]);

        let stf = pop_stf(&f);
        assert_eq!(stf.id(), 7);
        let groups = stf.groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].hbfs.len(), 2);
        assert_eq!(groups[1].hbfs.len(), 1);
        assert_eq!(groups[2].hbfs.len(), 1);
        assert_eq!(
            f.stage.counters().inserted_hbfs.load(Ordering::Relaxed),
            4
        );
        f.stage.stop();
    }

    #[test]
    fn test_missed_terminator_forces_finalize() {
        let mut f = start_stage(readout_config(), false);
        f.input.push(vec![header_part(50, 1, false), hbf_part(1, 1)]);
        f.input.push(vec![header_part(50, 1, false), hbf_part(1, 1)]);
        f.input.push(vec![header_part(51, 1, true), hbf_part(1, 1)]);

        let first = pop_stf(&f);
        assert_eq!(first.id(), 50);
        assert_eq!(first.hbf_count(), 2);
        let second = pop_stf(&f);
        assert_eq!(second.id(), 51);
        f.stage.stop();
    }

    #[test]
    fn test_fee_id_masking_applied() {
        let cfg = ReadoutConfig {
            subspec_mode: SubSpecMode::FeeId,
            fee_id_mask: 0x00f0,
            ..readout_config()
        };
        let mut f = start_stage(cfg, false);
        let frame = RdhFrame {
            fee_id: 0xbeef,
            ..RdhFrame::single_page(RdhVersion::V6, 0, 1, 0xbeef, 0)
        };
        f.input.push(vec![
            header_part(1, 1, true),
            PooledMessage::unpooled(Bytes::copy_from_slice(&frame.encode())),
        ]);

        let stf = pop_stf(&f);
        assert_eq!(stf.groups()[0].equipment.subspec, 0xbeef & 0x00f0);
        f.stage.stop();
    }

    #[test]
    fn test_header_only_without_marker_skipped() {
        let mut f = start_stage(readout_config(), false);
        f.input.push(vec![header_part(5, 1, false)]);
        f.input.push(vec![header_part(6, 1, true), hbf_part(1, 1)]);
        let stf = pop_stf(&f);
        assert_eq!(stf.id(), 6);
        f.stage.stop();
    }

    #[test]
    fn test_bad_rdh_abandons_bundle() {
        let mut f = start_stage(readout_config(), false);
        f.input.push(vec![
            header_part(9, 1, true),
            PooledMessage::unpooled(Bytes::from_static(&[0u8; 16])), // too short
        ]);
        // The bundle is abandoned; the finalize still runs but yields nothing.
        f.input.push(vec![header_part(10, 1, true), hbf_part(1, 1)]);
        let stf = pop_stf(&f);
        assert_eq!(stf.id(), 10);
        assert_eq!(
            f.stage.counters().abandoned_bundles.load(Ordering::Relaxed),
            1
        );
        f.stage.stop();
    }

    #[test]
    fn test_sanity_check_drop_filters_hbf() {
        let cfg = ReadoutConfig {
            sanity_check: SanityCheckMode::Drop,
            ..readout_config()
        };
        let mut f = start_stage(cfg, false);
        let mut bad = RdhFrame::single_page(RdhVersion::V6, 1, 1, 0, 0);
        bad.stop = false; // missing stop bit fails the page walk
        f.input.push(vec![
            header_part(3, 1, true),
            hbf_part(1, 1),
            PooledMessage::unpooled(Bytes::copy_from_slice(&bad.encode())),
        ]);

        let stf = pop_stf(&f);
        assert_eq!(stf.hbf_count(), 1);
        assert_eq!(f.stage.counters().filtered_hbfs.load(Ordering::Relaxed), 1);
        f.stage.stop();
    }
}
