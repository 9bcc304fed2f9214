//! Sequencer stage: strictly monotone, gap-free STF id stream.
//!
//! Input ids are monotone-within-source but may skip. Duplicates and
//! regressions are rejected; small gaps are filled with synthetic empty
//! STFs; large gaps are forwarded with a warning only (filling them would
//! flood the pipeline).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use tfd_core::queue::PopResult;
use tfd_core::stats::{LogRatelimit, PipelineCounters};
use tfd_core::stf::{StfOrigin, SubTimeFrame};

use crate::StfQueue;

/// Largest gap the sequencer fills with synthetic STFs: two seconds worth
/// of STFs at nominal rate.
pub const MAX_MISSING_STFS_FOR_SEQ: u64 = 2 * 11234 / 256;

const SEQ_WAIT: Duration = Duration::from_millis(500);

/// Counters exported by the sequencer stage.
#[derive(Default)]
pub struct SequencerCounters {
    /// STFs rejected as duplicates or id regressions.
    pub rejected_stfs: AtomicU64,
    /// Synthetic empty STFs inserted to fill gaps.
    pub filled_stfs: AtomicU64,
    /// Gaps too large to fill.
    pub large_gaps: AtomicU64,
}

/// Handle of the running sequencer worker.
pub struct SequencerStage {
    running: Arc<AtomicBool>,
    counters: Arc<SequencerCounters>,
    input: StfQueue,
    thread: Option<JoinHandle<()>>,
}

impl SequencerStage {
    pub fn start(
        input: StfQueue,
        output: StfQueue,
        pipeline: Arc<PipelineCounters>,
        running: Arc<AtomicBool>,
        accepting_data: Arc<AtomicBool>,
    ) -> Self {
        let counters = Arc::new(SequencerCounters::default());
        let worker_counters = Arc::clone(&counters);
        let worker_running = Arc::clone(&running);
        let worker_input = Arc::clone(&input);

        let thread = thread::Builder::new()
            .name("stfb-seq".into())
            .spawn(move || {
                sequencer_loop(
                    &worker_input,
                    &output,
                    &pipeline,
                    &worker_running,
                    &accepting_data,
                    &worker_counters,
                );
            })
            .expect("failed to spawn the sequencer thread");

        Self {
            running,
            counters,
            input,
            thread: Some(thread),
        }
    }

    pub fn counters(&self) -> Arc<SequencerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.input.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("sequencer stage stopped");
    }
}

impl Drop for SequencerStage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sequencer_loop(
    input: &StfQueue,
    output: &StfQueue,
    pipeline: &PipelineCounters,
    running: &AtomicBool,
    accepting_data: &AtomicBool,
    counters: &SequencerCounters,
) {
    let repeat_log = LogRatelimit::new(Duration::from_millis(500));
    let fill_log = LogRatelimit::new(Duration::from_secs(1));
    let gap_log = LogRatelimit::new(Duration::from_secs(1));

    let mut last_seq_stf_id: u64 = 0;

    loop {
        let mut stf = match input.pop_wait_for(SEQ_WAIT) {
            PopResult::Stopped => break,
            PopResult::Timeout => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
            PopResult::Item(stf) => stf,
        };

        if !accepting_data.load(Ordering::Relaxed) {
            pipeline.stfs_in_pipeline.fetch_sub(1, Ordering::Relaxed);
            pipeline.dropped_total.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let current_id = stf.id();
        stf.set_origin(StfOrigin::Readout);

        if current_id <= last_seq_stf_id {
            counters.rejected_stfs.fetch_add(1, Ordering::Relaxed);
            pipeline.stfs_in_pipeline.fetch_sub(1, Ordering::Relaxed);
            pipeline.dropped_total.fetch_add(1, Ordering::Relaxed);
            if repeat_log.check() {
                error!(
                    previous_stf_id = last_seq_stf_id,
                    current_stf_id = current_id,
                    "repeated SubTimeFrame rejected"
                );
            }
            continue;
        }

        let missing_start = last_seq_stf_id + 1;
        let missing = current_id - missing_start;
        if missing > 0 && last_seq_stf_id > 0 {
            if missing < MAX_MISSING_STFS_FOR_SEQ {
                if fill_log.check() {
                    warn!(
                        previous_stf_id = last_seq_stf_id,
                        num_missing = missing,
                        "creating empty (missing) SubTimeFrames"
                    );
                }
                for fill_id in missing_start..current_id {
                    counters.filled_stfs.fetch_add(1, Ordering::Relaxed);
                    pipeline.stfs_in_pipeline.fetch_add(1, Ordering::Relaxed);
                    if !output.push(SubTimeFrame::empty(fill_id)) {
                        break;
                    }
                }
            } else {
                counters.large_gaps.fetch_add(1, Ordering::Relaxed);
                if gap_log.check() {
                    warn!(
                        previous_stf_id = last_seq_stf_id,
                        current_stf_id = current_id,
                        num_missing = missing,
                        "large SubTimeFrame gap, not filling"
                    );
                }
            }
        }

        last_seq_stf_id = current_id;
        if !output.push(stf) {
            break;
        }
    }

    debug!("exiting the sequencer thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfd_core::queue::ConcurrentFifo;

    struct Fixture {
        input: StfQueue,
        output: StfQueue,
        stage: SequencerStage,
    }

    fn start_stage() -> Fixture {
        let input: StfQueue = Arc::new(ConcurrentFifo::new());
        let output: StfQueue = Arc::new(ConcurrentFifo::new());
        let stage = SequencerStage::start(
            Arc::clone(&input),
            Arc::clone(&output),
            Arc::new(PipelineCounters::new()),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(true)),
        );
        Fixture {
            input,
            output,
            stage,
        }
    }

    fn pop(f: &Fixture) -> SubTimeFrame {
        f.output
            .pop_wait_for(Duration::from_secs(2))
            .into_item()
            .expect("sequenced STF expected")
    }

    #[test]
    fn test_contiguous_ids_forwarded() {
        let mut f = start_stage();
        for id in 1..=3 {
            f.input.push(SubTimeFrame::empty(id));
        }
        for id in 1..=3 {
            assert_eq!(pop(&f).id(), id);
        }
        f.stage.stop();
    }

    #[test]
    fn test_gap_filled_with_null_origin() {
        let mut f = start_stage();
        f.input.push(SubTimeFrame::empty(10));
        f.input.push(SubTimeFrame::empty(13));

        assert_eq!(pop(&f).id(), 10);
        let fill_a = pop(&f);
        assert_eq!(fill_a.id(), 11);
        assert_eq!(fill_a.origin(), StfOrigin::Null);
        let fill_b = pop(&f);
        assert_eq!(fill_b.id(), 12);
        assert_eq!(fill_b.origin(), StfOrigin::Null);
        assert_eq!(pop(&f).id(), 13);
        assert_eq!(f.stage.counters().filled_stfs.load(Ordering::Relaxed), 2);
        f.stage.stop();
    }

    #[test]
    fn test_large_gap_not_filled() {
        let mut f = start_stage();
        f.input.push(SubTimeFrame::empty(5));
        f.input.push(SubTimeFrame::empty(200));

        assert_eq!(pop(&f).id(), 5);
        assert_eq!(pop(&f).id(), 200);
        assert_eq!(f.stage.counters().large_gaps.load(Ordering::Relaxed), 1);
        assert_eq!(f.stage.counters().filled_stfs.load(Ordering::Relaxed), 0);
        f.stage.stop();
    }

    #[test]
    fn test_duplicates_and_regressions_rejected() {
        let mut f = start_stage();
        for id in [4u64, 4, 2, 5] {
            f.input.push(SubTimeFrame::empty(id));
        }
        assert_eq!(pop(&f).id(), 4);
        assert_eq!(pop(&f).id(), 5);
        assert_eq!(f.stage.counters().rejected_stfs.load(Ordering::Relaxed), 2);
        f.stage.stop();
    }

    #[test]
    fn test_output_strictly_monotonic() {
        let mut f = start_stage();
        for id in [1u64, 3, 3, 2, 6, 10] {
            f.input.push(SubTimeFrame::empty(id));
        }
        let mut seen = Vec::new();
        while seen.len() < 10 {
            match f.output.pop_wait_for(Duration::from_millis(500)) {
                PopResult::Item(stf) => seen.push(stf.id()),
                _ => break,
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        f.stage.stop();
    }
}
