//! Outbound stage: drain finished STFs onto the output channel.
//!
//! Sends in sequencer order, keeps rate and latency statistics, honors the
//! `max_built_stfs` limit and terminates the downstream session cleanly
//! (source-completed stack in processor mode, then a best-effort drain).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use tfd_core::queue::PopResult;
use tfd_core::stats::{LogRatelimit, PipelineCounters};

use crate::serializer::StfSerializer;
use crate::StfQueue;

const OUT_WAIT: Duration = Duration::from_millis(500);

/// Time allowed for the transport to flush the final control message.
const DRAIN_SLEEP: Duration = Duration::from_secs(2);

/// Handle of the running outbound worker.
pub struct OutputStage {
    running: Arc<AtomicBool>,
    input: StfQueue,
    thread: Option<JoinHandle<()>>,
}

impl OutputStage {
    /// Spawn the sending worker.
    ///
    /// `serializer` is `None` in standalone mode: STFs are then dropped
    /// after accounting (their buffers return to the pool).
    pub fn start(
        serializer: Option<Box<dyn StfSerializer>>,
        input: StfQueue,
        pipeline: Arc<PipelineCounters>,
        running: Arc<AtomicBool>,
        max_built_stfs: u64,
    ) -> Self {
        let worker_running = Arc::clone(&running);
        let worker_input = Arc::clone(&input);

        let thread = thread::Builder::new()
            .name("stfb-out".into())
            .spawn(move || {
                output_loop(
                    serializer,
                    &worker_input,
                    &pipeline,
                    &worker_running,
                    max_built_stfs,
                );
            })
            .expect("failed to spawn the output thread");

        Self {
            running,
            input,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.input.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("outbound stage stopped");
    }
}

impl Drop for OutputStage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn output_loop(
    mut serializer: Option<Box<dyn StfSerializer>>,
    input: &StfQueue,
    pipeline: &PipelineCounters,
    running: &AtomicBool,
    max_built_stfs: u64,
) {
    let send_log = LogRatelimit::new(Duration::from_secs(2));

    let mut rate_window_start = Instant::now();
    let mut sent_in_window: u64 = 0;

    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let stf = match input.pop_wait_for(OUT_WAIT) {
            PopResult::Stopped => break,
            PopResult::Timeout => continue,
            PopResult::Item(stf) => stf,
        };

        pipeline.stfs_in_pipeline.fetch_sub(1, Ordering::Relaxed);
        if send_log.check() {
            debug!(
                stf_id = stf.id(),
                stf_size = stf.data_size(),
                unique_equipments = stf.equipment_identifiers().len(),
                "sending an STF out"
            );
        }
        pipeline.stf_size.update(stf.data_size() as f64);

        if let Some(serializer) = serializer.as_mut() {
            let send_start = Instant::now();
            match serializer.serialize(stf) {
                Ok(_) => {}
                Err(e) => {
                    if serializer.channel_running() {
                        error!(error = %e, "exception on send");
                    } else {
                        info!(error = %e, "output channel shutting down");
                    }
                    break;
                }
            }

            let send_ms = send_start.elapsed().as_secs_f64() * 1e3;
            pipeline.send_time_ms.update(send_ms.max(1e-6));
            sent_in_window += 1;
            let elapsed = rate_window_start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                pipeline.set_sent_rate(sent_in_window as f64 / elapsed);
            }
            // Reset the window periodically so the rate stays instantaneous.
            if elapsed > 10.0 {
                rate_window_start = Instant::now();
                sent_in_window = 0;
            }
        }

        let sent = pipeline.sent_total.fetch_add(1, Ordering::Relaxed) + 1;
        if max_built_stfs > 0 && sent == max_built_stfs {
            info!(max_built_stfs, "maximum number of sent SubTimeFrames reached, exiting");
            break;
        }
    }

    // Leaving the output loop: terminate the downstream session.
    if let Some(serializer) = serializer.as_mut() {
        match serializer.finalize_stream() {
            Ok(()) => {
                if serializer.channel_running() {
                    // Best effort: give the transport time to flush.
                    thread::sleep(DRAIN_SLEEP);
                }
            }
            Err(e) => info!(error = %e, "could not send the source-completed message"),
        }
    }

    running.store(false, Ordering::SeqCst);
    info!(
        sent_total = pipeline.sent_total.load(Ordering::Relaxed),
        rate = pipeline.sent_rate(),
        "stopped SubTimeFrame sending"
    );
}
