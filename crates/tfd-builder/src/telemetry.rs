//! Periodic pipeline summary logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use tfd_core::pool::MemoryPool;
use tfd_core::stats::PipelineCounters;

const INFO_PERIOD: Duration = Duration::from_secs(2);

/// Handle of the running info worker.
pub struct InfoStage {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InfoStage {
    pub fn start(
        pipeline: Arc<PipelineCounters>,
        pool: Arc<MemoryPool>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let worker_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("stfb-info".into())
            .spawn(move || {
                while worker_running.load(Ordering::Relaxed) {
                    // Sliced sleep so stop() is not delayed by a full period.
                    let mut slept = Duration::ZERO;
                    while slept < INFO_PERIOD && worker_running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(100));
                        slept += Duration::from_millis(100);
                    }
                    if !worker_running.load(Ordering::Relaxed) {
                        break;
                    }
                    let stf_time = pipeline.stf_time.get();
                    let frequency = if stf_time > 0.0 { 1.0 / stf_time } else { 0.0 };
                    info!(
                        size_mean = pipeline.stf_size.get() as u64,
                        frequency_mean = format_args!("{frequency:.4}"),
                        sending_time_ms_mean =
                            format_args!("{:.4}", pipeline.send_time_ms.get()),
                        queued_stfs = pipeline.stfs_in_pipeline.load(Ordering::Relaxed),
                        "SubTimeFrame pipeline"
                    );
                    info!(
                        sent_total = pipeline.sent_total.load(Ordering::Relaxed),
                        rate = format_args!("{:.4}", pipeline.sent_rate()),
                        pool_used = pool.used(),
                        pool_capacity = pool.capacity(),
                        "SubTimeFrame output"
                    );
                }
                debug!("exiting the info thread");
            })
            .expect("failed to spawn the info thread");

        Self {
            running,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InfoStage {
    fn drop(&mut self) {
        self.stop();
    }
}
