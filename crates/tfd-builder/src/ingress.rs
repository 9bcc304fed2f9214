//! Ingress stage: receive, validate, forward.
//!
//! A single worker pulls one multi-part delivery per iteration from the
//! readout channel, applies the validation ladder and transfers ownership of
//! the message vector into the assembly input queue. Payloads are never
//! copied here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tfd_core::channel::{ReadoutChannel, ReceiveOutcome};
use tfd_core::pool::PooledMessage;
use tfd_core::readout::{ReadoutMsgHeader, READOUT_HEADER_SIZE, READOUT_INTERFACE_VERSION};
use tfd_core::stats::LogRatelimit;

use crate::BundleQueue;

const RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Counters exported by the ingress stage.
#[derive(Default)]
pub struct IngressCounters {
    /// Bundles whose TF id moved backwards.
    pub non_monotonic_decrease: AtomicU64,
    /// Bundles whose TF id skipped forward by more than one.
    pub non_monotonic_increase: AtomicU64,
    /// Bundles rejected for header size or version mismatch.
    pub rejected_bundles: AtomicU64,
}

/// Handle of the running ingress worker.
pub struct ReadoutInterface {
    running: Arc<AtomicBool>,
    counters: Arc<IngressCounters>,
    thread: Option<JoinHandle<()>>,
}

impl ReadoutInterface {
    /// Spawn the receiving worker.
    ///
    /// `accepting_data` gates admission: while false, received data is
    /// discarded (with a throttled warning) instead of entering the
    /// pipeline. `keep_decreasing_tf_ids` keeps backward-jump bundles
    /// instead of dropping them.
    pub fn start(
        mut channel: Box<dyn ReadoutChannel>,
        output: BundleQueue,
        running: Arc<AtomicBool>,
        accepting_data: Arc<AtomicBool>,
        keep_decreasing_tf_ids: bool,
    ) -> Self {
        let counters = Arc::new(IngressCounters::default());
        let worker_counters = Arc::clone(&counters);
        let worker_running = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("stfb-input".into())
            .spawn(move || {
                data_handler_loop(
                    channel.as_mut(),
                    &output,
                    &worker_running,
                    &accepting_data,
                    &worker_counters,
                    keep_decreasing_tf_ids,
                );
            })
            .expect("failed to spawn the ingress thread");

        Self {
            running,
            counters,
            thread: Some(thread),
        }
    }

    pub fn counters(&self) -> Arc<IngressCounters> {
        Arc::clone(&self.counters)
    }

    /// Signal the worker and wait for it to exit.
    ///
    /// The channel receive returns within its internal wait, so the join is
    /// bounded.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("ingress stage stopped");
    }
}

impl Drop for ReadoutInterface {
    fn drop(&mut self) {
        self.stop();
    }
}

fn data_handler_loop(
    channel: &mut dyn ReadoutChannel,
    output: &BundleQueue,
    running: &AtomicBool,
    accepting_data: &AtomicBool,
    counters: &IngressCounters,
    keep_decreasing_tf_ids: bool,
) {
    let interrupt_log = LogRatelimit::new(Duration::from_secs(1));
    let error_log = LogRatelimit::new(Duration::from_secs(1));
    let discard_log = LogRatelimit::new(Duration::from_secs(1));
    let header_log = LogRatelimit::new(Duration::from_secs(1));
    let jump_log = LogRatelimit::new(Duration::from_millis(200));

    let mut parts: Vec<PooledMessage> = Vec::with_capacity(4096);
    let mut last_seen_tf_id: Option<u32> = None;

    while running.load(Ordering::Relaxed) {
        parts.clear();
        match channel.receive(&mut parts) {
            ReceiveOutcome::Timeout => continue,
            ReceiveOutcome::Interrupted => {
                if accepting_data.load(Ordering::Relaxed) && interrupt_log.check() {
                    info!(channel = channel.name(), "receive interrupted by transport state");
                }
                thread::sleep(RETRY_SLEEP);
                continue;
            }
            ReceiveOutcome::Error(code) => {
                if error_log.check() {
                    error!(channel = channel.name(), code, "receive failed on the input channel");
                }
                thread::sleep(RETRY_SLEEP);
                continue;
            }
            ReceiveOutcome::Parts => {}
        }

        if !accepting_data.load(Ordering::Relaxed) {
            if discard_log.check() {
                warn!("discarding received data: not accepting data");
            }
            parts.clear();
            continue;
        }

        if parts.is_empty() {
            continue;
        }

        if parts[0].len() != READOUT_HEADER_SIZE {
            counters.rejected_bundles.fetch_add(1, Ordering::Relaxed);
            if header_log.check() {
                error!(
                    received_size = parts[0].len(),
                    expected_size = READOUT_HEADER_SIZE,
                    "incompatible readout header received; check the readout version"
                );
            }
            continue;
        }

        let Some(header) = ReadoutMsgHeader::parse(&parts[0].data) else {
            continue; // size checked above; unreachable in practice
        };

        if header.version != READOUT_INTERFACE_VERSION {
            counters.rejected_bundles.fetch_add(1, Ordering::Relaxed);
            if header_log.check() {
                error!(
                    received = header.version,
                    expected = READOUT_INTERFACE_VERSION,
                    "unsupported readout interface version"
                );
            }
            continue;
        }

        if let Some(last) = last_seen_tf_id {
            if header.time_frame_id < last {
                let total = counters
                    .non_monotonic_decrease
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if jump_log.check() {
                    error!(
                        previous = last,
                        current = header.time_frame_id,
                        occurrences = total,
                        "TF id decreased; SubTimeFrames will be incomplete"
                    );
                }
                if !keep_decreasing_tf_ids {
                    // Data loss is recorded above, not silently swallowed.
                    parts.clear();
                    continue;
                }
            } else if header.time_frame_id > last + 1 {
                let total = counters
                    .non_monotonic_increase
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if jump_log.check() {
                    warn!(
                        previous = last,
                        current = header.time_frame_id,
                        occurrences = total,
                        "non-contiguous TF id increase; keeping the data"
                    );
                }
            }
        }
        last_seen_tf_id = Some(header.time_frame_id);

        let bundle = std::mem::replace(&mut parts, Vec::with_capacity(4096));
        if !output.push(bundle) {
            // Queue stopped under us: shutting down.
            break;
        }
    }

    debug!("exiting the ingress thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tfd_core::channel::mem::readout_pair;
    use tfd_core::queue::{ConcurrentFifo, PopResult};

    fn header_part(tf_id: u32, last: bool) -> PooledMessage {
        let hdr = ReadoutMsgHeader::new(tf_id, 1, last, false);
        PooledMessage::unpooled(Bytes::copy_from_slice(&hdr.encode()))
    }

    fn payload_part() -> PooledMessage {
        PooledMessage::unpooled(Bytes::from_static(&[0u8; 64]))
    }

    fn start_ingress(
        keep_decreasing: bool,
    ) -> (
        tfd_core::channel::mem::MemReadoutLink,
        BundleQueue,
        ReadoutInterface,
    ) {
        let (link, channel) = readout_pair("readout");
        let queue: BundleQueue = Arc::new(ConcurrentFifo::new());
        let ingress = ReadoutInterface::start(
            Box::new(channel),
            Arc::clone(&queue),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(true)),
            keep_decreasing,
        );
        (link, queue, ingress)
    }

    fn pop_tf_id(queue: &BundleQueue) -> Option<u32> {
        match queue.pop_wait_for(Duration::from_secs(2)) {
            PopResult::Item(bundle) => {
                ReadoutMsgHeader::parse(&bundle[0].data).map(|h| h.time_frame_id)
            }
            _ => None,
        }
    }

    #[test]
    fn test_valid_bundle_forwarded() {
        let (link, queue, mut ingress) = start_ingress(false);
        link.deliver(vec![header_part(100, true), payload_part()]);
        assert_eq!(pop_tf_id(&queue), Some(100));
        ingress.stop();
    }

    #[test]
    fn test_backward_jump_dropped_and_counted() {
        let (link, queue, mut ingress) = start_ingress(false);
        for (id, last) in [(100, true), (99, true), (101, true)] {
            link.deliver(vec![header_part(id, last), payload_part()]);
        }
        assert_eq!(pop_tf_id(&queue), Some(100));
        assert_eq!(pop_tf_id(&queue), Some(101));
        assert_eq!(
            ingress
                .counters()
                .non_monotonic_decrease
                .load(Ordering::Relaxed),
            1
        );
        ingress.stop();
    }

    #[test]
    fn test_backward_jump_kept_when_configured() {
        let (link, queue, mut ingress) = start_ingress(true);
        link.deliver(vec![header_part(100, true), payload_part()]);
        link.deliver(vec![header_part(99, true), payload_part()]);
        assert_eq!(pop_tf_id(&queue), Some(100));
        assert_eq!(pop_tf_id(&queue), Some(99));
        assert_eq!(
            ingress
                .counters()
                .non_monotonic_decrease
                .load(Ordering::Relaxed),
            1
        );
        ingress.stop();
    }

    #[test]
    fn test_forward_skip_kept_and_counted() {
        let (link, queue, mut ingress) = start_ingress(false);
        link.deliver(vec![header_part(10, true), payload_part()]);
        link.deliver(vec![header_part(15, true), payload_part()]);
        assert_eq!(pop_tf_id(&queue), Some(10));
        assert_eq!(pop_tf_id(&queue), Some(15));
        assert_eq!(
            ingress
                .counters()
                .non_monotonic_increase
                .load(Ordering::Relaxed),
            1
        );
        ingress.stop();
    }

    #[test]
    fn test_bad_header_size_rejected() {
        let (link, queue, mut ingress) = start_ingress(false);
        link.deliver(vec![payload_part()]); // 64 bytes, not a header
        link.deliver(vec![header_part(1, true), payload_part()]);
        assert_eq!(pop_tf_id(&queue), Some(1));
        assert_eq!(
            ingress.counters().rejected_bundles.load(Ordering::Relaxed),
            1
        );
        ingress.stop();
    }

    #[test]
    fn test_wrong_version_rejected() {
        let (link, queue, mut ingress) = start_ingress(false);
        let stale = ReadoutMsgHeader::new(1, 1, true, false).with_version(1);
        link.deliver(vec![
            PooledMessage::unpooled(Bytes::copy_from_slice(&stale.encode())),
            payload_part(),
        ]);
        link.deliver(vec![header_part(2, true), payload_part()]);
        assert_eq!(pop_tf_id(&queue), Some(2));
        assert_eq!(
            ingress.counters().rejected_bundles.load(Ordering::Relaxed),
            1
        );
        ingress.stop();
    }

    #[test]
    fn test_not_accepting_discards() {
        let (link, channel) = readout_pair("readout");
        let queue: BundleQueue = Arc::new(ConcurrentFifo::new());
        let mut ingress = ReadoutInterface::start(
            Box::new(channel),
            Arc::clone(&queue),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            false,
        );
        link.deliver(vec![header_part(1, true), payload_part()]);
        assert!(matches!(
            queue.pop_wait_for(Duration::from_millis(200)),
            PopResult::Timeout
        ));
        ingress.stop();
    }
}
