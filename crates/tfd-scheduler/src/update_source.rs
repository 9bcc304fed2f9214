//! Builder-side buffer accounting and the periodic scheduler update.
//!
//! Runs inside a TF-builder process: tracks the TF buffer (total size,
//! per-TF-id reservations, last built id) and pushes
//! [`TfBuilderUpdateMessage`]s to the scheduler through the narrow
//! [`SchedulerClient`] trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use tfd_core::error::DataDistError;
use tfd_proto::{BasicInfo, TfBuilderUpdateMessage};

/// Transport-agnostic scheduler endpoint.
pub trait SchedulerClient: Send + Sync {
    fn send_update(&self, update: &TfBuilderUpdateMessage) -> Result<(), DataDistError>;
}

struct BufferState {
    /// Bytes held per buffered TF id.
    tf_sizes: HashMap<u64, u64>,
    used: u64,
    last_built_tf_id: u64,
}

/// TF-buffer accounting with update publishing.
pub struct TfBuilderUpdater {
    info: BasicInfo,
    buffer_size: u64,
    state: Mutex<BufferState>,
    client: Arc<dyn SchedulerClient>,
}

impl TfBuilderUpdater {
    pub fn new(
        process_id: &str,
        partition_id: &str,
        buffer_size: u64,
        client: Arc<dyn SchedulerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: BasicInfo {
                process_id: process_id.into(),
                partition_id: partition_id.into(),
            },
            buffer_size,
            state: Mutex::new(BufferState {
                tf_sizes: HashMap::new(),
                used: 0,
                last_built_tf_id: 0,
            }),
            client,
        })
    }

    /// Account a newly built TF. False when the buffer cannot hold it.
    pub fn record_tf_built(&self, tf_id: u64, size: u64) -> bool {
        let mut state = self.state.lock();
        if state.used + size > self.buffer_size {
            warn!(
                tf_id,
                size,
                used = state.used,
                buffer_size = self.buffer_size,
                "TF does not fit into the buffer"
            );
            return false;
        }
        if state.tf_sizes.insert(tf_id, size).is_some() {
            warn!(tf_id, "TF was already recorded as built");
        }
        state.used += size;
        state.last_built_tf_id = state.last_built_tf_id.max(tf_id);
        true
    }

    /// Release a TF's bytes once it was forwarded downstream.
    pub fn record_tf_forwarded(&self, tf_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.tf_sizes.remove(&tf_id) {
            Some(size) => {
                state.used = state.used.saturating_sub(size);
                true
            }
            None => {
                warn!(tf_id, "forwarded TF was never recorded as built");
                false
            }
        }
    }

    /// Currently free buffer bytes.
    pub fn free_memory(&self) -> u64 {
        let state = self.state.lock();
        self.buffer_size - state.used
    }

    /// Compose the current update message.
    pub fn current_update(&self) -> TfBuilderUpdateMessage {
        let state = self.state.lock();
        TfBuilderUpdateMessage {
            info: Some(self.info.clone()),
            buffer_size: self.buffer_size,
            free_memory: self.buffer_size - state.used,
            num_buffered_tfs: state.tf_sizes.len() as u32,
            last_built_tf_id: state.last_built_tf_id,
        }
    }

    /// Push one update to the scheduler.
    pub fn send_update(&self) -> Result<(), DataDistError> {
        let update = self.current_update();
        debug!(
            free_memory = update.free_memory,
            buffered_tfs = update.num_buffered_tfs,
            "sending TfBuilder update"
        );
        self.client.send_update(&update)
    }

    /// Spawn the periodic update sender.
    ///
    /// Send failures are logged and retried on the next period; the
    /// scheduler treats the silence as staleness.
    pub fn start_periodic(
        self: &Arc<Self>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        thread::Builder::new()
            .name("tfb-update".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    if let Err(e) = updater.send_update() {
                        warn!(error = %e, "could not deliver the TfBuilder update");
                    }
                    let mut slept = Duration::ZERO;
                    while slept < interval && running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(50));
                        slept += Duration::from_millis(50);
                    }
                }
            })
            .expect("failed to spawn the update thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingClient {
        updates: Mutex<Vec<TfBuilderUpdateMessage>>,
    }

    impl RecordingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                updates: Mutex::new(Vec::new()),
            })
        }
    }

    impl SchedulerClient for RecordingClient {
        fn send_update(&self, update: &TfBuilderUpdateMessage) -> Result<(), DataDistError> {
            self.updates.lock().push(update.clone());
            Ok(())
        }
    }

    #[test]
    fn test_free_memory_tracks_buffered_tfs() {
        let client = RecordingClient::new();
        let updater = TfBuilderUpdater::new("tfb-1", "p", 1_000, client);
        assert!(updater.record_tf_built(1, 300));
        assert!(updater.record_tf_built(2, 200));
        assert_eq!(updater.free_memory(), 500);

        assert!(updater.record_tf_forwarded(1));
        assert_eq!(updater.free_memory(), 800);
    }

    #[test]
    fn test_overfull_buffer_refused() {
        let client = RecordingClient::new();
        let updater = TfBuilderUpdater::new("tfb-1", "p", 1_000, client);
        assert!(updater.record_tf_built(1, 900));
        assert!(!updater.record_tf_built(2, 200));
        assert_eq!(updater.free_memory(), 100);
    }

    #[test]
    fn test_unknown_forward_is_flagged() {
        let client = RecordingClient::new();
        let updater = TfBuilderUpdater::new("tfb-1", "p", 1_000, client);
        assert!(!updater.record_tf_forwarded(5));
    }

    #[test]
    fn test_update_message_contents() {
        let client = RecordingClient::new();
        let updater = TfBuilderUpdater::new("tfb-7", "physics", 1_000, Arc::clone(&client) as _);
        updater.record_tf_built(41, 100);
        updater.record_tf_built(42, 150);
        updater.send_update().unwrap();

        let updates = client.updates.lock();
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.info.as_ref().unwrap().process_id, "tfb-7");
        assert_eq!(update.buffer_size, 1_000);
        assert_eq!(update.free_memory, 750);
        assert_eq!(update.num_buffered_tfs, 2);
        assert_eq!(update.last_built_tf_id, 42);
    }

    #[test]
    fn test_periodic_thread_sends() {
        let client = RecordingClient::new();
        let updater = TfBuilderUpdater::new("tfb-1", "p", 1_000, Arc::clone(&client) as _);
        let running = Arc::new(AtomicBool::new(true));
        let handle = updater.start_periodic(Duration::from_millis(50), Arc::clone(&running));

        std::thread::sleep(Duration::from_millis(180));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(client.updates.lock().len() >= 2);
    }
}
