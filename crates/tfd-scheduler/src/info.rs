//! TF-builder registry: authoritative fleet state plus the ready queue.
//!
//! Two collections under two locks with a fixed acquisition order (registry
//! map first, ready deque second): the map holds every known builder, the
//! deque the ids currently eligible for placement. Every id in the deque
//! exists in the map, and a stale entry is never in the deque.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tfd_core::config::SchedulerConfig;
use tfd_proto::TfBuilderUpdateMessage;

/// Scheduler-side record of one TF builder.
#[derive(Debug, Clone)]
pub struct TfBuilderInfo {
    /// Local wallclock of the last received update.
    pub last_update: Instant,
    /// The update message as last reported.
    pub update: TfBuilderUpdateMessage,
    /// Highest TF id scheduled onto this builder.
    pub last_scheduled_tf: u64,
    /// Free-memory estimate after pending reservations.
    pub estimated_free_memory: u64,
    /// A reservation happened since the last update (merge rule).
    reserved_since_update: bool,
    /// Evicted from the ready queue by housekeeping.
    stale: bool,
}

impl TfBuilderInfo {
    fn new(update: TfBuilderUpdateMessage) -> Self {
        let estimated = update.free_memory.min(update.buffer_size);
        Self {
            last_update: Instant::now(),
            estimated_free_memory: estimated,
            last_scheduled_tf: 0,
            reserved_since_update: false,
            stale: false,
            update,
        }
    }

    pub fn id(&self) -> &str {
        self.update
            .info
            .as_ref()
            .map(|i| i.process_id.as_str())
            .unwrap_or_default()
    }

    pub fn last_built_tf_id(&self) -> u64 {
        self.update.last_built_tf_id
    }

    pub fn buffer_size(&self) -> u64 {
        self.update.buffer_size
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Reserve bytes for a placement decision.
    pub(crate) fn reserve(&mut self, required: u64) {
        self.estimated_free_memory = self.estimated_free_memory.saturating_sub(required);
        self.reserved_since_update = true;
    }
}

/// Fleet registry with housekeeping.
pub struct TfBuilderRegistry {
    config: SchedulerConfig,
    // Lock order: `global` strictly before `ready`.
    global: Mutex<HashMap<String, TfBuilderInfo>>,
    ready: Mutex<VecDeque<String>>,
    running: Arc<AtomicBool>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl TfBuilderRegistry {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            global: Mutex::new(HashMap::with_capacity(1000)),
            ready: Mutex::new(VecDeque::new()),
            running: Arc::new(AtomicBool::new(false)),
            housekeeping: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the housekeeping thread.
    pub fn start(self: &Arc<Self>) {
        self.global.lock().clear();
        self.running.store(true, Ordering::SeqCst);

        let registry = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sched-tfb-mon".into())
            .spawn(move || {
                let interval = registry.config.housekeeping_interval();
                while registry.running.load(Ordering::Relaxed) {
                    let mut slept = Duration::ZERO;
                    while slept < interval && registry.running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(100));
                        slept += Duration::from_millis(100);
                    }
                    if !registry.running.load(Ordering::Relaxed) {
                        break;
                    }
                    registry.housekeeping_tick();
                }
                debug!("exiting the housekeeping thread");
            })
            .expect("failed to spawn the housekeeping thread");
        *self.housekeeping.lock() = Some(handle);
    }

    /// Stop housekeeping and forget the fleet.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.housekeeping.lock().take() {
            let _ = handle.join();
        }
        self.global.lock().clear();
        self.ready.lock().clear();
    }

    /// Merge-or-insert a builder update.
    ///
    /// A new or recovered builder is (re-)admitted to the ready queue. The
    /// free-memory estimate takes the reported value, unless a reservation
    /// was made since the previous update; then the smaller of the two
    /// wins, so in-flight assignments are never double-counted.
    pub fn update_tf_builder_info(&self, update: TfBuilderUpdateMessage) {
        let Some(id) = update.info.as_ref().map(|i| i.process_id.clone()) else {
            warn!("builder update without a process id, ignoring");
            return;
        };

        let mut global = self.global.lock();
        match global.get_mut(&id) {
            Some(entry) => {
                entry.last_update = Instant::now();
                let reported = update.free_memory.min(update.buffer_size);
                entry.estimated_free_memory = if entry.reserved_since_update {
                    entry.estimated_free_memory.min(reported)
                } else {
                    reported
                };
                entry.reserved_since_update = false;
                // Built ids are monotonic; ignore stragglers.
                let last_built = entry.update.last_built_tf_id.max(update.last_built_tf_id);
                entry.update = update;
                entry.update.last_built_tf_id = last_built;

                if entry.stale {
                    entry.stale = false;
                    drop(global);
                    self.add_ready_tf_builder(&id);
                    info!(tfb_id = %id, "TfBuilder recovered, re-added to the ready queue");
                }
            }
            None => {
                global.insert(id.clone(), TfBuilderInfo::new(update));
                drop(global);
                self.add_ready_tf_builder(&id);
                info!(tfb_id = %id, "new TfBuilder registered");
            }
        }
    }

    /// Append a builder to the ready queue (idempotent).
    pub fn add_ready_tf_builder(&self, id: &str) {
        let mut ready = self.ready.lock();
        if !ready.iter().any(|r| r == id) {
            ready.push_back(id.to_owned());
        }
    }

    /// Remove a builder from the ready queue.
    pub fn remove_ready_tf_builder(&self, id: &str) {
        let mut ready = self.ready.lock();
        if let Some(pos) = ready.iter().position(|r| r == id) {
            ready.remove(pos);
            debug!(tfb_id = id, "removed TfBuilder from the ready queue");
        }
    }

    /// Record the TF id just scheduled onto a builder.
    ///
    /// Takes both locks (registry first) so placement observers see a
    /// consistent pair. Returns false for unknown ids.
    pub fn mark_tf_builder_with_tf_id(&self, id: &str, tf_id: u64) -> bool {
        let mut global = self.global.lock();
        let _ready = self.ready.lock();
        match global.get_mut(id) {
            Some(entry) => {
                debug_assert!(entry.last_scheduled_tf <= tf_id);
                entry.last_scheduled_tf = tf_id;
                true
            }
            None => false,
        }
    }

    /// One housekeeping pass: evict silent builders from the ready queue.
    ///
    /// Exposed for tests; the housekeeping thread calls this periodically.
    /// Eviction happens under the locks; no RPCs are made here.
    pub fn housekeeping_tick(&self) {
        let timeout = self.config.discard_timeout();
        let now = Instant::now();

        let mut global = self.global.lock();
        let mut ready = self.ready.lock();
        for (id, entry) in global.iter_mut() {
            if !entry.stale && now.duration_since(entry.last_update) > timeout {
                entry.stale = true;
                if let Some(pos) = ready.iter().position(|r| r == id) {
                    ready.remove(pos);
                }
                warn!(
                    tfb_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "TfBuilder silent for too long, removed from the ready queue"
                );
            }
        }
    }

    /// Snapshot of the ready queue order.
    pub fn ready_ids(&self) -> Vec<String> {
        self.ready.lock().iter().cloned().collect()
    }

    /// Number of known builders.
    pub fn known_count(&self) -> usize {
        self.global.lock().len()
    }

    /// Read one builder's record.
    pub fn get(&self, id: &str) -> Option<TfBuilderInfo> {
        self.global.lock().get(id).cloned()
    }

    /// Internal: both locks in the canonical order.
    pub(crate) fn with_both<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, TfBuilderInfo>, &mut VecDeque<String>) -> R,
    ) -> R {
        let mut global = self.global.lock();
        let mut ready = self.ready.lock();
        f(&mut global, &mut ready)
    }
}
