//! Scheduler instance: registry, placement and the builder RPC surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use tfd_core::error::DataDistError;
use tfd_proto::{
    BuildTfResponse, BuildTfStatus, PartitionInfo, PartitionResponse, PartitionState,
    TfBuilderUpdateMessage, TfBuildingInformation,
};

use crate::info::TfBuilderRegistry;

/// Transport-agnostic connection to the TF-builder fleet.
pub trait TfBuilderConnection: Send + Sync {
    /// Ask `builder_id` to assemble and aggregate one TF.
    fn build_tf_request(
        &self,
        builder_id: &str,
        request: &TfBuildingInformation,
    ) -> Result<BuildTfResponse, DataDistError>;
}

/// Scheduling counters.
#[derive(Default)]
pub struct SchedulerCounters {
    /// TFs assigned and accepted.
    pub scheduled_tfs: AtomicU64,
    /// TFs deferred because no builder had capacity.
    pub deferred_tfs: AtomicU64,
    /// Assignments refused by the builder (capacity race) or lost in transit.
    pub refused_tfs: AtomicU64,
}

/// The running scheduler.
pub struct TfSchedulerInstance {
    registry: Arc<TfBuilderRegistry>,
    connections: Arc<dyn TfBuilderConnection>,
    counters: SchedulerCounters,
    terminated: AtomicBool,
}

impl TfSchedulerInstance {
    pub fn new(
        registry: Arc<TfBuilderRegistry>,
        connections: Arc<dyn TfBuilderConnection>,
    ) -> Self {
        Self {
            registry,
            connections,
            counters: SchedulerCounters::default(),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<TfBuilderRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> &SchedulerCounters {
        &self.counters
    }

    /// RPC entry: a TF builder pushed its periodic update.
    pub fn update_tf_builder_info(&self, update: TfBuilderUpdateMessage) {
        if self.terminated.load(Ordering::Relaxed) {
            return;
        }
        self.registry.update_tf_builder_info(update);
    }

    /// Place one announced TF and dispatch the building request.
    ///
    /// A placement miss is not an error: the TF is deferred and retried by
    /// the caller on the next announcement or registry update. The RPC is
    /// issued strictly after the registry locks are released.
    pub fn schedule_tf(&self, tf_id: u64, size: u64) -> bool {
        if self.terminated.load(Ordering::Relaxed) {
            return false;
        }

        let Some(builder_id) = self.registry.find_tf_builder_for_tf(size) else {
            self.counters.deferred_tfs.fetch_add(1, Ordering::Relaxed);
            debug!(tf_id, size, "no ready TfBuilder with enough memory, deferring");
            return false;
        };
        self.registry.mark_tf_builder_with_tf_id(&builder_id, tf_id);

        let request = TfBuildingInformation {
            tf_id,
            tf_size: size,
            stf_sizes: Default::default(),
        };
        match self.connections.build_tf_request(&builder_id, &request) {
            Ok(response) if response.status_checked() == BuildTfStatus::Ok => {
                self.counters.scheduled_tfs.fetch_add(1, Ordering::Relaxed);
                debug!(tf_id, tfb_id = %builder_id, "TF scheduled");
                true
            }
            Ok(response) => {
                // The reservation is credited back by the next heartbeat.
                self.counters.refused_tfs.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tf_id,
                    tfb_id = %builder_id,
                    status = ?response.status_checked(),
                    "TfBuilder refused the building request"
                );
                false
            }
            Err(e) => {
                self.counters.refused_tfs.fetch_add(1, Ordering::Relaxed);
                warn!(tf_id, tfb_id = %builder_id, error = %e, "building request failed");
                false
            }
        }
    }

    /// RPC entry: cooperative partition shutdown.
    pub fn terminate_partition(&self, request: &PartitionInfo) -> PartitionResponse {
        info!(partition_id = %request.partition_id, "partition termination requested");
        self.terminated.store(true, Ordering::SeqCst);
        self.registry.stop();
        PartitionResponse::with_state(PartitionState::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tfd_core::config::SchedulerConfig;
    use tfd_proto::BasicInfo;

    fn update(id: &str, free: u64) -> TfBuilderUpdateMessage {
        TfBuilderUpdateMessage {
            info: Some(BasicInfo {
                process_id: id.into(),
                partition_id: "test".into(),
            }),
            buffer_size: free,
            free_memory: free,
            num_buffered_tfs: 0,
            last_built_tf_id: 0,
        }
    }

    struct ScriptedConnection {
        responses: Mutex<Vec<BuildTfStatus>>,
        requests: Mutex<Vec<(String, u64)>>,
    }

    impl ScriptedConnection {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn with_responses(responses: Vec<BuildTfStatus>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl TfBuilderConnection for ScriptedConnection {
        fn build_tf_request(
            &self,
            builder_id: &str,
            request: &TfBuildingInformation,
        ) -> Result<BuildTfResponse, DataDistError> {
            self.requests
                .lock()
                .push((builder_id.to_owned(), request.tf_id));
            let status = self
                .responses
                .lock()
                .pop()
                .unwrap_or(BuildTfStatus::Ok);
            Ok(BuildTfResponse::with_status(status))
        }
    }

    fn instance_with(
        builders: &[(&str, u64)],
        connection: Arc<ScriptedConnection>,
    ) -> TfSchedulerInstance {
        let registry = TfBuilderRegistry::new(SchedulerConfig::default());
        for (id, free) in builders {
            registry.update_tf_builder_info(update(id, *free));
        }
        TfSchedulerInstance::new(registry, connection)
    }

    #[test]
    fn test_schedule_dispatches_to_builder() {
        let connection = ScriptedConnection::accepting();
        let instance = instance_with(&[("tfb-1", 10_000)], Arc::clone(&connection));

        assert!(instance.schedule_tf(7, 1_000));
        assert_eq!(
            connection.requests.lock().as_slice(),
            &[("tfb-1".to_owned(), 7)]
        );
        assert_eq!(
            instance.registry().get("tfb-1").unwrap().last_scheduled_tf,
            7
        );
        assert_eq!(instance.counters().scheduled_tfs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_placement_miss_defers() {
        let connection = ScriptedConnection::accepting();
        let instance = instance_with(&[("tfb-1", 100)], Arc::clone(&connection));

        assert!(!instance.schedule_tf(1, 1_000));
        assert!(connection.requests.lock().is_empty());
        assert_eq!(instance.counters().deferred_tfs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_builder_refusal_counted() {
        let connection = ScriptedConnection::with_responses(vec![BuildTfStatus::ErrorNomem]);
        let instance = instance_with(&[("tfb-1", 10_000)], Arc::clone(&connection));

        assert!(!instance.schedule_tf(1, 1_000));
        assert_eq!(instance.counters().refused_tfs.load(Ordering::Relaxed), 1);
        // The reservation stays until the next heartbeat restores it.
        assert_eq!(
            instance.registry().get("tfb-1").unwrap().estimated_free_memory,
            10_000 - 1_100
        );
        instance
            .registry()
            .update_tf_builder_info(update("tfb-1", 10_000));
        assert_eq!(
            instance.registry().get("tfb-1").unwrap().estimated_free_memory,
            8_900
        );
    }

    #[test]
    fn test_terminate_partition_stops_scheduling() {
        let connection = ScriptedConnection::accepting();
        let instance = instance_with(&[("tfb-1", 10_000)], Arc::clone(&connection));

        let response = instance.terminate_partition(&PartitionInfo {
            partition_id: "physics-1".into(),
        });
        assert_eq!(response.state(), PartitionState::Terminated);
        assert!(instance.is_terminated());
        assert!(!instance.schedule_tf(1, 100));
        assert!(connection.requests.lock().is_empty());
    }
}
