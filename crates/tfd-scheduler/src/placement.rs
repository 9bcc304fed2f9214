//! TF placement: pick a ready builder with enough estimated free memory.

use tracing::debug;

use crate::info::TfBuilderRegistry;

impl TfBuilderRegistry {
    /// Find a builder for a TF of `size` bytes.
    ///
    /// Scans the ready queue from the front and takes the first entry whose
    /// free-memory estimate covers the size plus the configured overestimate
    /// margin. The winner's estimate is reduced by the reserved amount and
    /// the entry moves to the tail of the queue (round-robin fairness).
    ///
    /// `None` is not an error: the caller defers the TF until the next
    /// update or retry.
    pub fn find_tf_builder_for_tf(&self, size: u64) -> Option<String> {
        let required = size + size * self.config().overestimate_percent / 100;

        self.with_both(|global, ready| {
            let position = ready.iter().position(|id| {
                global
                    .get(id)
                    .is_some_and(|info| info.estimated_free_memory >= required)
            })?;

            let id = ready
                .remove(position)
                .expect("position comes from the same queue");
            let info = global.get_mut(&id).expect("ready ids exist in the registry");
            info.reserve(required);
            debug!(
                tfb_id = %id,
                required,
                remaining = info.estimated_free_memory,
                "reserved TF building capacity"
            );
            ready.push_back(id.clone());
            Some(id)
        })
    }
}
