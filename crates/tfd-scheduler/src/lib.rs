//! TimeFrame scheduler.
//!
//! Tracks the fleet of downstream TF-builder nodes through periodic updates,
//! classifies them ready or stale, reserves memory per TF assignment and
//! picks a target for each announced TF with round-robin fairness under the
//! per-node capacity constraint.

pub mod info;
pub mod instance;
pub mod placement;
pub mod update_source;

pub use info::{TfBuilderInfo, TfBuilderRegistry};
pub use instance::{TfBuilderConnection, TfSchedulerInstance};
pub use update_source::{SchedulerClient, TfBuilderUpdater};
