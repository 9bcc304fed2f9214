//! Core types for the time-frame distribution pipeline.
//!
//! This crate holds everything the builder-node pipeline and the scheduler
//! share: the readout wire header, the RDH field reader, the SubTimeFrame
//! data model, the inter-stage queue, the memory-pool accounting, statistics
//! primitives and the configuration surface.
//!
//! It deliberately owns no threads (tests aside); worker loops live in
//! `tfd-builder` and `tfd-scheduler`.

pub mod channel;
pub mod config;
pub mod detector;
pub mod error;
pub mod pool;
pub mod queue;
pub mod rdh;
pub mod readout;
pub mod stats;
pub mod stf;

pub use config::{BuilderConfig, ReadoutConfig, SchedulerConfig};
pub use detector::DataOrigin;
pub use error::{DataDistError, Result};
pub use pool::{MemoryPool, PoolLease, PooledMessage};
pub use queue::{ConcurrentFifo, PopResult};
pub use rdh::{RdhReader, RdhVersion, SanityCheckMode, SubSpecMode};
pub use readout::{ReadoutMsgHeader, READOUT_HEADER_SIZE, READOUT_INTERFACE_VERSION};
pub use stf::{EquipmentIdentifier, StfAccumulator, StfOrigin, SubTimeFrame};
