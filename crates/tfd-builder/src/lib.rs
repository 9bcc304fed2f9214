//! SubTimeFrame builder node.
//!
//! A staged, bounded, multi-threaded pipeline: the ingress stage receives
//! multi-part readout messages, the assembly stage accumulates them into
//! SubTimeFrames, the sequencer enforces a gap-free monotonic id stream, and
//! the outbound stage serializes onto the output channel. The
//! [`device::StfBuilderDevice`] composition root owns the queues, the memory
//! pool and the teardown order.

pub mod assembly;
pub mod device;
pub mod ingress;
pub mod mock;
pub mod output;
pub mod sequencer;
pub mod serializer;
pub mod telemetry;

use std::sync::Arc;

use tfd_core::pool::PooledMessage;
use tfd_core::queue::ConcurrentFifo;
use tfd_core::stf::SubTimeFrame;

/// One multi-part delivery travelling from ingress to assembly.
pub type HbfBundle = Vec<PooledMessage>;

/// Queue type between ingress and assembly (MPMC-safe for future fan-in).
pub type BundleQueue = Arc<ConcurrentFifo<HbfBundle>>;

/// Queue type carrying finished STFs between the later stages.
pub type StfQueue = Arc<ConcurrentFifo<SubTimeFrame>>;
