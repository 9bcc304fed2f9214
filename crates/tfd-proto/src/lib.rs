//! Control-plane message types.
//!
//! Hand-written `prost` messages for the scheduler/builder RPC surface and
//! the processor-adapter control headers. The transport carrying them is
//! abstracted behind traits in the consuming crates; only the semantic
//! fields here are normative.

use prost::Message;

/// Process identity attached to every update.
#[derive(Clone, PartialEq, Message)]
pub struct BasicInfo {
    #[prost(string, tag = "1")]
    pub process_id: String,
    #[prost(string, tag = "2")]
    pub partition_id: String,
}

/// Periodic state push from a TF builder to the scheduler.
#[derive(Clone, PartialEq, Message)]
pub struct TfBuilderUpdateMessage {
    #[prost(message, optional, tag = "1")]
    pub info: Option<BasicInfo>,
    /// Total TF buffer size in bytes.
    #[prost(uint64, tag = "2")]
    pub buffer_size: u64,
    /// Bytes currently free for new TF assignments.
    #[prost(uint64, tag = "3")]
    pub free_memory: u64,
    /// TFs currently resident in the buffer.
    #[prost(uint32, tag = "4")]
    pub num_buffered_tfs: u32,
    /// Highest TF id fully built at this node.
    #[prost(uint64, tag = "5")]
    pub last_built_tf_id: u64,
}

/// Scheduler → TF builder: assemble and aggregate one TF.
#[derive(Clone, PartialEq, Message)]
pub struct TfBuildingInformation {
    #[prost(uint64, tag = "1")]
    pub tf_id: u64,
    /// Aggregate announced STF size across all sources.
    #[prost(uint64, tag = "2")]
    pub tf_size: u64,
    /// Per-source STF sizes, keyed by sender process id.
    #[prost(map = "string, uint64", tag = "3")]
    pub stf_sizes: std::collections::HashMap<String, u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum BuildTfStatus {
    Ok = 0,
    /// Builder cannot reserve memory for the TF (capacity race).
    ErrorNomem = 1,
    /// Builder is not accepting TFs.
    ErrorNotRunning = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct BuildTfResponse {
    #[prost(enumeration = "BuildTfStatus", tag = "1")]
    pub status: i32,
}

impl BuildTfResponse {
    pub fn status_checked(&self) -> BuildTfStatus {
        BuildTfStatus::try_from(self.status).unwrap_or(BuildTfStatus::ErrorNotRunning)
    }

    pub fn with_status(status: BuildTfStatus) -> Self {
        Self {
            status: status as i32,
        }
    }
}

/// Cooperative shutdown request.
#[derive(Clone, PartialEq, Message)]
pub struct PartitionInfo {
    #[prost(string, tag = "1")]
    pub partition_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum PartitionState {
    Running = 0,
    Terminating = 1,
    Terminated = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct PartitionResponse {
    #[prost(enumeration = "PartitionState", tag = "1")]
    pub partition_state: i32,
}

impl PartitionResponse {
    pub fn state(&self) -> PartitionState {
        PartitionState::try_from(self.partition_state).unwrap_or(PartitionState::Running)
    }

    pub fn with_state(state: PartitionState) -> Self {
        Self {
            partition_state: state as i32,
        }
    }
}

// ---------------------------------------------------------------------------
// Processor-adapter control headers
// ---------------------------------------------------------------------------

/// First element of the control stack: describes the burst that follows.
#[derive(Clone, PartialEq, Message)]
pub struct StackDataHeader {
    /// Payload description tag (e.g. "DISTSUBTIMEFRAME" or "INFORMATION").
    #[prost(string, tag = "1")]
    pub description: String,
    /// Detector origin tag, or "ANY" for control messages.
    #[prost(string, tag = "2")]
    pub origin: String,
    #[prost(uint64, tag = "3")]
    pub tf_id: u64,
    #[prost(uint64, tag = "4")]
    pub payload_size: u64,
    #[prost(uint32, tag = "5")]
    pub first_orbit: u32,
}

/// Second element: processing metadata for the downstream framework.
#[derive(Clone, PartialEq, Message)]
pub struct ProcessingHeader {
    /// Timeslice the payload belongs to.
    #[prost(uint64, tag = "1")]
    pub timeslice: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum SourceState {
    Running = 0,
    /// The source finished; no further data will arrive on this channel.
    Completed = 1,
}

/// Third element of the end-of-stream stack.
#[derive(Clone, PartialEq, Message)]
pub struct SourceInfoHeader {
    #[prost(enumeration = "SourceState", tag = "1")]
    pub state: i32,
}

impl SourceInfoHeader {
    pub fn completed() -> Self {
        Self {
            state: SourceState::Completed as i32,
        }
    }

    pub fn state_checked(&self) -> SourceState {
        SourceState::try_from(self.state).unwrap_or(SourceState::Running)
    }
}

/// Encode any control message to its wire bytes.
pub fn encode<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}
