//! Output encodings for finished SubTimeFrames.
//!
//! Two serializers write onto the output channel:
//!
//! - [`InterleavedHdrDataSerializer`], stream mode: one fixed-layout STF
//!   block header, then per equipment group an equipment header part
//!   followed by its payload parts.
//! - [`StfProcessorAdapter`], processor mode: one control-header part (a
//!   stack of length-delimited protobuf headers) followed by all payload
//!   parts, plus the end-of-stream "source completed" stack on shutdown.

use bytes::Bytes;
use prost::Message;

use tfd_core::channel::OutputChannel;
use tfd_core::error::DataDistError;
use tfd_core::pool::PooledMessage;
use tfd_core::stf::{EquipmentIdentifier, StfOrigin, SubTimeFrame};
use tfd_proto::{ProcessingHeader, SourceInfoHeader, StackDataHeader};

/// Size of the per-STF block header in stream mode.
pub const STF_BLOCK_HEADER_SIZE: usize = 32;

/// Size of the per-group equipment header in stream mode.
pub const EQUIPMENT_HEADER_SIZE: usize = 24;

/// Payload description tag for STF data bursts.
pub const STF_DATA_DESCRIPTION: &str = "DISTSUBTIMEFRAME";

/// Payload description tag for control messages.
pub const INFO_DESCRIPTION: &str = "INFORMATION";

/// Encode the leading STF block header (little-endian).
///
/// Layout: id u64, data_size u64, first_orbit u32, group count u32,
/// origin u8, padding to 32 bytes.
pub fn encode_stf_block_header(stf: &SubTimeFrame, groups: u32) -> [u8; STF_BLOCK_HEADER_SIZE] {
    let mut out = [0u8; STF_BLOCK_HEADER_SIZE];
    out[0..8].copy_from_slice(&stf.id().to_le_bytes());
    out[8..16].copy_from_slice(&stf.data_size().to_le_bytes());
    out[16..20].copy_from_slice(&stf.first_orbit().to_le_bytes());
    out[20..24].copy_from_slice(&groups.to_le_bytes());
    out[24] = match stf.origin() {
        StfOrigin::Readout => 1,
        StfOrigin::Null => 0,
    };
    out
}

/// Decoded form of the STF block header (inspection, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StfBlockHeader {
    pub id: u64,
    pub data_size: u64,
    pub first_orbit: u32,
    pub groups: u32,
    pub origin: StfOrigin,
}

pub fn decode_stf_block_header(data: &[u8]) -> Option<StfBlockHeader> {
    if data.len() != STF_BLOCK_HEADER_SIZE {
        return None;
    }
    Some(StfBlockHeader {
        id: u64::from_le_bytes(data[0..8].try_into().ok()?),
        data_size: u64::from_le_bytes(data[8..16].try_into().ok()?),
        first_orbit: u32::from_le_bytes(data[16..20].try_into().ok()?),
        groups: u32::from_le_bytes(data[20..24].try_into().ok()?),
        origin: if data[24] == 1 {
            StfOrigin::Readout
        } else {
            StfOrigin::Null
        },
    })
}

/// Encode one equipment header (little-endian).
///
/// Layout: detector tag (3 ASCII bytes + NUL), subspec u32, link u8,
/// HBF count u32, group payload size u64, padding to 24 bytes.
pub fn encode_equipment_header(
    equipment: &EquipmentIdentifier,
    hbf_count: u32,
    group_size: u64,
) -> [u8; EQUIPMENT_HEADER_SIZE] {
    let mut out = [0u8; EQUIPMENT_HEADER_SIZE];
    out[0..3].copy_from_slice(equipment.origin.as_str().as_bytes());
    out[4..8].copy_from_slice(&equipment.subspec.to_le_bytes());
    out[8] = equipment.link_id;
    out[12..16].copy_from_slice(&hbf_count.to_le_bytes());
    out[16..24].copy_from_slice(&group_size.to_le_bytes());
    out
}

/// Decoded equipment header fields (inspection, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquipmentHeader {
    pub subspec: u32,
    pub link_id: u8,
    pub hbf_count: u32,
    pub group_size: u64,
}

pub fn decode_equipment_header(data: &[u8]) -> Option<EquipmentHeader> {
    if data.len() != EQUIPMENT_HEADER_SIZE {
        return None;
    }
    Some(EquipmentHeader {
        subspec: u32::from_le_bytes(data[4..8].try_into().ok()?),
        link_id: data[8],
        hbf_count: u32::from_le_bytes(data[12..16].try_into().ok()?),
        group_size: u64::from_le_bytes(data[16..24].try_into().ok()?),
    })
}

/// Common surface of both output encodings.
pub trait StfSerializer: Send {
    /// Write one STF as a multi-part burst; returns its payload size.
    fn serialize(&mut self, stf: SubTimeFrame) -> Result<u64, DataDistError>;

    /// End-of-stream signalling (processor mode only).
    fn finalize_stream(&mut self) -> Result<(), DataDistError> {
        Ok(())
    }

    /// Whether the underlying channel still reports running.
    fn channel_running(&self) -> bool;
}

/// Stream-mode serializer: interleaved header and data parts.
pub struct InterleavedHdrDataSerializer {
    channel: Box<dyn OutputChannel>,
}

impl InterleavedHdrDataSerializer {
    pub fn new(channel: Box<dyn OutputChannel>) -> Self {
        Self { channel }
    }
}

impl StfSerializer for InterleavedHdrDataSerializer {
    fn serialize(&mut self, stf: SubTimeFrame) -> Result<u64, DataDistError> {
        let size = stf.data_size();
        let block = encode_stf_block_header(&stf, stf.groups().len() as u32);
        let groups = stf.into_groups();

        let part_count = 1 + groups.iter().map(|g| 1 + g.hbfs.len()).sum::<usize>();
        let mut parts = Vec::with_capacity(part_count);
        parts.push(PooledMessage::unpooled(Bytes::copy_from_slice(&block)));
        for group in groups {
            let group_size: u64 = group.hbfs.iter().map(|m| m.len() as u64).sum();
            parts.push(PooledMessage::unpooled(Bytes::copy_from_slice(
                &encode_equipment_header(&group.equipment, group.hbfs.len() as u32, group_size),
            )));
            parts.extend(group.hbfs);
        }

        self.channel.send(parts)?;
        Ok(size)
    }

    fn channel_running(&self) -> bool {
        self.channel.is_running()
    }
}

/// Processor-mode serializer.
pub struct StfProcessorAdapter {
    channel: Box<dyn OutputChannel>,
}

impl StfProcessorAdapter {
    pub fn new(channel: Box<dyn OutputChannel>) -> Self {
        Self { channel }
    }
}

impl StfSerializer for StfProcessorAdapter {
    fn serialize(&mut self, stf: SubTimeFrame) -> Result<u64, DataDistError> {
        let size = stf.data_size();

        let mut stack = Vec::new();
        StackDataHeader {
            description: STF_DATA_DESCRIPTION.into(),
            origin: "ANY".into(),
            tf_id: stf.id(),
            payload_size: size,
            first_orbit: stf.first_orbit(),
        }
        .encode_length_delimited(&mut stack)
        .expect("vec encoding is infallible");
        ProcessingHeader { timeslice: stf.id() }
            .encode_length_delimited(&mut stack)
            .expect("vec encoding is infallible");

        let groups = stf.into_groups();
        let mut parts =
            Vec::with_capacity(1 + groups.iter().map(|g| g.hbfs.len()).sum::<usize>());
        parts.push(PooledMessage::unpooled(Bytes::from(stack)));
        for group in groups {
            parts.extend(group.hbfs);
        }

        self.channel.send(parts)?;
        Ok(size)
    }

    fn finalize_stream(&mut self) -> Result<(), DataDistError> {
        // The stack lives on a heap-owned buffer that stays valid until the
        // transport is done with it or stops, whichever comes first.
        let mut stack = Vec::new();
        StackDataHeader {
            description: INFO_DESCRIPTION.into(),
            origin: "ANY".into(),
            tf_id: 0,
            payload_size: 0,
            first_orbit: 0,
        }
        .encode_length_delimited(&mut stack)
        .expect("vec encoding is infallible");
        ProcessingHeader { timeslice: 0 }
            .encode_length_delimited(&mut stack)
            .expect("vec encoding is infallible");
        SourceInfoHeader::completed()
            .encode_length_delimited(&mut stack)
            .expect("vec encoding is infallible");

        self.channel.send(vec![
            PooledMessage::unpooled(Bytes::from(stack)),
            PooledMessage::unpooled(Bytes::new()),
        ])
    }

    fn channel_running(&self) -> bool {
        self.channel.is_running()
    }
}

/// Decode the control stack of a processor-mode burst (inspection, tests).
pub fn decode_control_stack(
    data: &[u8],
) -> Option<(StackDataHeader, ProcessingHeader, Option<SourceInfoHeader>)> {
    let mut buf = data;
    let data_header = StackDataHeader::decode_length_delimited(&mut buf).ok()?;
    let processing = ProcessingHeader::decode_length_delimited(&mut buf).ok()?;
    let source_info = if buf.is_empty() {
        None
    } else {
        Some(SourceInfoHeader::decode_length_delimited(&mut buf).ok()?)
    };
    Some((data_header, processing, source_info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tfd_core::channel::mem::output_pair;
    use tfd_core::detector::DataOrigin;
    use tfd_core::pool::MemoryPool;
    use tfd_core::stf::StfAccumulator;

    fn sample_stf() -> SubTimeFrame {
        let pool = MemoryPool::new(1 << 20);
        let mut acc = StfAccumulator::new(pool);
        let eq = EquipmentIdentifier {
            origin: DataOrigin::Tst,
            subspec: 0x10,
            link_id: 2,
        };
        acc.add_hbf_run(
            42,
            eq,
            9,
            vec![
                PooledMessage::unpooled(Bytes::from(vec![1u8; 128])),
                PooledMessage::unpooled(Bytes::from(vec![2u8; 128])),
            ],
        )
        .unwrap();
        acc.take().unwrap()
    }

    #[test]
    fn test_block_header_roundtrip() {
        let stf = sample_stf();
        let encoded = encode_stf_block_header(&stf, 1);
        let decoded = decode_stf_block_header(&encoded).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.data_size, 256);
        assert_eq!(decoded.first_orbit, 9);
        assert_eq!(decoded.groups, 1);
        assert_eq!(decoded.origin, StfOrigin::Readout);
    }

    #[test]
    fn test_stream_mode_part_layout() {
        let (out, sink) = output_pair("builder-out");
        let mut serializer = InterleavedHdrDataSerializer::new(Box::new(out));
        let size = serializer.serialize(sample_stf()).unwrap();
        assert_eq!(size, 256);

        let parts = sink.recv_timeout(Duration::from_millis(100)).unwrap();
        // block header + equipment header + 2 payloads
        assert_eq!(parts.len(), 4);
        let block = decode_stf_block_header(&parts[0].data).unwrap();
        assert_eq!(block.id, 42);
        let equip = decode_equipment_header(&parts[1].data).unwrap();
        assert_eq!(equip.subspec, 0x10);
        assert_eq!(equip.link_id, 2);
        assert_eq!(equip.hbf_count, 2);
        assert_eq!(equip.group_size, 256);
    }

    #[test]
    fn test_processor_mode_control_stack() {
        let (out, sink) = output_pair("processor");
        let mut adapter = StfProcessorAdapter::new(Box::new(out));
        adapter.serialize(sample_stf()).unwrap();

        let parts = sink.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(parts.len(), 3); // control stack + 2 payloads
        let (data_header, processing, source) = decode_control_stack(&parts[0].data).unwrap();
        assert_eq!(data_header.description, STF_DATA_DESCRIPTION);
        assert_eq!(data_header.tf_id, 42);
        assert_eq!(data_header.payload_size, 256);
        assert_eq!(processing.timeslice, 42);
        assert!(source.is_none());
    }

    #[test]
    fn test_source_completed_stack() {
        let (out, sink) = output_pair("processor");
        let mut adapter = StfProcessorAdapter::new(Box::new(out));
        adapter.finalize_stream().unwrap();

        let parts = sink.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[1].is_empty());
        let (data_header, _, source) = decode_control_stack(&parts[0].data).unwrap();
        assert_eq!(data_header.description, INFO_DESCRIPTION);
        assert_eq!(
            source.unwrap().state_checked(),
            tfd_proto::SourceState::Completed
        );
    }
}
