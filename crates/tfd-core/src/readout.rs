//! Readout update-message header, as received from the readout process.
//!
//! The first part of every multi-part delivery is this fixed-size
//! little-endian header. It is not forwarded downstream; the ingress stage
//! validates it and the assembly stage re-reads it from the retained bytes.
//!
//! Layout (16 bytes total):
//! - `version: u8` at offset 0
//! - `time_frame_id: u32` (LE) at offset 1
//! - `link_id: u8` at offset 5
//! - `flags: u16` (LE) at offset 6: bit 0 `lastTfMessage`, bit 1 `isRdhFormat`
//! - padding to 16 bytes

/// Readout interface version this build understands.
pub const READOUT_INTERFACE_VERSION: u8 = 2;

/// Declared size of the readout header part.
pub const READOUT_HEADER_SIZE: usize = 16;

const OFFSET_VERSION: usize = 0;
const OFFSET_TF_ID: usize = 1;
const OFFSET_LINK_ID: usize = 5;
const OFFSET_FLAGS: usize = 6;

const FLAG_LAST_TF_MESSAGE: u16 = 1 << 0;
const FLAG_IS_RDH_FORMAT: u16 = 1 << 1;

/// Decoded readout update header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadoutMsgHeader {
    pub version: u8,
    pub time_frame_id: u32,
    pub link_id: u8,
    flags: u16,
}

impl ReadoutMsgHeader {
    /// Decode a header from a received message part.
    ///
    /// Returns `None` when the part size does not match the declared header
    /// size; the caller drops such bundles with an error counter.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != READOUT_HEADER_SIZE {
            return None;
        }
        let time_frame_id = u32::from_le_bytes([
            data[OFFSET_TF_ID],
            data[OFFSET_TF_ID + 1],
            data[OFFSET_TF_ID + 2],
            data[OFFSET_TF_ID + 3],
        ]);
        let flags = u16::from_le_bytes([data[OFFSET_FLAGS], data[OFFSET_FLAGS + 1]]);
        Some(Self {
            version: data[OFFSET_VERSION],
            time_frame_id,
            link_id: data[OFFSET_LINK_ID],
            flags,
        })
    }

    /// True on the final bundle of a TF from this source.
    pub fn last_tf_message(&self) -> bool {
        self.flags & FLAG_LAST_TF_MESSAGE != 0
    }

    /// True when the payload parts carry an RDH prefix.
    pub fn is_rdh_format(&self) -> bool {
        self.flags & FLAG_IS_RDH_FORMAT != 0
    }

    /// Build a header for mock sources and tests.
    pub fn new(time_frame_id: u32, link_id: u8, last_tf_message: bool, is_rdh_format: bool) -> Self {
        let mut flags = 0;
        if last_tf_message {
            flags |= FLAG_LAST_TF_MESSAGE;
        }
        if is_rdh_format {
            flags |= FLAG_IS_RDH_FORMAT;
        }
        Self {
            version: READOUT_INTERFACE_VERSION,
            time_frame_id,
            link_id,
            flags,
        }
    }

    /// Override the version byte (mock sources exercising the reject path).
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> [u8; READOUT_HEADER_SIZE] {
        let mut out = [0u8; READOUT_HEADER_SIZE];
        out[OFFSET_VERSION] = self.version;
        out[OFFSET_TF_ID..OFFSET_TF_ID + 4].copy_from_slice(&self.time_frame_id.to_le_bytes());
        out[OFFSET_LINK_ID] = self.link_id;
        out[OFFSET_FLAGS..OFFSET_FLAGS + 2].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let hdr = ReadoutMsgHeader::new(0x01020304, 7, true, true);
        let parsed = ReadoutMsgHeader::parse(&hdr.encode()).unwrap();
        assert_eq!(parsed.time_frame_id, 0x01020304);
        assert_eq!(parsed.link_id, 7);
        assert!(parsed.last_tf_message());
        assert!(parsed.is_rdh_format());
        assert_eq!(parsed.version, READOUT_INTERFACE_VERSION);
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(ReadoutMsgHeader::parse(&[0u8; 15]).is_none());
        assert!(ReadoutMsgHeader::parse(&[0u8; 17]).is_none());
    }

    #[test]
    fn test_flags_independent() {
        let hdr = ReadoutMsgHeader::new(1, 0, false, true);
        let parsed = ReadoutMsgHeader::parse(&hdr.encode()).unwrap();
        assert!(!parsed.last_tf_message());
        assert!(parsed.is_rdh_format());
    }
}
