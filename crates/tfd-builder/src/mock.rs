//! Deterministic readout source for standalone runs and tests.
//!
//! Generates well-formed HbfBundles directly behind the [`ReadoutChannel`]
//! trait, the way the hardware transport would deliver them: a readout
//! header part followed by RDH-prefixed HBF payloads.

use bytes::{Bytes, BytesMut};

use tfd_core::channel::{ReadoutChannel, ReceiveOutcome};
use tfd_core::pool::PooledMessage;
use tfd_core::rdh::{RdhFrame, RdhVersion, RDH_HEADER_SIZE};
use tfd_core::readout::ReadoutMsgHeader;

/// Shape of the generated stream.
#[derive(Debug, Clone)]
pub struct MockReadoutConfig {
    /// Number of TFs to produce before going quiet.
    pub tf_count: u32,
    /// First TF id.
    pub first_tf_id: u32,
    /// HBFs per TF.
    pub hbfs_per_tf: usize,
    /// Payload bytes attached to each HBF after the RDH.
    pub hbf_payload: usize,
    /// Subspec pattern cycled over the HBFs of one TF (CRU ids).
    pub cru_pattern: Vec<u16>,
    pub link_id: u8,
    pub rdh_version: RdhVersion,
}

impl Default for MockReadoutConfig {
    fn default() -> Self {
        Self {
            tf_count: 100,
            first_tf_id: 1,
            hbfs_per_tf: 8,
            hbf_payload: 1024,
            cru_pattern: vec![0x10],
            link_id: 1,
            rdh_version: RdhVersion::V6,
        }
    }
}

/// Generator implementing the readout channel trait.
pub struct MockReadout {
    config: MockReadoutConfig,
    next_tf: u32,
    produced: u32,
}

impl MockReadout {
    pub fn new(config: MockReadoutConfig) -> Self {
        let next_tf = config.first_tf_id;
        Self {
            config,
            next_tf,
            produced: 0,
        }
    }

    fn hbf(&self, cru_id: u16, orbit: u32) -> PooledMessage {
        let mut frame = RdhFrame::single_page(
            self.config.rdh_version,
            cru_id,
            self.config.link_id,
            cru_id, // FEE id mirrors the CRU id in generated data
            orbit,
        );
        frame.memory_size = (RDH_HEADER_SIZE + self.config.hbf_payload) as u16;

        let mut buf = BytesMut::with_capacity(RDH_HEADER_SIZE + self.config.hbf_payload);
        buf.extend_from_slice(&frame.encode());
        buf.extend_from_slice(&vec![0xA5u8; self.config.hbf_payload]);
        PooledMessage::unpooled(buf.freeze())
    }

    fn next_bundle(&mut self) -> Vec<PooledMessage> {
        let tf_id = self.next_tf;
        let header = ReadoutMsgHeader::new(tf_id, self.config.link_id, true, true);

        let mut parts = Vec::with_capacity(1 + self.config.hbfs_per_tf);
        parts.push(PooledMessage::unpooled(Bytes::copy_from_slice(
            &header.encode(),
        )));
        for n in 0..self.config.hbfs_per_tf {
            let cru = self.config.cru_pattern[n % self.config.cru_pattern.len()];
            parts.push(self.hbf(cru, tf_id.wrapping_mul(256)));
        }

        self.next_tf += 1;
        self.produced += 1;
        parts
    }

    /// True once every configured TF was delivered.
    pub fn exhausted(&self) -> bool {
        self.produced >= self.config.tf_count
    }
}

impl ReadoutChannel for MockReadout {
    fn name(&self) -> &str {
        "mock-readout"
    }

    fn receive(&mut self, parts: &mut Vec<PooledMessage>) -> ReceiveOutcome {
        if self.exhausted() {
            // Stream finished; behave like an idle channel.
            std::thread::sleep(std::time::Duration::from_millis(100));
            return ReceiveOutcome::Timeout;
        }
        parts.extend(self.next_bundle());
        ReceiveOutcome::Parts
    }
}
