//! Raw-data-header (RDH) field access for versions 3 through 6.
//!
//! Only the fields the pipeline needs are decoded: link id, FEE id, CRU id,
//! orbit counter, page geometry and the stop bit. The version is configured
//! once at startup and every frame is checked against it.
//!
//! Offsets are little-endian into the 64-byte header. The v3/v4 family and
//! the v5/v6 family differ in where the FEE id and the orbit counter live;
//! everything else is shared:
//!
//! | field            | v3/v4 | v5/v6 |
//! |------------------|-------|-------|
//! | version (u8)     | 0     | 0     |
//! | header size (u8) | 1     | 1     |
//! | fee id (u16)     | 4     | 2     |
//! | offset next (u16)| 8     | 8     |
//! | memory size (u16)| 10    | 10    |
//! | link id (u8)     | 12    | 12    |
//! | cru/endpoint(u16)| 14    | 14    |
//! | orbit (u32)      | 16    | 20    |
//! | stop bit (u8)    | 36    | 38    |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed RDH header size, all supported versions.
pub const RDH_HEADER_SIZE: usize = 64;

/// Errors raised while decoding an RDH prefix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RdhError {
    #[error("HBF too short for an RDH: {len} < {RDH_HEADER_SIZE}")]
    TooShort { len: usize },

    #[error("RDH version mismatch: configured v{expected}, frame carries v{found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("RDH header-size field is {found}, expected {RDH_HEADER_SIZE}")]
    BadHeaderSize { found: u8 },

    #[error("RDH page at offset {at} overruns the HBF ({next} past {len})")]
    PageOverrun { at: usize, next: usize, len: usize },

    #[error("final RDH page is missing the stop bit")]
    MissingStopBit,
}

/// Supported RDH versions. Selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RdhVersion {
    V3 = 3,
    V4 = 4,
    V5 = 5,
    V6 = 6,
}

impl RdhVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn fee_id_offset(self) -> usize {
        match self {
            RdhVersion::V3 | RdhVersion::V4 => 4,
            RdhVersion::V5 | RdhVersion::V6 => 2,
        }
    }

    fn orbit_offset(self) -> usize {
        match self {
            RdhVersion::V3 | RdhVersion::V4 => 16,
            RdhVersion::V5 | RdhVersion::V6 => 20,
        }
    }

    fn stop_offset(self) -> usize {
        match self {
            RdhVersion::V3 | RdhVersion::V4 => 36,
            RdhVersion::V5 | RdhVersion::V6 => 38,
        }
    }
}

impl TryFrom<u8> for RdhVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(RdhVersion::V3),
            4 => Ok(RdhVersion::V4),
            5 => Ok(RdhVersion::V5),
            6 => Ok(RdhVersion::V6),
            other => Err(format!("unsupported RDH version {other}, supported: 3, 4, 5, 6")),
        }
    }
}

impl From<RdhVersion> for u8 {
    fn from(v: RdhVersion) -> u8 {
        v.as_u8()
    }
}

impl FromStr for RdhVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let num: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid RDH version '{s}'"))?;
        RdhVersion::try_from(num)
    }
}

impl fmt::Display for RdhVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Which RDH fields feed the subspecification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubSpecMode {
    /// `(cruId << 8) | linkId`
    #[default]
    CruLinkId,
    /// The FEE id field verbatim.
    FeeId,
}

impl FromStr for SubSpecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cru_linkid" => Ok(SubSpecMode::CruLinkId),
            "feeid" => Ok(SubSpecMode::FeeId),
            other => Err(format!(
                "invalid subspec mode '{other}', allowed: 'cru_linkid', 'feeid'"
            )),
        }
    }
}

/// Extent of RDH verification applied to each HBF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanityCheckMode {
    #[default]
    Off,
    /// Log failures, keep the data.
    Print,
    /// Log failures and drop the offending HBF.
    Drop,
}

impl FromStr for SanityCheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(SanityCheckMode::Off),
            "print" => Ok(SanityCheckMode::Print),
            "drop" => Ok(SanityCheckMode::Drop),
            other => Err(format!(
                "invalid sanity check mode '{other}', allowed: off, print, drop"
            )),
        }
    }
}

const OFFSET_VERSION: usize = 0;
const OFFSET_HEADER_SIZE: usize = 1;
const OFFSET_SOURCE_ID: usize = 5;
const OFFSET_NEXT: usize = 8;
const OFFSET_MEMORY_SIZE: usize = 10;
const OFFSET_LINK_ID: usize = 12;
const OFFSET_CRU_ENDPOINT: usize = 14;

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Read-only view over the first RDH of an HBF.
#[derive(Debug, Clone, Copy)]
pub struct RdhReader<'a> {
    data: &'a [u8],
    version: RdhVersion,
}

impl<'a> RdhReader<'a> {
    /// Wrap an HBF payload, verifying length and the configured version.
    pub fn new(version: RdhVersion, data: &'a [u8]) -> Result<Self, RdhError> {
        if data.len() < RDH_HEADER_SIZE {
            return Err(RdhError::TooShort { len: data.len() });
        }
        let found = data[OFFSET_VERSION];
        if found != version.as_u8() {
            return Err(RdhError::VersionMismatch {
                expected: version.as_u8(),
                found,
            });
        }
        Ok(Self { data, version })
    }

    pub fn link_id(&self) -> u8 {
        self.data[OFFSET_LINK_ID]
    }

    pub fn fee_id(&self) -> u16 {
        read_u16(self.data, self.version.fee_id_offset())
    }

    pub fn cru_id(&self) -> u16 {
        read_u16(self.data, OFFSET_CRU_ENDPOINT) & 0x0fff
    }

    pub fn endpoint(&self) -> u8 {
        (read_u16(self.data, OFFSET_CRU_ENDPOINT) >> 12) as u8
    }

    pub fn orbit(&self) -> u32 {
        read_u32(self.data, self.version.orbit_offset())
    }

    pub fn memory_size(&self) -> u16 {
        read_u16(self.data, OFFSET_MEMORY_SIZE)
    }

    pub fn offset_to_next(&self) -> u16 {
        read_u16(self.data, OFFSET_NEXT)
    }

    pub fn stop_bit(&self) -> bool {
        self.data[self.version.stop_offset()] & 1 != 0
    }

    /// Numeric detector source id; carried by v6 headers only.
    pub fn source_id(&self) -> Option<u8> {
        match self.version {
            RdhVersion::V6 => Some(self.data[OFFSET_SOURCE_ID]),
            _ => None,
        }
    }

    /// Subspecification per the configured mode (unmasked).
    pub fn subspecification(&self, mode: SubSpecMode) -> u32 {
        match mode {
            SubSpecMode::CruLinkId => ((self.cru_id() as u32) << 8) | self.link_id() as u32,
            SubSpecMode::FeeId => self.fee_id() as u32,
        }
    }
}

/// Walk all RDH pages of an HBF and verify geometry and the stop bit.
///
/// Returns the number of pages on success.
pub fn sanity_check_hbf(version: RdhVersion, data: &[u8]) -> Result<u32, RdhError> {
    let mut pos = 0usize;
    let mut pages = 0u32;
    loop {
        let page = &data[pos..];
        if page.len() < RDH_HEADER_SIZE {
            return Err(RdhError::TooShort { len: page.len() });
        }
        if page[OFFSET_VERSION] != version.as_u8() {
            return Err(RdhError::VersionMismatch {
                expected: version.as_u8(),
                found: page[OFFSET_VERSION],
            });
        }
        if page[OFFSET_HEADER_SIZE] as usize != RDH_HEADER_SIZE {
            return Err(RdhError::BadHeaderSize {
                found: page[OFFSET_HEADER_SIZE],
            });
        }
        pages += 1;

        let stop = page[version.stop_offset()] & 1 != 0;
        let next = read_u16(page, OFFSET_NEXT) as usize;
        // offset 0 means the page extends to the end of the HBF
        if next == 0 || pos + next == data.len() {
            if !stop {
                return Err(RdhError::MissingStopBit);
            }
            return Ok(pages);
        }
        if next < RDH_HEADER_SIZE || pos + next > data.len() {
            return Err(RdhError::PageOverrun {
                at: pos,
                next: pos + next,
                len: data.len(),
            });
        }
        pos += next;
    }
}

/// True when every page of the HBF carries only its header (no payload).
///
/// Used by the empty-trigger filter for RDHv4 triggered running. The page
/// geometry fields live at version-independent offsets, so no version is
/// needed here; unparseable frames are left to the sanity check.
pub fn is_empty_hbf(data: &[u8]) -> bool {
    let mut pos = 0usize;
    while pos + RDH_HEADER_SIZE <= data.len() {
        let page = &data[pos..];
        if read_u16(page, OFFSET_MEMORY_SIZE) as usize > RDH_HEADER_SIZE {
            return false;
        }
        let next = read_u16(page, OFFSET_NEXT) as usize;
        if next < RDH_HEADER_SIZE || pos + next >= data.len() {
            break;
        }
        pos += next;
    }
    true
}

/// Field set for constructing RDH frames (mock source, tests).
#[derive(Debug, Clone, Copy)]
pub struct RdhFrame {
    pub version: RdhVersion,
    pub fee_id: u16,
    pub cru_id: u16,
    pub endpoint: u8,
    pub link_id: u8,
    pub source_id: u8,
    pub orbit: u32,
    pub memory_size: u16,
    pub offset_to_next: u16,
    pub stop: bool,
}

impl RdhFrame {
    /// A single-page frame with the stop bit set.
    pub fn single_page(version: RdhVersion, cru_id: u16, link_id: u8, fee_id: u16, orbit: u32) -> Self {
        Self {
            version,
            fee_id,
            cru_id,
            endpoint: 0,
            link_id,
            source_id: 0,
            orbit,
            memory_size: RDH_HEADER_SIZE as u16,
            offset_to_next: 0,
            stop: true,
        }
    }

    /// Encode one RDH page header.
    pub fn encode(&self) -> [u8; RDH_HEADER_SIZE] {
        let mut out = [0u8; RDH_HEADER_SIZE];
        out[OFFSET_VERSION] = self.version.as_u8();
        out[OFFSET_HEADER_SIZE] = RDH_HEADER_SIZE as u8;
        if self.version == RdhVersion::V6 {
            out[OFFSET_SOURCE_ID] = self.source_id;
        }
        let fee = self.version.fee_id_offset();
        out[fee..fee + 2].copy_from_slice(&self.fee_id.to_le_bytes());
        out[OFFSET_NEXT..OFFSET_NEXT + 2].copy_from_slice(&self.offset_to_next.to_le_bytes());
        out[OFFSET_MEMORY_SIZE..OFFSET_MEMORY_SIZE + 2]
            .copy_from_slice(&self.memory_size.to_le_bytes());
        out[OFFSET_LINK_ID] = self.link_id;
        let cru_ep = (self.cru_id & 0x0fff) | ((self.endpoint as u16) << 12);
        out[OFFSET_CRU_ENDPOINT..OFFSET_CRU_ENDPOINT + 2].copy_from_slice(&cru_ep.to_le_bytes());
        let orbit = self.version.orbit_offset();
        out[orbit..orbit + 4].copy_from_slice(&self.orbit.to_le_bytes());
        if self.stop {
            out[self.version.stop_offset()] = 1;
        }
        out
    }
}
