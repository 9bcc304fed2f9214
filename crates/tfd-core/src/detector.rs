//! Detector data-origin tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Detector a readout stream originates from.
///
/// Required configuration when the RDH version is below 6 (older headers do
/// not carry a source id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataOrigin {
    Aco,
    Cpv,
    Ctp,
    Emc,
    Ft0,
    Fv0,
    Fdd,
    Hmp,
    Its,
    Mch,
    Mft,
    Mid,
    Phs,
    Tof,
    Tpc,
    Trd,
    Zdc,
    Tst,
}

impl DataOrigin {
    /// Map an RDHv6 numeric source id to its detector.
    pub fn from_source_id(id: u8) -> Option<Self> {
        const TABLE: [DataOrigin; 18] = [
            DataOrigin::Aco,
            DataOrigin::Cpv,
            DataOrigin::Ctp,
            DataOrigin::Emc,
            DataOrigin::Ft0,
            DataOrigin::Fv0,
            DataOrigin::Fdd,
            DataOrigin::Hmp,
            DataOrigin::Its,
            DataOrigin::Mch,
            DataOrigin::Mft,
            DataOrigin::Mid,
            DataOrigin::Phs,
            DataOrigin::Tof,
            DataOrigin::Tpc,
            DataOrigin::Trd,
            DataOrigin::Zdc,
            DataOrigin::Tst,
        ];
        TABLE.get(id as usize).copied()
    }

    /// Three-letter detector tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrigin::Aco => "ACO",
            DataOrigin::Cpv => "CPV",
            DataOrigin::Ctp => "CTP",
            DataOrigin::Emc => "EMC",
            DataOrigin::Ft0 => "FT0",
            DataOrigin::Fv0 => "FV0",
            DataOrigin::Fdd => "FDD",
            DataOrigin::Hmp => "HMP",
            DataOrigin::Its => "ITS",
            DataOrigin::Mch => "MCH",
            DataOrigin::Mft => "MFT",
            DataOrigin::Mid => "MID",
            DataOrigin::Phs => "PHS",
            DataOrigin::Tof => "TOF",
            DataOrigin::Tpc => "TPC",
            DataOrigin::Trd => "TRD",
            DataOrigin::Zdc => "ZDC",
            DataOrigin::Tst => "TST",
        }
    }
}

impl FromStr for DataOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACO" => Ok(DataOrigin::Aco),
            "CPV" => Ok(DataOrigin::Cpv),
            "CTP" => Ok(DataOrigin::Ctp),
            "EMC" => Ok(DataOrigin::Emc),
            "FT0" => Ok(DataOrigin::Ft0),
            "FV0" => Ok(DataOrigin::Fv0),
            "FDD" => Ok(DataOrigin::Fdd),
            "HMP" => Ok(DataOrigin::Hmp),
            "ITS" => Ok(DataOrigin::Its),
            "MCH" => Ok(DataOrigin::Mch),
            "MFT" => Ok(DataOrigin::Mft),
            "MID" => Ok(DataOrigin::Mid),
            "PHS" => Ok(DataOrigin::Phs),
            "TOF" => Ok(DataOrigin::Tof),
            "TPC" => Ok(DataOrigin::Tpc),
            "TRD" => Ok(DataOrigin::Trd),
            "ZDC" => Ok(DataOrigin::Zdc),
            "TST" => Ok(DataOrigin::Tst),
            other => Err(format!(
                "unknown detector '{other}', allowed: ACO, CPV, CTP, EMC, FT0, FV0, FDD, \
                 HMP, ITS, MCH, MFT, MID, PHS, TOF, TPC, TRD, ZDC, TST"
            )),
        }
    }
}

impl fmt::Display for DataOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
