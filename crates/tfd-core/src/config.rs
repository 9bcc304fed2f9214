//! Configuration surface for the builder node and the scheduler.
//!
//! Settings load from an optional TOML file merged with `DATADIST_`-prefixed
//! environment overrides, then pass a validation step; startup aborts on the
//! first validation error. Readout parsing settings are snapshotted once
//! into a [`ReadoutConfig`] value at the composition root and passed by
//! reference into parsers and builders.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::detector::DataOrigin;
use crate::error::{DataDistError, Result};
use crate::rdh::{RdhVersion, SanityCheckMode, SubSpecMode};

/// Environment variable holding the hexadecimal FEE id mask.
pub const FEE_MASK_ENV: &str = "DATADIST_FEE_MASK";

/// Smallest permitted pipeline bound when one is configured.
pub const MIN_STFS_IN_PIPELINE: i64 = 4;

/// Builder-node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Readout input channel name.
    pub input_channel: String,
    /// Downstream output channel name (stream mode).
    pub output_channel: String,
    /// Processor bridge channel name; non-empty selects the adapter encoding.
    pub processor_channel: String,
    /// Run without any output channel.
    pub standalone: bool,
    /// Pipeline bound; ≤ 0 disables, otherwise clamped to at least 4.
    pub max_buffered_stfs: i64,
    /// Stop after this many sent STFs; 0 means unlimited.
    pub max_built_stfs: u64,
    /// Detector tag; required when the RDH version is below 6.
    pub detector: Option<DataOrigin>,
    /// RDH version of the incoming data.
    pub rdh_version: Option<RdhVersion>,
    /// Which RDH fields feed the subspecification.
    pub subspec_mode: SubSpecMode,
    /// Extent of per-HBF RDH verification.
    pub rdh_sanity_check: SanityCheckMode,
    /// Discard HBFs that carry only header pages (RDHv4 triggered mode).
    pub filter_empty_trigger_hbf: bool,
    /// Finalize (instead of drop) a partial STF on the assembly timeout.
    pub build_on_timeout: bool,
    /// Keep bundles whose TF id moved backwards instead of dropping them.
    pub keep_decreasing_tf_ids: bool,
    /// Memory-pool region size in bytes.
    pub region_size: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            input_channel: "readout".into(),
            output_channel: "builder-out".into(),
            processor_channel: String::new(),
            standalone: false,
            max_buffered_stfs: 0,
            max_built_stfs: 0,
            detector: None,
            rdh_version: None,
            subspec_mode: SubSpecMode::default(),
            rdh_sanity_check: SanityCheckMode::default(),
            filter_empty_trigger_hbf: false,
            build_on_timeout: false,
            keep_decreasing_tf_ids: false,
            region_size: 256 * 1024 * 1024,
        }
    }
}

impl BuilderConfig {
    /// Load from an optional TOML file plus `DATADIST_*` environment keys.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("DATADIST"));
        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation and clamping. Fatal on the startup path.
    pub fn validate(&mut self) -> Result<()> {
        if self.max_buffered_stfs > 0 && self.max_buffered_stfs < MIN_STFS_IN_PIPELINE {
            self.max_buffered_stfs = MIN_STFS_IN_PIPELINE;
            warn!(
                limit = self.max_buffered_stfs,
                "max buffered SubTimeFrames limit increased to the minimum"
            );
        }
        if self.max_buffered_stfs > 0 {
            warn!(
                limit = self.max_buffered_stfs,
                "pipeline bound set; consider increasing it if data loss occurs"
            );
        } else {
            info!("no limit on buffered SubTimeFrames; back-pressure may build up");
        }

        let rdh_version = self.rdh_version.ok_or_else(|| {
            DataDistError::Configuration(
                "rdh_version must be specified when receiving data from readout".into(),
            )
        })?;
        if rdh_version < RdhVersion::V6 && self.detector.is_none() {
            return Err(DataDistError::Configuration(
                "detector must be specified when the RDH version is below 6".into(),
            ));
        }
        if self.region_size == 0 {
            return Err(DataDistError::Configuration(
                "region_size must be greater than 0".into(),
            ));
        }
        if self.standalone && !self.processor_channel.is_empty() {
            warn!("standalone mode set; ignoring the processor channel");
            self.processor_channel.clear();
        }
        Ok(())
    }

    /// True when the processor-adapter encoding is selected.
    pub fn processor_enabled(&self) -> bool {
        !self.standalone && !self.processor_channel.is_empty()
    }

    /// Pipeline bound as an option.
    pub fn pipeline_bound(&self) -> Option<usize> {
        (self.max_buffered_stfs > 0).then_some(self.max_buffered_stfs as usize)
    }
}

/// Immutable readout-parsing settings, resolved once at startup.
#[derive(Debug, Clone, Copy)]
pub struct ReadoutConfig {
    pub rdh_version: RdhVersion,
    pub detector: Option<DataOrigin>,
    pub subspec_mode: SubSpecMode,
    pub sanity_check: SanityCheckMode,
    pub filter_empty_trigger_hbf: bool,
    pub fee_id_mask: u32,
}

impl ReadoutConfig {
    /// Snapshot the parsing settings, reading the FEE mask environment once.
    pub fn from_builder(cfg: &BuilderConfig) -> Result<Self> {
        let rdh_version = cfg.rdh_version.ok_or_else(|| {
            DataDistError::Configuration("rdh_version must be specified".into())
        })?;
        let fee_id_mask = fee_mask_from_env(std::env::var(FEE_MASK_ENV).ok().as_deref());
        info!(mask = format_args!("{fee_id_mask:#010x}"), "using FEE id mask");
        Ok(Self {
            rdh_version,
            detector: cfg.detector,
            subspec_mode: cfg.subspec_mode,
            sanity_check: cfg.rdh_sanity_check,
            filter_empty_trigger_hbf: cfg.filter_empty_trigger_hbf,
            fee_id_mask,
        })
    }

    /// Mask applied to subspecifications in FEE id mode.
    pub fn effective_subspec(&self, raw: u32) -> u32 {
        match self.subspec_mode {
            SubSpecMode::FeeId => raw & self.fee_id_mask,
            SubSpecMode::CruLinkId => raw,
        }
    }
}

fn fee_mask_from_env(value: Option<&str>) -> u32 {
    match value {
        None => u32::MAX,
        Some(raw) => {
            let trimmed = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
            match u32::from_str_radix(trimmed, 16) {
                Ok(mask) => mask,
                Err(_) => {
                    error!(value = raw, "cannot parse the FEE id mask, using all-ones");
                    u32::MAX
                }
            }
        }
    }
}

/// Scheduler-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Safety margin added to each TF reservation, in percent.
    pub overestimate_percent: u64,
    /// Builders silent for longer than this are removed from the ready set.
    pub discard_timeout_ms: u64,
    /// Period of the housekeeping scan.
    pub housekeeping_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            overestimate_percent: 10,
            discard_timeout_ms: 5_000,
            housekeeping_interval_ms: 1_500,
        }
    }
}

impl SchedulerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("DATADIST_SCHED"));
        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.housekeeping_interval_ms == 0 {
            return Err(DataDistError::Configuration(
                "housekeeping_interval_ms must be greater than 0".into(),
            ));
        }
        if self.discard_timeout_ms < self.housekeeping_interval_ms {
            return Err(DataDistError::Configuration(
                "discard_timeout_ms must not be below the housekeeping interval".into(),
            ));
        }
        Ok(())
    }

    pub fn discard_timeout(&self) -> Duration {
        Duration::from_millis(self.discard_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BuilderConfig {
        BuilderConfig {
            rdh_version: Some(RdhVersion::V6),
            ..BuilderConfig::default()
        }
    }

    #[test]
    fn test_validate_requires_rdh_version() {
        let mut cfg = BuilderConfig::default();
        assert!(matches!(
            cfg.validate(),
            Err(DataDistError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_requires_detector_below_v6() {
        let mut cfg = valid_config();
        cfg.rdh_version = Some(RdhVersion::V4);
        assert!(cfg.validate().is_err());

        cfg.detector = Some(DataOrigin::Tpc);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_clamps_pipeline_bound() {
        let mut cfg = valid_config();
        cfg.max_buffered_stfs = 2;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_buffered_stfs, MIN_STFS_IN_PIPELINE);
        assert_eq!(cfg.pipeline_bound(), Some(4));
    }

    #[test]
    fn test_validate_standalone_clears_processor() {
        let mut cfg = valid_config();
        cfg.standalone = true;
        cfg.processor_channel = "processor".into();
        cfg.validate().unwrap();
        assert!(!cfg.processor_enabled());
    }

    #[test]
    fn test_fee_mask_parsing() {
        assert_eq!(fee_mask_from_env(None), u32::MAX);
        assert_eq!(fee_mask_from_env(Some("0x00ff")), 0x00ff);
        assert_eq!(fee_mask_from_env(Some("FF00")), 0xff00);
        // Unparseable values fall back to all-ones.
        assert_eq!(fee_mask_from_env(Some("zz")), u32::MAX);
    }

    #[test]
    fn test_effective_subspec_masking() {
        let cfg = ReadoutConfig {
            rdh_version: RdhVersion::V6,
            detector: None,
            subspec_mode: SubSpecMode::FeeId,
            sanity_check: SanityCheckMode::Off,
            filter_empty_trigger_hbf: false,
            fee_id_mask: 0x0000ffff,
        };
        assert_eq!(cfg.effective_subspec(0xaabbccdd), 0x0000ccdd);

        let passthrough = ReadoutConfig {
            subspec_mode: SubSpecMode::CruLinkId,
            ..cfg
        };
        assert_eq!(passthrough.effective_subspec(0xaabbccdd), 0xaabbccdd);
    }

    #[test]
    fn test_scheduler_defaults_valid() {
        let cfg = SchedulerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.overestimate_percent, 10);
        assert_eq!(cfg.discard_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_scheduler_rejects_inverted_timeouts() {
        let cfg = SchedulerConfig {
            discard_timeout_ms: 100,
            housekeeping_interval_ms: 1_000,
            ..SchedulerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
