// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration surface.
//!
//! One typed struct per subsystem (`CertConfig`, `GcacheConfig`,
//! `MonitorConfig`), composed into `EngineConfig`. Defaults match the
//! contractual parameter names and values a host deployment expects;
//! `cert.max_length` and `cert.length_check` are protocol-critical and
//! must be identical on every node in a cluster.
//!
//! Behind the `config-file` feature, an `EngineConfig` can be loaded from
//! a YAML document; any key missing from the document falls back to the
//! compiled-in default.

use std::path::PathBuf;

/// Certification index parameters (`cert.*`).
#[derive(Clone, Debug)]
pub struct CertConfig {
    /// `cert.log_conflicts` - emit a log line for every realized conflict.
    pub log_conflicts: bool,
    /// `cert.optimistic_pa` - permit dependencies below `last_seen_seqno`
    /// when safe to do so.
    pub optimistic_pa: bool,
    /// `cert.max_length` - upper bound on index cardinality before pruning.
    pub max_length: u64,
    /// `cert.length_check` - bitmask rate-limiting pruning checks; tested
    /// as `global_seqno & length_check == 0`.
    pub length_check: u64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            log_conflicts: false,
            optimistic_pa: true,
            max_length: 16384,
            length_check: 127,
        }
    }
}

impl CertConfig {
    pub fn with_log_conflicts(mut self, on: bool) -> Self {
        self.log_conflicts = on;
        self
    }

    pub fn with_optimistic_pa(mut self, on: bool) -> Self {
        self.optimistic_pa = on;
        self
    }

    pub fn with_max_length(mut self, n: u64) -> Self {
        self.max_length = n;
        self
    }

    pub fn with_length_check(mut self, mask: u64) -> Self {
        self.length_check = mask;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_length == 0 {
            return Err(ConfigError::InvalidRange("cert.max_length must be > 0"));
        }
        if !self.length_check.wrapping_add(1).is_power_of_two() {
            return Err(ConfigError::InvalidRange(
                "cert.length_check must be one less than a power of two (a bitmask)",
            ));
        }
        Ok(())
    }
}

/// gcache parameters (`gcache.*`).
#[derive(Clone, Debug)]
pub struct GcacheConfig {
    /// `gcache.name` - path to the ring buffer file.
    pub name: PathBuf,
    /// `gcache.size` - ring buffer arena size in bytes.
    pub size: u64,
    /// `gcache.page_size` - minimum size of a newly created page file.
    pub page_size: u64,
    /// `gcache.keep_pages_size` - bytes of old page files to retain
    /// before the oldest unused page is unlinked.
    pub keep_pages_size: u64,
    /// `gcache.recover` - attempt ring-buffer recovery on startup.
    pub recover: bool,
    /// `gcache.debug` - bitmask: 1=mem, 2=rb, 4=pages.
    pub debug: u32,
    /// Soft cap (bytes) for the in-memory tier (§4.8). Not a wire
    /// parameter in the original, but must be configurable: it governs
    /// the mem/rb/page tier-selection boundary in `malloc`.
    pub mem_size: u64,
    /// Directory holding `gcache.page.NNNNNN` files.
    pub page_dir: PathBuf,
    /// Minimum number of page files to keep regardless of `keep_pages_size`.
    pub keep_pages: usize,
}

impl Default for GcacheConfig {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            name: PathBuf::from("gcache"),
            size: 128 * MIB,
            page_size: 128 * MIB,
            keep_pages_size: 0,
            recover: false,
            debug: 0,
            mem_size: 16 * MIB,
            page_dir: PathBuf::from("."),
            keep_pages: 0,
        }
    }
}

impl GcacheConfig {
    pub fn with_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.name = path.into();
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size = bytes;
        self
    }

    pub fn with_page_size(mut self, bytes: u64) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn with_recover(mut self, on: bool) -> Self {
        self.recover = on;
        self
    }

    pub fn with_mem_size(mut self, bytes: u64) -> Self {
        self.mem_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size < 4096 {
            return Err(ConfigError::InvalidRange("gcache.size too small to hold a header"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::InvalidRange("gcache.page_size must be > 0"));
        }
        Ok(())
    }
}

/// Ordering monitor parameters.
#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    /// Whether the commit monitor runs in bypass mode (appliers commit
    /// in any order) rather than enforcing seqno order.
    pub commit_order_bypass: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { commit_order_bypass: false }
    }
}

/// Flow-control parameters (§5, `gcs_fc.c`-derived).
#[derive(Clone, Copy, Debug)]
pub struct FlowControlConfig {
    /// Slave queue hard limit in bytes. Must be > 0.
    pub hard_limit: i64,
    /// Soft limit as a fraction of `hard_limit`, in `[0.0, 1.0)`.
    pub soft_limit_fraction: f64,
    /// Replication speed fraction retained at the hard limit, in `[0.0, 1.0)`.
    /// `0.0` means total stop (returns "eternity") once the hard limit is hit.
    pub max_throttle: f64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            hard_limit: 16 * 1024 * 1024,
            soft_limit_fraction: 0.25,
            max_throttle: 0.0,
        }
    }
}

impl FlowControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hard_limit < 0 {
            return Err(ConfigError::InvalidRange("hard_limit must be >= 0"));
        }
        if !(0.0..1.0).contains(&self.soft_limit_fraction) {
            return Err(ConfigError::InvalidRange("soft_limit_fraction must be in [0.0, 1.0)"));
        }
        if !(0.0..1.0).contains(&self.max_throttle) {
            return Err(ConfigError::InvalidRange("max_throttle must be in [0.0, 1.0)"));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub cert: CertConfig,
    pub gcache: GcacheConfig,
    pub monitor: MonitorConfig,
    pub flow_control: FlowControlConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cert.validate()?;
        self.gcache.validate()?;
        self.flow_control.validate()?;
        Ok(())
    }

    /// Load configuration from a YAML document, falling back to defaults
    /// for any field absent from the document.
    #[cfg(feature = "config-file")]
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Raw {
            cert: RawCert,
            gcache: RawGcache,
            monitor: RawMonitor,
            flow_control: RawFlowControl,
        }
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct RawCert {
            log_conflicts: Option<bool>,
            optimistic_pa: Option<bool>,
            max_length: Option<u64>,
            length_check: Option<u64>,
        }
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct RawGcache {
            name: Option<PathBuf>,
            size: Option<u64>,
            page_size: Option<u64>,
            keep_pages_size: Option<u64>,
            recover: Option<bool>,
            debug: Option<u32>,
            mem_size: Option<u64>,
            page_dir: Option<PathBuf>,
            keep_pages: Option<usize>,
        }
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct RawMonitor {
            commit_order_bypass: Option<bool>,
        }
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct RawFlowControl {
            hard_limit: Option<i64>,
            soft_limit_fraction: Option<f64>,
            max_throttle: Option<f64>,
        }

        let raw: Raw = serde_yaml::from_str(text)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let defaults = Self::default();
        let cfg = Self {
            cert: CertConfig {
                log_conflicts: raw.cert.log_conflicts.unwrap_or(defaults.cert.log_conflicts),
                optimistic_pa: raw.cert.optimistic_pa.unwrap_or(defaults.cert.optimistic_pa),
                max_length: raw.cert.max_length.unwrap_or(defaults.cert.max_length),
                length_check: raw.cert.length_check.unwrap_or(defaults.cert.length_check),
            },
            gcache: GcacheConfig {
                name: raw.gcache.name.unwrap_or(defaults.gcache.name),
                size: raw.gcache.size.unwrap_or(defaults.gcache.size),
                page_size: raw.gcache.page_size.unwrap_or(defaults.gcache.page_size),
                keep_pages_size: raw
                    .gcache
                    .keep_pages_size
                    .unwrap_or(defaults.gcache.keep_pages_size),
                recover: raw.gcache.recover.unwrap_or(defaults.gcache.recover),
                debug: raw.gcache.debug.unwrap_or(defaults.gcache.debug),
                mem_size: raw.gcache.mem_size.unwrap_or(defaults.gcache.mem_size),
                page_dir: raw.gcache.page_dir.unwrap_or(defaults.gcache.page_dir),
                keep_pages: raw.gcache.keep_pages.unwrap_or(defaults.gcache.keep_pages),
            },
            monitor: MonitorConfig {
                commit_order_bypass: raw
                    .monitor
                    .commit_order_bypass
                    .unwrap_or(defaults.monitor.commit_order_bypass),
            },
            flow_control: FlowControlConfig {
                hard_limit: raw.flow_control.hard_limit.unwrap_or(defaults.flow_control.hard_limit),
                soft_limit_fraction: raw
                    .flow_control
                    .soft_limit_fraction
                    .unwrap_or(defaults.flow_control.soft_limit_fraction),
                max_throttle: raw
                    .flow_control
                    .max_throttle
                    .unwrap_or(defaults.flow_control.max_throttle),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration validation error.
#[derive(Debug)]
pub enum ConfigError {
    InvalidRange(&'static str),
    #[allow(dead_code)]
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidRange(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn cert_max_length_zero_rejected() {
        let cfg = CertConfig::default().with_max_length(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRange(_))));
    }

    #[test]
    fn cert_length_check_must_be_bitmask() {
        let cfg = CertConfig::default().with_length_check(100);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRange(_))));
        let cfg = CertConfig::default().with_length_check(255);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn gcache_size_too_small_rejected() {
        let cfg = GcacheConfig::default().with_size(100);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRange(_))));
    }

    #[test]
    fn flow_control_rejects_out_of_range_fractions() {
        let mut cfg = FlowControlConfig::default();
        cfg.soft_limit_fraction = 1.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRange(_))));
        cfg.soft_limit_fraction = 0.25;
        cfg.max_throttle = -0.1;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRange(_))));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn from_yaml_partial_document_keeps_defaults() {
        let yaml = "cert:\n  max_length: 4096\n";
        let cfg = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.cert.max_length, 4096);
        assert_eq!(cfg.cert.length_check, CertConfig::default().length_check);
        assert_eq!(cfg.gcache.size, GcacheConfig::default().size);
    }
}
