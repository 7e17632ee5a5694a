//! Configuration for the timing core.
//!
//! A `defaults` module of named constants, per-area config structs each
//! with `#[serde(default = ...)]` fields so a partial JSON document still
//! deserializes, and a root `Config` aggregating them. Supplied via the
//! CLI's `--config <file>` or `Config::default()`.

use serde::Deserialize;

/// Baseline hardware constants used when a config field is omitted.
mod defaults {
    pub const NUM_CORES: usize = 1;
    pub const ROB_SIZE: usize = 128;
    pub const LSQ_SIZE: usize = 64;
    pub const ISSUEQ_SIZE: usize = 32;
    pub const PHYS_REGS_PER_FILE: usize = 256;
    pub const COMMIT_WIDTH: usize = 4;
    pub const FETCH_WIDTH: usize = 4;
    pub const ITLB_ENTRIES: usize = 64;
    pub const DTLB_ENTRIES: usize = 64;
    pub const BTB_ENTRIES: usize = 512;
    pub const RAS_ENTRIES: usize = 16;

    pub const L1_SETS: usize = 64;
    pub const L1_WAYS: usize = 8;
    pub const L1_LATENCY: u64 = 4;
    pub const L2_SETS: usize = 512;
    pub const L2_WAYS: usize = 8;
    pub const L2_LATENCY: u64 = 12;
    pub const L3_SETS: usize = 4096;
    pub const L3_WAYS: usize = 16;
    pub const L3_LATENCY: u64 = 35;
    pub const LINE_BYTES: u64 = 64;
    pub const QUEUE_DEPTH: usize = 16;
    pub const READ_PORTS: u32 = 2;
    pub const WRITE_PORTS: u32 = 1;

    pub const DIRECTORY_QUEUE_DEPTH: usize = 64;
    pub const DIRECTORY_DUMMY_POOL: usize = 8;

    pub const IN_ORDER_STORE_BUFFER: usize = 16;
}

/// Replacement policy names a config may select. Only pseudo-LRU exists
/// today, so this enum is single-variant on purpose: kept as an enum
/// (not a unit struct) so a future level-specific policy can be added
/// without breaking the config schema.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    #[default]
    Plru,
}

/// Configuration for one level of the MESI private cache hierarchy.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheLevelConfig {
    pub sets: usize,
    pub ways: usize,
    pub latency: u64,
    pub line_bytes: u64,
    pub queue_depth: usize,
    pub read_ports: u32,
    pub write_ports: u32,
    pub policy: ReplacementPolicy,
}

impl Default for CacheLevelConfig {
    fn default() -> Self {
        Self {
            sets: defaults::L1_SETS,
            ways: defaults::L1_WAYS,
            latency: defaults::L1_LATENCY,
            line_bytes: defaults::LINE_BYTES,
            queue_depth: defaults::QUEUE_DEPTH,
            read_ports: defaults::READ_PORTS,
            write_ports: defaults::WRITE_PORTS,
            policy: ReplacementPolicy::Plru,
        }
    }
}

/// The full per-core cache hierarchy (private L1/L2, shared L3).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheHierarchyConfig {
    pub l1i: CacheLevelConfig,
    pub l1d: CacheLevelConfig,
    pub l2: CacheLevelConfig,
    pub l3: CacheLevelConfig,
}

impl Default for CacheHierarchyConfig {
    fn default() -> Self {
        Self {
            l1i: CacheLevelConfig::default(),
            l1d: CacheLevelConfig::default(),
            l2: CacheLevelConfig {
                sets: defaults::L2_SETS,
                ways: defaults::L2_WAYS,
                latency: defaults::L2_LATENCY,
                ..CacheLevelConfig::default()
            },
            l3: CacheLevelConfig {
                sets: defaults::L3_SETS,
                ways: defaults::L3_WAYS,
                latency: defaults::L3_LATENCY,
                ..CacheLevelConfig::default()
            },
        }
    }
}

/// Directory controller sizing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub queue_depth: usize,
    pub dummy_pool: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            queue_depth: defaults::DIRECTORY_QUEUE_DEPTH,
            dummy_pool: defaults::DIRECTORY_DUMMY_POOL,
        }
    }
}

/// OoO core structural sizing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OooCoreConfig {
    pub rob_size: usize,
    pub lsq_size: usize,
    pub issueq_size: usize,
    pub phys_regs_per_file: usize,
    pub commit_width: usize,
    pub fetch_width: usize,
    pub itlb_entries: usize,
    pub dtlb_entries: usize,
    pub btb_entries: usize,
    pub ras_entries: usize,
}

impl Default for OooCoreConfig {
    fn default() -> Self {
        Self {
            rob_size: defaults::ROB_SIZE,
            lsq_size: defaults::LSQ_SIZE,
            issueq_size: defaults::ISSUEQ_SIZE,
            phys_regs_per_file: defaults::PHYS_REGS_PER_FILE,
            commit_width: defaults::COMMIT_WIDTH,
            fetch_width: defaults::FETCH_WIDTH,
            itlb_entries: defaults::ITLB_ENTRIES,
            dtlb_entries: defaults::DTLB_ENTRIES,
            btb_entries: defaults::BTB_ENTRIES,
            ras_entries: defaults::RAS_ENTRIES,
        }
    }
}

/// In-order (Atom-style) core structural sizing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct InOrderCoreConfig {
    pub store_buffer_size: usize,
    pub max_unresolved_branches: usize,
}

impl Default for InOrderCoreConfig {
    fn default() -> Self {
        Self {
            store_buffer_size: defaults::IN_ORDER_STORE_BUFFER,
            max_unresolved_branches: 8,
        }
    }
}

/// Which core model a machine configuration instantiates per socket.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoreKind {
    OutOfOrder,
    InOrder,
}

/// Stop conditions for a simulation run.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct StopConditions {
    pub stopinsns: Option<u64>,
    pub stopcycle: Option<u64>,
    pub stoprip: Option<u64>,
    pub startrip: Option<u64>,
    pub fast_fwd_insns: Option<u64>,
}

/// General simulation controls.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub machine: String,
    pub core_freq_mhz: u64,
    pub enable_checker: bool,
    pub perfect_cache: bool,
    pub logfile: Option<String>,
    pub loglevel: String,
    pub stats_path: Option<String>,
    pub yamlstats: bool,
    pub snapshot_cycles: Option<u64>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            machine: "default".to_string(),
            core_freq_mhz: 2000,
            enable_checker: false,
            perfect_cache: false,
            logfile: None,
            loglevel: "info".to_string(),
            stats_path: None,
            yamlstats: false,
            snapshot_cycles: None,
        }
    }
}

/// System-level (socket/thread count) configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub num_cores: usize,
    pub core_kind: CoreKind,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self { num_cores: defaults::NUM_CORES, core_kind: CoreKind::OutOfOrder }
    }
}

/// Top-level configuration for one simulation run.
///
/// ```
/// use marss_core::config::Config;
/// let cfg = Config::default();
/// assert_eq!(cfg.system.num_cores, 1);
/// ```
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub system: SystemConfig,
    pub cache: CacheHierarchyConfig,
    pub directory: DirectoryConfig,
    pub ooo: OooCoreConfig,
    pub inorder: InOrderCoreConfig,
    pub stop: StopConditions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_core_out_of_order() {
        let cfg = Config::default();
        assert_eq!(cfg.system.num_cores, 1);
        assert_eq!(cfg.system.core_kind, CoreKind::OutOfOrder);
    }

    #[test]
    fn partial_json_fills_remaining_fields_from_defaults() {
        let json = r#"{ "system": { "num_cores": 2 } }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.system.num_cores, 2);
        assert_eq!(cfg.cache.l1d.sets, defaults::L1_SETS);
    }
}
