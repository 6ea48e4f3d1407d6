//! Space configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one Space. [`Default`] gives the production values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Patch facts accumulated per (branch, entity) before a snapshot is cut.
    pub snapshot_interval: u64,
    /// Maximum parent-chain length; forks beyond this are rejected.
    pub branch_depth_cap: usize,
    /// SQLite busy timeout.
    #[serde(with = "duration_millis")]
    pub busy_timeout: Duration,
    /// Page cache size in KiB.
    pub page_cache_kib: u32,
    /// mmap window in bytes.
    pub mmap_bytes: u64,
    /// Page size applied on database creation.
    pub page_size: u32,
    /// Wildcard query results per page.
    pub wildcard_page_size: usize,
    /// Client retries on `Conflict` before surfacing to the application.
    pub conflict_retry_limit: u32,
    /// Ring buffer capacity of the Space's notification bus.
    pub broadcast_buffer: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 10,
            branch_depth_cap: 8,
            busy_timeout: Duration::from_secs(5),
            page_cache_kib: 65_536,
            mmap_bytes: 256 * 1024 * 1024,
            page_size: 32_768,
            wildcard_page_size: 1_000,
            conflict_retry_limit: 3,
            broadcast_buffer: 256,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = SpaceConfig::default();
        assert_eq!(cfg.snapshot_interval, 10);
        assert_eq!(cfg.branch_depth_cap, 8);
        assert_eq!(cfg.busy_timeout, Duration::from_secs(5));
        assert_eq!(cfg.page_size, 32_768);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: SpaceConfig = serde_json::from_str(r#"{"snapshot_interval": 3}"#).unwrap();
        assert_eq!(cfg.snapshot_interval, 3);
        assert_eq!(cfg.branch_depth_cap, 8);
    }
}
