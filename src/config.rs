//! Store configuration.
//!
//! `Config` carries every tunable the engine recognizes. The defaults are
//! sized for a mixed OLTP workload; tests routinely shrink
//! `max_page_items` and `flush_buffer_size` to exercise structural
//! modifications and buffer rotation with small data sets.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::StoreError;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the log segments and superblock.
    ///
    /// Ignored when `in_memory` is set.
    pub path: PathBuf,
    /// Size of one append-only log segment file in bytes.
    pub log_segment_size: u64,
    /// Byte capacity of a single flush buffer.
    pub flush_buffer_size: usize,
    /// Number of flush buffers in the rotation ring.
    pub num_flush_buffers: usize,
    /// Interval between group commits. A zero duration commits on every
    /// buffer flush.
    pub sync_interval: Duration,
    /// Delta-chain length that triggers a page compaction.
    pub max_delta_chain_len: usize,
    /// Item count that triggers a page split.
    pub max_page_items: usize,
    /// Item count below which a page is merged into its left sibling.
    pub min_page_items: usize,
    /// Maximum number of incremental log segments a page may accumulate
    /// before its next flush emits a fresh self-contained image.
    pub max_page_segments: u32,
    /// Memory-map sealed log segments for reads instead of using
    /// positional I/O.
    pub use_mmap: bool,
    /// Run the log cleaner in the background.
    pub auto_cleaner: bool,
    /// Run the page swapper in the background.
    pub auto_swapper: bool,
    /// Enable MVCC snapshots and recovery points.
    pub enable_snapshots: bool,
    /// Resident-memory quota in bytes. Eviction keeps the in-memory
    /// footprint near this value. `u64::MAX` disables eviction pressure.
    pub memory_quota: u64,
    /// Capacity of the mapping table (maximum number of live pages).
    pub mapping_table_size: usize,
    /// Log fragmentation ratio (0.0 to 1.0) above which the cleaner runs.
    pub cleaner_min_fragmentation: f64,
    /// Run without any persistence: no log, no recovery, pure cache.
    pub in_memory: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: PathBuf::from("lodestore.data"),
            log_segment_size: 64 * 1024 * 1024,
            flush_buffer_size: 1024 * 1024,
            num_flush_buffers: 2,
            sync_interval: Duration::from_secs(1),
            max_delta_chain_len: 200,
            max_page_items: 400,
            min_page_items: 25,
            max_page_segments: 4,
            use_mmap: false,
            auto_cleaner: true,
            auto_swapper: true,
            enable_snapshots: true,
            memory_quota: u64::MAX,
            mapping_table_size: 1 << 20,
            cleaner_min_fragmentation: 0.3,
            in_memory: false,
        }
    }
}

impl Config {
    /// Validates the configuration, returning a descriptive error for the
    /// first problem found.
    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.num_flush_buffers < 2 {
            return Err(StoreError::Config(
                "num_flush_buffers must be at least 2".to_string(),
            ));
        }
        if self.flush_buffer_size < 4096 {
            return Err(StoreError::Config(
                "flush_buffer_size must be at least 4096 bytes".to_string(),
            ));
        }
        if self.max_page_items <= self.min_page_items {
            return Err(StoreError::Config(
                "max_page_items must exceed min_page_items".to_string(),
            ));
        }
        if self.max_delta_chain_len == 0 || self.max_page_segments == 0 {
            return Err(StoreError::Config(
                "chain and segment limits must be non-zero".to_string(),
            ));
        }
        if self.mapping_table_size < 2 {
            return Err(StoreError::Config(
                "mapping_table_size must hold at least two pages".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cleaner_min_fragmentation) {
            return Err(StoreError::Config(
                "cleaner_min_fragmentation must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns whether this configuration persists data to a log.
    pub(crate) fn should_persist(&self) -> bool {
        !self.in_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_page_limits() {
        let cfg = Config {
            max_page_items: 10,
            min_page_items: 10,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn rejects_single_flush_buffer() {
        let cfg = Config {
            num_flush_buffers: 1,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(StoreError::Config(_))));
    }
}
