//! Defines the metric keys and labels used throughout lodestore.
//!
//! Using a central module for these constants helps prevent typos and
//! ensures consistency across the codebase.

// --- Metric Keys ---

/// Tracks the total number of user-initiated operations.
///
/// Labels:
/// - `type`: "insert", "delete", "lookup"
pub const OPERATIONS_TOTAL: &str = "lodestore_operations_total";

/// Tracks structural modification operations.
///
/// Labels:
/// - `kind`: "compact", "split", "merge"
pub const SMO_TOTAL: &str = "lodestore_smo_total";

/// Tracks structural modifications abandoned after a lost
/// compare-and-swap.
///
/// Labels:
/// - `kind`: "compact", "split", "merge", "insert", "delete", "swapin"
pub const SMO_CONFLICTS_TOTAL: &str = "lodestore_smo_conflicts_total";

/// Tracks the total number of bytes appended to the log.
pub const LSS_BYTES_WRITTEN_TOTAL: &str = "lodestore_lss_bytes_written_total";

/// Tracks the total number of block reads served by the log-structured
/// store.
pub const LSS_READS_TOTAL: &str = "lodestore_lss_reads_total";

/// Tracks page images moved between memory and the log.
///
/// Labels:
/// - `dir`: "out", "in"
pub const SWAP_TOTAL: &str = "lodestore_swap_total";

/// Tracks pages relocated by the log cleaner.
pub const CLEANER_RELOCATIONS_TOTAL: &str = "lodestore_cleaner_relocations_total";

/// Tracks completed cleaner passes.
pub const CLEANER_PASSES_TOTAL: &str = "lodestore_cleaner_passes_total";

/// A gauge of the estimated resident memory of all pages, in bytes.
pub const MEMORY_USAGE_BYTES: &str = "lodestore_memory_usage_bytes";

/// A gauge of the fraction of item versions resident in memory.
pub const RESIDENT_RATIO: &str = "lodestore_resident_ratio";

/// A gauge of log bytes written per ingested byte.
pub const WRITE_AMPLIFICATION: &str = "lodestore_write_amplification";

// --- Label Keys ---

pub const LABEL_OPERATION_TYPE: &str = "type";
pub const LABEL_SMO_KIND: &str = "kind";
pub const LABEL_SWAP_DIR: &str = "dir";
