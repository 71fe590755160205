//! Engine statistics.
//!
//! Every writer context owns a `Stats` block and updates it without
//! synchronization beyond the atomics themselves; [`crate::Store::stats`]
//! merges all blocks into a [`StatsSnapshot`]. The derived ratios (write
//! amplification, cache-hit ratio, resident ratio) are refreshed by the
//! runtime-stats daemon.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

macro_rules! stat_fields {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Raw counters, one block per writer context.
        #[derive(Default)]
        pub(crate) struct Stats {
            $($(#[$doc])* pub(crate) $name: AtomicI64,)*
        }

        /// A point-in-time merge of every writer's counters.
        #[derive(Debug, Default, Clone, Copy, PartialEq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: i64,)*
            /// Number of pages in the mapping table.
            pub num_pages: i64,
            /// Bytes appended to the log since open.
            pub bytes_written: i64,
            /// Log fragmentation percentage.
            pub lss_frag: i64,
            /// Live page bytes referenced from the log.
            pub lss_data_size: i64,
            /// Bytes between the log head and tail.
            pub lss_used_space: i64,
            /// Resident bytes across all page chains.
            pub mem_used: i64,
            /// Log bytes written per ingested byte, cumulative.
            pub write_amp_avg: f64,
            /// Log bytes written per ingested byte over the last stats
            /// interval.
            pub write_amp: f64,
            /// Fraction of page reads served without a log fetch.
            pub cache_hit_ratio: f64,
            /// Fraction of item versions resident in memory.
            pub resident_ratio: f64,
        }

        impl Stats {
            pub(crate) fn merge_into(&self, out: &mut StatsSnapshot) {
                $(out.$name += self.$name.load(Ordering::Relaxed);)*
            }
        }
    };
}

stat_fields! {
    /// Successful page compactions.
    compacts,
    /// Successful page splits.
    splits,
    /// Successful page merges.
    merges,
    /// Successful item inserts.
    inserts,
    /// Successful item deletes.
    deletes,
    /// Compactions abandoned after a lost compare-and-swap.
    compact_conflicts,
    /// Splits abandoned after a lost compare-and-swap.
    split_conflicts,
    /// Merges abandoned after a lost compare-and-swap.
    merge_conflicts,
    /// Insert publishes retried after a lost compare-and-swap.
    insert_conflicts,
    /// Delete publishes retried after a lost compare-and-swap.
    delete_conflicts,
    /// Swap-ins retried after a lost compare-and-swap.
    swapin_conflicts,
    /// User payload bytes ingested.
    bytes_incoming,
    /// Live page bytes this context has written to the log, net of
    /// superseded segments.
    flush_data_size,
    /// Bytes allocated for chain records.
    alloc_size,
    /// Bytes of chain records retired to the epoch reclaimer.
    free_size,
    /// Chain records allocated.
    num_record_allocs,
    /// Chain records retired.
    num_record_frees,
    /// Item versions evicted to the log.
    num_record_swapout,
    /// Item versions faulted back from the log.
    num_record_swapin,
    /// Block reads issued to the log-structured store.
    num_lss_reads,
    /// Payload bytes fetched from the log-structured store.
    lss_read_bytes,
    /// Page reads served entirely from memory.
    cache_hits,
    /// Page reads that needed a log fetch.
    cache_misses,
}

/// Shared doubles published by the runtime-stats daemon.
#[derive(Default)]
pub(crate) struct DerivedStats {
    pub(crate) write_amp_bits: AtomicU64,
    pub(crate) cache_hit_ratio_bits: AtomicU64,
}

impl DerivedStats {
    pub(crate) fn set_write_amp(&self, v: f64) {
        self.write_amp_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn write_amp(&self) -> f64 {
        f64::from_bits(self.write_amp_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_cache_hit_ratio(&self, v: f64) {
        self.cache_hit_ratio_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn cache_hit_ratio(&self) -> f64 {
        f64::from_bits(self.cache_hit_ratio_bits.load(Ordering::Relaxed))
    }
}

impl StatsSnapshot {
    /// Item versions currently resident versus total live versions.
    pub(crate) fn derive_resident_ratio(&mut self) {
        let cached = self.num_record_allocs - self.num_record_frees;
        let swapped = self.num_record_swapout - self.num_record_swapin;
        let total = cached + swapped;
        if total > 0 {
            self.resident_ratio = cached as f64 / total as f64;
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== Stats =====")?;
        writeln!(f, "count             = {}", self.inserts - self.deletes)?;
        writeln!(f, "compacts          = {}", self.compacts)?;
        writeln!(f, "splits            = {}", self.splits)?;
        writeln!(f, "merges            = {}", self.merges)?;
        writeln!(f, "inserts           = {}", self.inserts)?;
        writeln!(f, "deletes           = {}", self.deletes)?;
        writeln!(f, "compact_conflicts = {}", self.compact_conflicts)?;
        writeln!(f, "split_conflicts   = {}", self.split_conflicts)?;
        writeln!(f, "merge_conflicts   = {}", self.merge_conflicts)?;
        writeln!(f, "insert_conflicts  = {}", self.insert_conflicts)?;
        writeln!(f, "delete_conflicts  = {}", self.delete_conflicts)?;
        writeln!(f, "swapin_conflicts  = {}", self.swapin_conflicts)?;
        writeln!(f, "num_pages         = {}", self.num_pages)?;
        writeln!(f, "memory_used       = {}", self.mem_used)?;
        writeln!(f, "num_rec_allocs    = {}", self.num_record_allocs)?;
        writeln!(f, "num_rec_frees     = {}", self.num_record_frees)?;
        writeln!(f, "num_rec_swapout   = {}", self.num_record_swapout)?;
        writeln!(f, "num_rec_swapin    = {}", self.num_record_swapin)?;
        writeln!(f, "bytes_incoming    = {}", self.bytes_incoming)?;
        writeln!(f, "bytes_written     = {}", self.bytes_written)?;
        writeln!(f, "write_amp         = {:.2}", self.write_amp)?;
        writeln!(f, "write_amp_avg     = {:.2}", self.write_amp_avg)?;
        writeln!(f, "lss_fragmentation = {}%", self.lss_frag)?;
        writeln!(f, "lss_data_size     = {}", self.lss_data_size)?;
        writeln!(f, "lss_used_space    = {}", self.lss_used_space)?;
        writeln!(f, "lss_num_reads     = {}", self.num_lss_reads)?;
        writeln!(f, "lss_read_bs       = {}", self.lss_read_bytes)?;
        writeln!(f, "cache_hits        = {}", self.cache_hits)?;
        writeln!(f, "cache_misses      = {}", self.cache_misses)?;
        writeln!(f, "cache_hit_ratio   = {:.2}", self.cache_hit_ratio)?;
        writeln!(f, "resident_ratio    = {:.2}", self.resident_ratio)
    }
}
