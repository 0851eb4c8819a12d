//! Typed configuration surface for the chunk memory / delegation core.
//!
//! The core itself never touches the environment or argv (see the
//! "Environment" contract): an embedding CLI or session builder is
//! expected to populate [`EngineConfig`] via `clap`, matching the pattern
//! of `rqbit`'s own `Opts` struct, and hand the result to the relevant
//! component constructors.

use std::time::Duration;

use clap::Args;

/// How aggressively `ChunkList::sync_chunks` should flush dirty pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SyncPolicy {
    /// Decide per-call based on `safe_sync` / free disk space (the
    /// default production behaviour).
    #[default]
    Auto,
    /// Always synchronous `msync`, regardless of free disk space.
    Safe,
    /// Always asynchronous `msync`.
    Sloppy,
}

#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// Global ceiling on bytes reserved for resident piece chunks. If
    /// unset, derived from `RLIMIT_AS` (4/5 of the soft limit, capped at
    /// 1 GiB if the limit itself is unset).
    #[arg(long = "max-memory-usage", env = "ENGINE_MAX_MEMORY_USAGE")]
    pub max_memory_usage: Option<u64>,

    /// Force synchronous msync regardless of free disk space.
    #[arg(long = "safe-sync", env = "ENGINE_SAFE_SYNC")]
    pub safe_sync: bool,

    /// Below this many free bytes on the content filesystem, sync_chunks
    /// treats every batch as "safe" (synchronous) even if `safe_sync`
    /// wasn't requested, to avoid losing un-flushed writes to ENOSPC.
    #[arg(
        long = "safe-free-diskspace-bytes",
        env = "ENGINE_SAFE_FREE_DISKSPACE_BYTES",
        default_value_t = 256 * 1024 * 1024
    )]
    pub safe_free_diskspace_bytes: u64,

    /// Enable endgame / aggressive delegation (multiple peers per block
    /// once ordinary delegation runs dry).
    #[arg(long = "aggressive", env = "ENGINE_AGGRESSIVE")]
    pub aggressive_default: bool,

    /// Sync-optimizer "close" gap: indices within this many pieces of
    /// each other are grouped into one run.
    #[arg(
        long = "sync-close-distance",
        env = "ENGINE_SYNC_CLOSE_DISTANCE",
        default_value_t = 5
    )]
    pub sync_close_distance: u32,

    /// Sync-optimizer weight budget, debited by distance^2 for every run
    /// skipped; once exhausted the rest of the queue is left untouched.
    #[arg(
        long = "sync-optimizer-weight",
        env = "ENGINE_SYNC_OPTIMIZER_WEIGHT",
        default_value_t = 50
    )]
    pub sync_optimizer_weight: i64,

    /// Runs shorter than this many pieces are skippable by the optimizer
    /// when not "required" by a stale `time_modified`.
    #[arg(
        long = "sync-optimizer-max-distance",
        env = "ENGINE_SYNC_OPTIMIZER_MAX_DISTANCE",
        default_value_t = 5
    )]
    pub sync_optimizer_max_distance: u32,

    /// How old a dirty node must be before its run is "required" and
    /// can't be skipped by the optimizer.
    #[arg(
        long = "sync-timeout",
        value_parser = parse_duration::parse,
        default_value = "10s",
        env = "ENGINE_SYNC_TIMEOUT"
    )]
    pub timeout_sync: Duration,

    #[arg(value_enum, long = "sync-policy", default_value_t = SyncPolicy::Auto, env = "ENGINE_SYNC_POLICY")]
    pub sync_policy: SyncPolicy,

    /// Rate limit for `try_free_memory`: at most one scan per this
    /// duration of cached time.
    #[arg(
        long = "free-memory-period",
        value_parser = parse_duration::parse,
        default_value = "10s",
        env = "ENGINE_FREE_MEMORY_PERIOD"
    )]
    pub try_free_memory_period: Duration,

    /// Grace period after a CHOKE during which a `choked` bucket isn't
    /// dropped, in case the peer unchokes again quickly.
    #[arg(
        long = "choked-bucket-grace",
        value_parser = parse_duration::parse,
        default_value = "6s",
        env = "ENGINE_CHOKED_BUCKET_GRACE"
    )]
    pub choked_bucket_grace: Duration,

    /// Longer grace period scheduled on UNCHOKE if a `choked` bucket is
    /// still non-empty, so in-flight pieces sent just before the unchoke
    /// can still land.
    #[arg(
        long = "choked-removal-grace",
        value_parser = parse_duration::parse,
        default_value = "60s",
        env = "ENGINE_CHOKED_REMOVAL_GRACE"
    )]
    pub choked_removal_grace: Duration,

    /// Maximum simultaneous peers per block once in endgame.
    #[arg(
        long = "endgame-max-overlap",
        env = "ENGINE_ENDGAME_MAX_OVERLAP",
        default_value_t = 4
    )]
    pub endgame_max_overlap: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: None,
            safe_sync: false,
            safe_free_diskspace_bytes: 256 * 1024 * 1024,
            aggressive_default: false,
            sync_close_distance: 5,
            sync_optimizer_weight: 50,
            sync_optimizer_max_distance: 5,
            timeout_sync: Duration::from_secs(10),
            sync_policy: SyncPolicy::Auto,
            try_free_memory_period: Duration::from_secs(10),
            choked_bucket_grace: Duration::from_secs(6),
            choked_removal_grace: Duration::from_secs(60),
            endgame_max_overlap: 4,
        }
    }
}

impl EngineConfig {
    /// Resolve `max_memory_usage`, deriving a default from `RLIMIT_AS`
    /// when unset: 4/5 of the soft limit, capped at 1 GiB if the limit
    /// itself is unset or unlimited.
    pub fn resolved_max_memory_usage(&self) -> u64 {
        const ONE_GIB: u64 = 1024 * 1024 * 1024;
        if let Some(explicit) = self.max_memory_usage {
            return explicit;
        }
        match rlimit::getrlimit(rlimit::Resource::AS) {
            Ok((soft, _hard)) if soft != rlimit::INFINITY => (soft * 4 / 5).min(ONE_GIB).max(1),
            _ => ONE_GIB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_memory_usage_wins() {
        let cfg = EngineConfig {
            max_memory_usage: Some(42),
            ..Default::default()
        };
        assert_eq!(cfg.resolved_max_memory_usage(), 42);
    }

    #[test]
    fn default_is_capped_at_one_gib() {
        let cfg = EngineConfig::default();
        assert!(cfg.resolved_max_memory_usage() <= 1024 * 1024 * 1024);
        assert!(cfg.resolved_max_memory_usage() > 0);
    }
}
