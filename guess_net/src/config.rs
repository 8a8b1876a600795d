//! Tunable knobs for the query engine, exposed through a builder the way
//! bip_dht's `DhtBuilder` and bip_disk's `DiskManagerBuilder` expose theirs:
//! chained setters over a handful of named constants, terminated by
//! `build()` into an immutable value the rest of the crate consumes. This
//! is a narrow, in-process configuration surface, not a file format.

/// Immutable snapshot of the query engine's tunables. Defaults match the
/// constants named in EXTERNAL INTERFACES.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GuessConfig {
    /// Concurrency ceiling in `Bounded` mode.
    pub alpha: usize,
    /// Seconds before an unanswered RPC is swept as timed out.
    pub rpc_lifetime_secs: i64,
    /// Acknowledgements at current hop count before promoting to `Loose`.
    pub warming_count: u32,
    /// Seconds a query key remains valid after issue.
    pub qk_lifetime_secs: i64,
    /// Upper bound on hosts tracked by the link cache.
    pub link_cache_size: usize,
    /// Outbound bandwidth budget, bytes per second.
    pub bandwidth_budget_bytes_per_sec: usize,
}

impl Default for GuessConfig {
    fn default() -> GuessConfig {
        GuessConfig {
            alpha: crate::query::DEFAULT_ALPHA,
            rpc_lifetime_secs: crate::rpc::RPC_LIFETIME_SECS,
            warming_count: crate::query::WARMING_COUNT,
            qk_lifetime_secs: crate::query_key::QK_LIFETIME_SECS,
            link_cache_size: crate::link_cache::MAX_CACHE_ENTRIES,
            bandwidth_budget_bytes_per_sec: 64 * 1024,
        }
    }
}

/// Builds a [`GuessConfig`] one override at a time; fields not touched keep
/// their default.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuessConfigBuilder {
    config: GuessConfig,
}

impl GuessConfigBuilder {
    pub fn new() -> GuessConfigBuilder {
        GuessConfigBuilder::default()
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.config.alpha = alpha;
        self
    }

    pub fn rpc_lifetime_secs(mut self, rpc_lifetime_secs: i64) -> Self {
        self.config.rpc_lifetime_secs = rpc_lifetime_secs;
        self
    }

    pub fn warming_count(mut self, warming_count: u32) -> Self {
        self.config.warming_count = warming_count;
        self
    }

    pub fn qk_lifetime_secs(mut self, qk_lifetime_secs: i64) -> Self {
        self.config.qk_lifetime_secs = qk_lifetime_secs;
        self
    }

    pub fn link_cache_size(mut self, link_cache_size: usize) -> Self {
        self.config.link_cache_size = link_cache_size;
        self
    }

    pub fn bandwidth_budget_bytes_per_sec(mut self, bandwidth_budget_bytes_per_sec: usize) -> Self {
        self.config.bandwidth_budget_bytes_per_sec = bandwidth_budget_bytes_per_sec;
        self
    }

    pub fn build(self) -> GuessConfig {
        self.config
    }
}
