//! The iterative GUESS query scheduler.
//!
//! One `GuessQuery` tracks a single outstanding search: a pool of
//! candidate ultrapeers, a concurrency budget, and the bookkeeping needed
//! to promote from `Bounded` to `Loose` mode as acknowledgements arrive.
//! Iteration is driven externally (by the worker event loop calling
//! `iterate` once per callout tick) rather than self-scheduling, the same
//! separation bip_dht's `TableLookup` keeps from its owning `DhtHandler`.

use std::collections::VecDeque;
use std::net::SocketAddr;

use chrono::{DateTime, Duration, UTC};

use guess_util::trans::Muid;

use crate::ggep::{self, Extension, QueryMessage};
use crate::hit::{HitMatcher, MatchMode};
use crate::link_cache::GuessLinkCache;
use crate::query_key::{self, GuessQueryKeyStore};

/// After this many acknowledgements the query drops its `alpha` ceiling
/// against in-flight RPCs and always issues a full `alpha` batch.
pub const WARMING_COUNT: u32 = 100;
pub const DEFAULT_ALPHA: usize = 5;
/// Minimum gap between query-key requests to the same host.
pub const QK_REQUEST_SPACING_SECS: i64 = 60;
/// A full pool-store scan is rate-limited to once per this long.
pub const DBLOAD_DELAY_SECS: i64 = 60;
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;
pub const ALIVE_PROBABILITY_FLOOR: f64 = 0.5;
/// How far back a query-key-store entry's `last_timeout` must be before
/// it's considered stale enough to retry, for the `load_pool` fallback
/// predicate. Reuses the store's own pruning cadence as the staleness bar.
pub const QK_TIMEOUT_STALE_SECS: i64 = query_key::QK_PRUNE_INTERVAL_SECS;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum QueryMode {
    Bounded,
    Loose,
}

bitflags! {
    /// Scheduling-state bits carried on a `GuessQuery`; see DATA MODEL and
    /// COMPONENT DESIGN §4.7.
    pub struct QueryFlags: u8 {
        /// Pin preventing the worker's housekeeping sweep from destroying a
        /// terminated query out from under an external caller still holding
        /// a reference to it (e.g. draining its hit-reporting channel).
        const DONT_REMOVE  = 0b0000_0001;
        /// Set for one iteration after a synchronous UDP send failure, so
        /// the next `iterate` call backs off instead of immediately retrying.
        const DELAYED      = 0b0000_0010;
        /// A dispatch from the most recent tick was synchronously dropped
        /// by the UDP send queue.
        const UDP_DROP     = 0b0000_0100;
        /// Set for the duration of an `iterate` call's dispatch loop.
        const SENDING      = 0b0000_1000;
        /// The query has exhausted its pool and is waiting for a hit or for
        /// the pool to be refilled before it can terminate.
        const END_STARVING = 0b0001_0000;
        /// A full `QueryKeyStore` pool-load was rate-limited; honour it on
        /// the next `load_pool` call.
        const POOL_LOAD    = 0b0010_0000;
    }
}

/// What the scheduler wants to do with a pool entry this iteration.
#[derive(Clone, Copy, PartialEq, Debug)]
enum FilterVerdict {
    Drop,
    Skip,
    Use,
}

#[derive(Clone, Debug)]
struct PoolEntry {
    addr: SocketAddr,
    timeouts: u32,
    last_timeout: Option<DateTime<UTC>>,
    qk_pending_since: Option<DateTime<UTC>>,
}

impl PoolEntry {
    fn fresh(addr: SocketAddr) -> PoolEntry {
        PoolEntry {
            addr,
            timeouts: 0,
            last_timeout: None,
            qk_pending_since: None,
        }
    }

    fn recontact_grace_secs(&self) -> i64 {
        5 * 2i64.pow(self.timeouts.min(20))
    }
}

/// One piece of outbound work the worker loop must put on the wire.
pub enum Dispatch {
    QueryKeyPing { to: SocketAddr, muid: Muid, bytes: Vec<u8> },
    Query { to: SocketAddr, muid: Muid, bytes: Vec<u8> },
}

pub struct GuessQuery {
    pub muid: Muid,
    pub search_text: String,
    matcher: HitMatcher,
    pub mode: QueryMode,
    pub hops: u32,
    pub query_acks: u32,
    pub kept_results: u32,
    alpha: usize,
    search_max_results: u32,
    max_ultrapeers: u32,
    pool: VecDeque<PoolEntry>,
    last_pool_load: Option<DateTime<UTC>>,
    /// RPCs registered against this query and not yet answered or timed
    /// out; caps the `Bounded`-mode dispatch budget (see DATA MODEL).
    rpc_pending: u32,
    warming_count: u32,
    flags: QueryFlags,
    cancelled: bool,
}

impl GuessQuery {
    pub fn new(
        muid: Muid,
        search_text: String,
        mode: MatchMode,
        search_max_results: u32,
        store_size_hint: u32,
    ) -> GuessQuery {
        GuessQuery::new_inner(muid, search_text, mode, search_max_results, store_size_hint, DEFAULT_ALPHA, WARMING_COUNT)
    }

    /// As [`GuessQuery::new`], but `alpha` and `warming_count` come from a
    /// [`crate::config::GuessConfig`] instead of the module defaults.
    pub fn with_config(
        muid: Muid,
        search_text: String,
        mode: MatchMode,
        search_max_results: u32,
        store_size_hint: u32,
        config: &crate::config::GuessConfig,
    ) -> GuessQuery {
        GuessQuery::new_inner(
            muid,
            search_text,
            mode,
            search_max_results,
            store_size_hint,
            config.alpha,
            config.warming_count,
        )
    }

    fn new_inner(
        muid: Muid,
        search_text: String,
        mode: MatchMode,
        search_max_results: u32,
        store_size_hint: u32,
        alpha: usize,
        warming_count: u32,
    ) -> GuessQuery {
        GuessQuery {
            muid,
            matcher: HitMatcher::new(mode, &search_text),
            search_text,
            mode: QueryMode::Bounded,
            hops: 0,
            query_acks: 0,
            kept_results: 0,
            alpha,
            search_max_results,
            max_ultrapeers: ((0.85 * store_size_hint as f64).ceil() as u32).max(50_000),
            pool: VecDeque::new(),
            last_pool_load: None,
            rpc_pending: 0,
            warming_count,
            flags: QueryFlags::empty(),
            cancelled: false,
        }
    }

    pub fn matches(&self, hit_file_name: &str) -> bool {
        self.matcher.matches(hit_file_name)
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancelled
            || self.query_acks >= self.max_ultrapeers
            || self.kept_results >= self.search_max_results
            || (self.flags.contains(QueryFlags::END_STARVING)
                && self.pool.is_empty()
                && !self.flags.contains(QueryFlags::POOL_LOAD))
    }

    /// Pin the query against the worker's terminated-query sweep, e.g.
    /// while an external caller still holds a reference to it.
    pub fn pin(&mut self) {
        self.flags.insert(QueryFlags::DONT_REMOVE);
    }

    pub fn unpin(&mut self) {
        self.flags.remove(QueryFlags::DONT_REMOVE);
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.contains(QueryFlags::DONT_REMOVE)
    }

    /// Called by the worker loop once an RPC dispatched for this query has
    /// actually been registered with `GuessRpc`.
    pub fn note_rpc_registered(&mut self) {
        self.rpc_pending += 1;
    }

    /// Called when a registered RPC for this query is answered or times out.
    pub fn note_rpc_resolved(&mut self) {
        self.rpc_pending = self.rpc_pending.saturating_sub(1);
    }

    /// Called when a dispatch produced by this query's last `iterate` was
    /// synchronously dropped by the UDP send queue.
    pub fn note_udp_drop(&mut self) {
        self.flags.insert(QueryFlags::UDP_DROP);
    }

    /// Seed the pool from the link cache; falls back to the query key
    /// store only when the link cache yields nothing. A fallback scan is
    /// rate-limited to once per `DBLOAD_DELAY_SECS`; a request arriving
    /// before that sets `PoolLoad` so a later call knows one is owed.
    pub fn load_pool(
        &mut self,
        link_cache: &mut GuessLinkCache,
        key_store: &GuessQueryKeyStore,
        now: DateTime<UTC>,
    ) {
        let from_links = link_cache.seed_pool(self.alpha * 4);
        if !from_links.is_empty() {
            for addr in from_links {
                self.push_if_absent(addr);
            }
            self.flags.remove(QueryFlags::POOL_LOAD);
            return;
        }

        if let Some(last) = self.last_pool_load {
            if (now - last).num_seconds() < DBLOAD_DELAY_SECS {
                self.flags.insert(QueryFlags::POOL_LOAD);
                return;
            }
        }
        self.last_pool_load = Some(now);
        self.flags.remove(QueryFlags::POOL_LOAD);

        let candidates: Vec<SocketAddr> = key_store
            .iter()
            .filter(|&(_, entry)| {
                let stale = entry
                    .last_timeout
                    .map_or(false, |lt| (now - lt).num_seconds() >= QK_TIMEOUT_STALE_SECS);
                let probability =
                    query_key::still_alive_probability(entry.first_seen, entry.last_seen, entry.timeouts, entry.last_timeout, now);
                entry.timeouts == 0 || (stale && probability >= ALIVE_PROBABILITY_FLOOR)
            })
            .map(|(&(ip, port), _)| SocketAddr::new(ip, port))
            .take(self.alpha * 4)
            .collect();

        for addr in candidates {
            self.push_if_absent(addr);
        }
    }

    fn push_if_absent(&mut self, addr: SocketAddr) {
        if !self.pool.iter().any(|entry| entry.addr == addr) {
            self.pool.push_back(PoolEntry::fresh(addr));
        }
    }

    /// External callers (link-cache IPP absorption, query-key-store scan)
    /// push discovered candidates in here directly.
    pub fn offer_candidate(&mut self, addr: SocketAddr) {
        self.push_if_absent(addr);
    }

    fn filter(&self, entry: &PoolEntry, now: DateTime<UTC>) -> FilterVerdict {
        if entry.timeouts > MAX_CONSECUTIVE_TIMEOUTS {
            return FilterVerdict::Drop;
        }

        if let Some(last_timeout) = entry.last_timeout {
            if (now - last_timeout).num_seconds() < entry.recontact_grace_secs() {
                return FilterVerdict::Skip;
            }
        }

        if let Some(pending_since) = entry.qk_pending_since {
            if (now - pending_since).num_seconds() < QK_REQUEST_SPACING_SECS {
                return FilterVerdict::Skip;
            }
        }

        FilterVerdict::Use
    }

    /// Run one scheduling iteration, producing zero or more messages for
    /// the worker loop to put on the wire.
    pub fn iterate(&mut self, key_store: &GuessQueryKeyStore, now: DateTime<UTC>) -> Vec<Dispatch> {
        if self.is_terminated() {
            return Vec::new();
        }

        // A dispatch from the previous tick was synchronously dropped by
        // the UDP queue; back off for exactly one iteration.
        if self.flags.contains(QueryFlags::UDP_DROP) {
            self.flags.remove(QueryFlags::UDP_DROP);
            self.flags.insert(QueryFlags::DELAYED);
        }
        if self.flags.contains(QueryFlags::DELAYED) {
            self.flags.remove(QueryFlags::DELAYED);
            return Vec::new();
        }

        self.hops += 1;
        self.flags.insert(QueryFlags::SENDING);

        let budget = match self.mode {
            QueryMode::Bounded => self.alpha.saturating_sub(self.rpc_pending as usize),
            QueryMode::Loose => self.alpha,
        };

        let mut dispatched = Vec::new();
        let mut skipped = VecDeque::new();
        let mut issued = 0usize;

        while issued < budget {
            let mut entry = match self.pool.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            match self.filter(&entry, now) {
                FilterVerdict::Drop => continue,
                FilterVerdict::Skip => {
                    skipped.push_back(entry);
                    continue;
                }
                FilterVerdict::Use => {}
            }

            match key_store.get(entry.addr.ip(), entry.addr.port()) {
                Some(key_entry) => {
                    let query = QueryMessage {
                        port: entry.addr.port(),
                        ip: match entry.addr.ip() {
                            std::net::IpAddr::V4(v4) => v4,
                            std::net::IpAddr::V6(_) => std::net::Ipv4Addr::UNSPECIFIED,
                        },
                        text: self.search_text.clone(),
                        extensions: vec![Extension::new(ggep::KEY_QK, key_entry.query_key.clone())],
                    };
                    let mut bytes = Vec::new();
                    query.write_bytes(&mut bytes).expect("write to Vec cannot fail");

                    dispatched.push(Dispatch::Query {
                        to: entry.addr,
                        muid: self.muid,
                        bytes,
                    });
                    issued += 1;
                    self.pool.push_back(entry);
                }
                None => {
                    entry.qk_pending_since = Some(now);
                    let ping = crate::ggep::PingMessage {
                        version: 1,
                        extensions: vec![Extension::new(ggep::KEY_QK, Vec::new())],
                    };
                    let mut bytes = Vec::new();
                    ping.write_bytes(&mut bytes).expect("write to Vec cannot fail");

                    dispatched.push(Dispatch::QueryKeyPing {
                        to: entry.addr,
                        muid: self.muid,
                        bytes,
                    });
                    self.pool.push_back(entry);
                    // a query-key request does not consume the slot
                }
            }
        }

        self.pool.extend(skipped);
        self.flags.remove(QueryFlags::SENDING);
        dispatched
    }

    /// Process an acknowledgement. `reply_hops` must equal the query's
    /// current `hops` or the reply is a stale duplicate and ignored.
    pub fn handle_ack(
        &mut self,
        from: SocketAddr,
        reply_hops: u32,
        key_store: &mut GuessQueryKeyStore,
        link_cache: &mut GuessLinkCache,
        fresh_key: Option<Vec<u8>>,
        ipp_hosts: &[SocketAddr],
        now: DateTime<UTC>,
    ) {
        link_cache.touch(from, now);

        for host in ipp_hosts {
            link_cache.offer(*host, now, crate::link_cache::DEFAULT_DISCOVERY_ACCEPT_PERCENT);
            self.offer_candidate(*host);
        }

        if let Some(key) = fresh_key {
            key_store.insert(from.ip(), from.port(), key, now);
            self.push_front(from);
        }

        if reply_hops != self.hops {
            return;
        }

        self.query_acks += 1;
        if self.query_acks >= self.warming_count {
            self.mode = QueryMode::Loose;
        }
    }

    fn push_front(&mut self, addr: SocketAddr) {
        self.pool.retain(|entry| entry.addr != addr);
        self.pool.push_front(PoolEntry::fresh(addr));
    }

    pub fn handle_timeout(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.pool.iter_mut().find(|entry| entry.addr == addr) {
            entry.timeouts += 1;
            entry.last_timeout = Some(UTC::now());
        }
    }

    /// Drop an endpoint flagged alien by the caller from this query's pool.
    pub fn purge(&mut self, addr: SocketAddr) {
        self.pool.retain(|entry| entry.addr != addr);
    }

    pub fn record_hit(&mut self) {
        self.kept_results += 1;
    }

    pub fn set_end_starving(&mut self) {
        self.flags.insert(QueryFlags::END_STARVING);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guess_util::test_support::dummy_socket_addr;

    fn muid() -> Muid {
        Muid::from_halves(7, 7)
    }

    #[test]
    fn positive_query_key_ping_issued_for_unknown_host() {
        let mut query = GuessQuery::new(muid(), "ubuntu".into(), MatchMode::Contains, 50, 1000);
        query.offer_candidate(dummy_socket_addr(1, 6346));

        let store = GuessQueryKeyStore::new();
        let dispatched = query.iterate(&store, UTC::now());

        assert_eq!(dispatched.len(), 1);
        assert!(matches!(dispatched[0], Dispatch::QueryKeyPing { .. }));
    }

    #[test]
    fn positive_query_dispatched_once_key_is_known() {
        let mut query = GuessQuery::new(muid(), "ubuntu".into(), MatchMode::Contains, 50, 1000);
        let addr = dummy_socket_addr(1, 6346);
        query.offer_candidate(addr);

        let mut store = GuessQueryKeyStore::new();
        store.insert(addr.ip(), addr.port(), vec![9, 9], UTC::now());

        let dispatched = query.iterate(&store, UTC::now());
        assert_eq!(dispatched.len(), 1);
        assert!(matches!(dispatched[0], Dispatch::Query { .. }));
    }

    #[test]
    fn positive_warming_count_promotes_to_loose_mode() {
        let mut query = GuessQuery::new(muid(), "ubuntu".into(), MatchMode::Contains, 1_000_000, 1000);
        let mut store = GuessQueryKeyStore::new();
        let mut links = GuessLinkCache::new();
        query.hops = 1;

        for i in 0..WARMING_COUNT {
            let addr = dummy_socket_addr((i % 250) as u8, 6346);
            query.handle_ack(addr, 1, &mut store, &mut links, None, &[], UTC::now());
        }

        assert_eq!(query.mode, QueryMode::Loose);
    }

    #[test]
    fn negative_stale_hops_reply_does_not_count_as_ack() {
        let mut query = GuessQuery::new(muid(), "ubuntu".into(), MatchMode::Contains, 50, 1000);
        let mut store = GuessQueryKeyStore::new();
        let mut links = GuessLinkCache::new();
        query.hops = 5;

        query.handle_ack(dummy_socket_addr(1, 6346), 4, &mut store, &mut links, None, &[], UTC::now());

        assert_eq!(query.query_acks, 0);
    }

    #[test]
    fn positive_terminates_when_result_cap_reached() {
        let mut query = GuessQuery::new(muid(), "ubuntu".into(), MatchMode::Contains, 1, 1000);
        query.record_hit();
        assert!(query.is_terminated());
    }

    #[test]
    fn positive_with_config_honours_lower_warming_count() {
        let config = crate::config::GuessConfigBuilder::new().warming_count(2).build();
        let mut query = GuessQuery::with_config(muid(), "ubuntu".into(), MatchMode::Contains, 1_000_000, 1000, &config);
        let mut store = GuessQueryKeyStore::new();
        let mut links = GuessLinkCache::new();
        query.hops = 1;

        for i in 0..2u8 {
            query.handle_ack(dummy_socket_addr(i, 6346), 1, &mut store, &mut links, None, &[], UTC::now());
        }

        assert_eq!(query.mode, QueryMode::Loose);
    }
}
