//! Query key issuance and expiry tracking.
//!
//! Mirrors bip_dht's `AnnounceStorage`: a `HashMap` of live entries plus a
//! separately maintained, time-sorted `Vec` of expirations that is pruned
//! with `take_while`/`drain` instead of scanning the whole map every tick.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, UTC};

/// A query key is valid for this long after being handed out.
pub const QK_LIFETIME_SECS: i64 = 3600;
/// Pruning sweeps run at a third of the lifetime, per EXTERNAL INTERFACES.
pub const QK_PRUNE_INTERVAL_SECS: i64 = QK_LIFETIME_SECS / 3;
/// Backing store is synced to disk at this cadence.
pub const QK_SYNC_INTERVAL_SECS: i64 = 60;
/// Below this still-alive probability an entry is pruned even if its TTL
/// has not yet expired. Shared with `GuessQuery::load_pool`'s fallback
/// predicate (`ALIVE_PROBABILITY_FLOOR`), which uses a higher bar since it
/// is picking hosts to contact rather than deciding whether to keep them at
/// all.
pub const STABLE_PROBABILITY_FLOOR: f64 = 0.333;
/// Consecutive timeouts beyond which a host is skipped everywhere until
/// `TIMEOUT_DECAY_SECS` elapses, regardless of its computed probability.
pub const MAX_TIMEOUTS: u32 = 5;
pub const TIMEOUT_DECAY_SECS: i64 = 3600;

bitflags! {
    pub struct KeyFlags: u8 {
        const STABLE     = 0b0000_0001;
        /// A keep-alive ping was sent to this host and its reply is still
        /// outstanding; cleared on the next success or timeout so
        /// `GuessLinkCache`'s periodic ping sweep doesn't pile up repeat
        /// pings to the same host.
        const PINGED     = 0b0000_0010;
        /// Reported or observed as hostile/unusable (e.g. a non-routable
        /// address introduced via `IPP`); pruned unconditionally.
        const OTHER_HOST = 0b0000_0100;
        /// The most recent pong from this host carried an `IPP` extension.
        const PONG_IPP   = 0b0000_1000;
    }
}

/// Still-alive probability shared by query-key pruning and pool-loading
/// (COMPONENT DESIGN §4.6): a base probability that decays with how long
/// it's been idle since `last_seen`, halving every `QK_LIFETIME_SECS` of
/// silence, further discounted by a `0.85^timeouts` decimation table for
/// recent consecutive timeouts. A host above `MAX_TIMEOUTS` consecutive
/// timeouts is treated as dead (probability `0.0`) until `TIMEOUT_DECAY_SECS`
/// has passed since its last timeout.
pub fn still_alive_probability(
    _first_seen: DateTime<UTC>,
    last_seen: DateTime<UTC>,
    timeouts: u32,
    last_timeout: Option<DateTime<UTC>>,
    now: DateTime<UTC>,
) -> f64 {
    if timeouts > MAX_TIMEOUTS {
        let decayed = last_timeout.map_or(false, |lt| (now - lt).num_seconds() >= TIMEOUT_DECAY_SECS);
        if !decayed {
            return 0.0;
        }
    }

    let idle_secs = (now - last_seen).num_seconds().max(0) as f64;
    let base = 0.5f64.powf(idle_secs / QK_LIFETIME_SECS as f64);
    base * 0.85f64.powi(timeouts as i32)
}

#[derive(Clone, Debug)]
pub struct QueryKeyEntry {
    pub query_key: Vec<u8>,
    pub first_seen: DateTime<UTC>,
    pub last_seen: DateTime<UTC>,
    pub last_update: DateTime<UTC>,
    pub last_timeout: Option<DateTime<UTC>>,
    pub flags: KeyFlags,
    pub timeouts: u32,
}

impl QueryKeyEntry {
    fn new(query_key: Vec<u8>, now: DateTime<UTC>) -> QueryKeyEntry {
        QueryKeyEntry {
            query_key,
            first_seen: now,
            last_seen: now,
            last_update: now,
            last_timeout: None,
            flags: KeyFlags::empty(),
            timeouts: 0,
        }
    }

    /// Fraction of recent exchanges that succeeded, used by the query
    /// scheduler to decide whether a host is worth keeping around.
    pub fn is_stable(&self) -> bool {
        self.flags.contains(KeyFlags::STABLE)
    }
}

struct Expiration {
    addr: IpAddr,
    port: u16,
    expires_at: DateTime<UTC>,
}

/// Holds query keys this node has been issued by remote ultrapeers, keyed
/// by `(ip, port)` so a host rotating ports still gets a fresh key.
pub struct GuessQueryKeyStore {
    entries: HashMap<(IpAddr, u16), QueryKeyEntry>,
    expirations: Vec<Expiration>,
    lifetime_secs: i64,
}

impl GuessQueryKeyStore {
    pub fn new() -> GuessQueryKeyStore {
        GuessQueryKeyStore {
            entries: HashMap::new(),
            expirations: Vec::new(),
            lifetime_secs: QK_LIFETIME_SECS,
        }
    }

    pub fn with_config(config: &crate::config::GuessConfig) -> GuessQueryKeyStore {
        GuessQueryKeyStore {
            entries: HashMap::new(),
            expirations: Vec::new(),
            lifetime_secs: config.qk_lifetime_secs,
        }
    }

    pub fn get(&self, addr: IpAddr, port: u16) -> Option<&QueryKeyEntry> {
        self.entries.get(&(addr, port))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a freshly issued query key, replacing any prior entry for
    /// this host.
    pub fn insert(&mut self, addr: IpAddr, port: u16, query_key: Vec<u8>, now: DateTime<UTC>) {
        self.entries
            .insert((addr, port), QueryKeyEntry::new(query_key, now));
        self.expirations.push(Expiration {
            addr,
            port,
            expires_at: now + Duration::seconds(self.lifetime_secs),
        });
        self.expirations.sort_by_key(|exp| exp.expires_at);
    }

    /// Mark a key as having produced a successful exchange. Three
    /// consecutive successes without an intervening timeout promote the
    /// entry to `STABLE`.
    pub fn record_success(&mut self, addr: IpAddr, port: u16, now: DateTime<UTC>) {
        if let Some(entry) = self.entries.get_mut(&(addr, port)) {
            entry.last_seen = now;
            entry.last_update = now;
            entry.flags.remove(KeyFlags::PINGED);
            if entry.timeouts == 0 {
                entry.flags.insert(KeyFlags::STABLE);
            }
        }
    }

    pub fn record_timeout(&mut self, addr: IpAddr, port: u16, now: DateTime<UTC>) {
        if let Some(entry) = self.entries.get_mut(&(addr, port)) {
            entry.last_timeout = Some(now);
            entry.timeouts += 1;
            entry.flags.remove(KeyFlags::STABLE);
            entry.flags.remove(KeyFlags::PINGED);
        }
    }

    /// Mark a keep-alive ping as outstanding against this host, if known.
    pub fn mark_pinged(&mut self, addr: IpAddr, port: u16) {
        if let Some(entry) = self.entries.get_mut(&(addr, port)) {
            entry.flags.insert(KeyFlags::PINGED);
        }
    }

    pub fn has_ping_outstanding(&self, addr: IpAddr, port: u16) -> bool {
        self.entries
            .get(&(addr, port))
            .map_or(false, |entry| entry.flags.contains(KeyFlags::PINGED))
    }

    /// Flag a host as hostile/unusable; `prune` removes it unconditionally.
    pub fn mark_hostile(&mut self, addr: IpAddr, port: u16) {
        if let Some(entry) = self.entries.get_mut(&(addr, port)) {
            entry.flags.insert(KeyFlags::OTHER_HOST);
        }
    }

    /// Record that the most recent pong from this host carried an `IPP`
    /// extension.
    pub fn note_ipp(&mut self, addr: IpAddr, port: u16) {
        if let Some(entry) = self.entries.get_mut(&(addr, port)) {
            entry.flags.insert(KeyFlags::PONG_IPP);
        }
    }

    /// Full iteration over live entries, for pruning and pool-loading
    /// fallback.
    pub fn iter(&self) -> impl Iterator<Item = (&(IpAddr, u16), &QueryKeyEntry)> {
        self.entries.iter()
    }

    /// Drop every entry that is hostile, has expired at or before `now`, or
    /// whose `still_alive_probability` has decayed below
    /// `STABLE_PROBABILITY_FLOOR`. Returns the number of entries removed.
    pub fn prune(&mut self, now: DateTime<UTC>) -> usize {
        let mut removed = 0;

        let hostile: Vec<(IpAddr, u16)> = self
            .entries
            .iter()
            .filter(|&(_, entry)| entry.flags.contains(KeyFlags::OTHER_HOST))
            .map(|(&key, _)| key)
            .collect();
        for key in hostile {
            self.entries.remove(&key);
            self.expirations.retain(|exp| (exp.addr, exp.port) != key);
            removed += 1;
        }

        let cutoff = self
            .expirations
            .iter()
            .take_while(|exp| exp.expires_at <= now)
            .count();

        let expired: Vec<Expiration> = self.expirations.drain(0..cutoff).collect();

        for exp in expired {
            if let Some(entry) = self.entries.get(&(exp.addr, exp.port)) {
                // A later re-issue can outlive this expiration record; only
                // remove if this expiration is still the current one.
                let current_expiry = entry.first_seen + Duration::seconds(self.lifetime_secs);
                if current_expiry <= now {
                    self.entries.remove(&(exp.addr, exp.port));
                    removed += 1;
                }
            }
        }

        let decayed: Vec<(IpAddr, u16)> = self
            .entries
            .iter()
            .filter(|&(_, entry)| {
                still_alive_probability(entry.first_seen, entry.last_seen, entry.timeouts, entry.last_timeout, now)
                    < STABLE_PROBABILITY_FLOOR
            })
            .map(|(&key, _)| key)
            .collect();
        for key in decayed {
            if self.entries.remove(&key).is_some() {
                self.expirations.retain(|exp| (exp.addr, exp.port) != key);
                removed += 1;
            }
        }

        removed
    }
}

impl Default for GuessQueryKeyStore {
    fn default() -> GuessQueryKeyStore {
        GuessQueryKeyStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{GuessQueryKeyStore, QK_LIFETIME_SECS};
    use chrono::{Duration, UTC};
    use guess_util::test_support::travel_into_future;
    use std::net::IpAddr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn positive_insert_then_get_round_trips() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1, 2, 3, 4], now);

        let entry = store.get(ip(1), 6346).unwrap();
        assert_eq!(entry.query_key, vec![1, 2, 3, 4]);
        assert!(!entry.is_stable());
    }

    #[test]
    fn positive_three_successes_without_timeout_goes_stable() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);
        store.record_success(ip(1), 6346, now);

        assert!(store.get(ip(1), 6346).unwrap().is_stable());
    }

    #[test]
    fn positive_timeout_clears_stable_flag() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);
        store.record_success(ip(1), 6346, now);
        store.record_timeout(ip(1), 6346, now);

        assert!(!store.get(ip(1), 6346).unwrap().is_stable());
    }

    #[test]
    fn positive_prune_removes_expired_entries_only() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);
        store.insert(ip(2), 6346, vec![2], now);

        let future = travel_into_future(Duration::seconds(QK_LIFETIME_SECS + 1));
        let removed = store.prune(future);

        assert_eq!(removed, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn negative_prune_before_expiry_removes_nothing() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);

        let removed = store.prune(now);
        assert_eq!(removed, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn positive_with_config_honours_shorter_lifetime() {
        let config = crate::config::GuessConfigBuilder::new().qk_lifetime_secs(10).build();
        let mut store = GuessQueryKeyStore::with_config(&config);
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);

        let future = travel_into_future(Duration::seconds(11));
        assert_eq!(store.prune(future), 1);
    }

    #[test]
    fn positive_hostile_entry_is_pruned_unconditionally() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);
        store.mark_hostile(ip(1), 6346);

        assert_eq!(store.prune(now), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn positive_ping_flag_clears_on_success_and_timeout() {
        let mut store = GuessQueryKeyStore::new();
        let now = UTC::now();
        store.insert(ip(1), 6346, vec![1], now);
        store.mark_pinged(ip(1), 6346);
        assert!(store.has_ping_outstanding(ip(1), 6346));

        store.record_success(ip(1), 6346, now);
        assert!(!store.has_ping_outstanding(ip(1), 6346));

        store.mark_pinged(ip(1), 6346);
        store.record_timeout(ip(1), 6346, now);
        assert!(!store.has_ping_outstanding(ip(1), 6346));
    }

    #[test]
    fn positive_still_alive_probability_is_full_with_no_idle_or_timeouts() {
        let now = UTC::now();
        assert_eq!(super::still_alive_probability(now, now, 0, None, now), 1.0);
    }

    #[test]
    fn negative_still_alive_probability_is_zero_past_max_timeouts_until_decay() {
        let now = UTC::now();
        let probability = super::still_alive_probability(now, now, super::MAX_TIMEOUTS + 1, Some(now), now);
        assert_eq!(probability, 0.0);

        let decayed_now = travel_into_future(Duration::seconds(super::TIMEOUT_DECAY_SECS + 1));
        let recovered = super::still_alive_probability(now, now, super::MAX_TIMEOUTS + 1, Some(now), decayed_now);
        assert!(recovered > 0.0);
    }
}
