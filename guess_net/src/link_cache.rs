//! Bounded, most-recently-used set of ultrapeers this node has exchanged
//! GUESS pings with. Grounded on bip_disk's `FileHandleCache`: an
//! `lru_cache::LruCache` does the MRU bookkeeping, no manual eviction
//! logic needed. Unlike `FileHandleCache` this is never touched from a
//! worker thread, so no `Mutex` wrapper is needed here.

use std::net::SocketAddr;

use chrono::{DateTime, UTC};
use lru_cache::LruCache;
use rand::Rng;

/// Upper bound on tracked hosts, per EXTERNAL INTERFACES.
pub const MAX_CACHE_ENTRIES: usize = 75;
/// Alive pings go out at this cadence per host.
pub const ALIVE_PING_INTERVAL_SECS: i64 = 300;
/// Default acceptance odds for a passively-discovered (IPP-introduced) host
/// that isn't already cached; the caller may supply a different `p%` to
/// `offer`. See COMPONENT DESIGN §4.5.
pub const DEFAULT_DISCOVERY_ACCEPT_PERCENT: u8 = 50;
/// Fraction of keep-alive pings that also advertise our ultrapeer status via
/// the introduction payload.
pub const INTRODUCTION_PING_PERCENT: u8 = 25;

#[derive(Clone, Debug)]
pub struct LinkEntry {
    pub last_contact: DateTime<UTC>,
    pub alien: bool,
}

pub struct GuessLinkCache {
    hosts: LruCache<SocketAddr, LinkEntry>,
}

impl GuessLinkCache {
    pub fn new() -> GuessLinkCache {
        GuessLinkCache::with_capacity(MAX_CACHE_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> GuessLinkCache {
        GuessLinkCache {
            hosts: LruCache::new(capacity),
        }
    }

    pub fn with_config(config: &crate::config::GuessConfig) -> GuessLinkCache {
        GuessLinkCache::with_capacity(config.link_cache_size)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.len() == 0
    }

    /// Record a successful exchange, promoting `addr` to most-recently-used.
    /// Used for directly-observed traffic (a reply or ping we received
    /// straight from `addr`), which is always accepted.
    pub fn touch(&mut self, addr: SocketAddr, now: DateTime<UTC>) {
        if let Some(entry) = self.hosts.get_mut(&addr) {
            entry.last_contact = now;
            entry.alien = false;
        } else {
            self.hosts.insert(
                addr,
                LinkEntry {
                    last_contact: now,
                    alien: false,
                },
            );
        }
    }

    /// Offer a passively-learned host (one introduced via another peer's
    /// `IPP` extension rather than contacted directly). An address already
    /// in the cache is always refreshed like `touch`; a brand new one is
    /// accepted only `probability_percent` of the time, per COMPONENT
    /// DESIGN §4.5, so a single chatty introducer can't flood the cache.
    pub fn offer(&mut self, addr: SocketAddr, now: DateTime<UTC>, probability_percent: u8) {
        if self.hosts.contains_key(&addr) {
            self.touch(addr, now);
            return;
        }

        if rand::thread_rng().gen_range(0, 100) < probability_percent {
            self.touch(addr, now);
        }
    }

    /// Flag a host as responding with traffic inconsistent with the GUESS
    /// protocol (a malformed or unsolicited reply). Alien hosts stay in the
    /// cache -- evicting them would let a flooding peer force a cheap
    /// re-introduction -- but the query scheduler skips them as pool seeds.
    pub fn mark_alien(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.hosts.get_mut(&addr) {
            entry.alien = true;
        }
    }

    pub fn is_alien(&mut self, addr: SocketAddr) -> bool {
        self.hosts.get_mut(&addr).map_or(false, |entry| entry.alien)
    }

    /// Hosts due for a keep-alive ping: anything not contacted within
    /// `ALIVE_PING_INTERVAL_SECS`.
    pub fn due_for_ping(&mut self, now: DateTime<UTC>) -> Vec<SocketAddr> {
        self.hosts
            .iter()
            .filter(|&(_, entry)| {
                (now - entry.last_contact).num_seconds() >= ALIVE_PING_INTERVAL_SECS
            })
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Seed addresses for a fresh query, most-recently-used first,
    /// excluding known aliens.
    pub fn seed_pool(&mut self, limit: usize) -> Vec<SocketAddr> {
        self.hosts
            .iter()
            .filter(|&(_, entry)| !entry.alien)
            .take(limit)
            .map(|(addr, _)| *addr)
            .collect()
    }
}

impl Default for GuessLinkCache {
    fn default() -> GuessLinkCache {
        GuessLinkCache::new()
    }
}
