//! Outstanding RPC bookkeeping for the GUESS query engine.
//!
//! Keyed by `(muid, peer ip)`, deliberately dropping the port: a peer that
//! answers from a different ephemeral port than it was queried on is still
//! the same peer for GUESS purposes (see DESIGN NOTES, Open Question 1).
//! When a second registration targets an ip already pending under a
//! different port, the existing pending entry is left untouched and the
//! host is silently retained in the caller's pool for a later attempt --
//! this preserves the original behavior rather than surfacing it as an
//! error.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, UTC};

use guess_util::trans::Muid;

/// An RPC not acknowledged within this long is considered lost.
pub const RPC_LIFETIME_SECS: i64 = 15;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RpcKind {
    Ping,
    Query,
}

struct Pending {
    addr: SocketAddr,
    kind: RpcKind,
    sent_at: DateTime<UTC>,
}

#[derive(PartialEq, Debug)]
pub enum RegisterOutcome {
    Registered,
    BusyIpRetained,
}

/// RAII guard for one outstanding RPC's concurrency slot. Dropping it --
/// on success, timeout, or early abandonment alike -- releases the slot
/// so the query scheduler's alpha cap sees it free again.
pub struct SendTicket {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for SendTicket {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct GuessRpc {
    pending: HashMap<(Muid, IpAddr), Pending>,
    in_flight: Arc<AtomicUsize>,
    lifetime_secs: i64,
}

impl GuessRpc {
    pub fn new() -> GuessRpc {
        GuessRpc {
            pending: HashMap::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            lifetime_secs: RPC_LIFETIME_SECS,
        }
    }

    pub fn with_config(config: &crate::config::GuessConfig) -> GuessRpc {
        GuessRpc {
            pending: HashMap::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            lifetime_secs: config.rpc_lifetime_secs,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Register a new outstanding RPC and hand back its concurrency ticket.
    /// Returns `BusyIpRetained` (no ticket) rather than overwriting the
    /// existing pending entry when this ip already has one in flight.
    pub fn register(
        &mut self,
        muid: Muid,
        addr: SocketAddr,
        kind: RpcKind,
        now: DateTime<UTC>,
    ) -> (RegisterOutcome, Option<SendTicket>) {
        let key = (muid, addr.ip());
        if self.pending.contains_key(&key) {
            return (RegisterOutcome::BusyIpRetained, None);
        }

        self.pending.insert(
            key,
            Pending {
                addr,
                kind,
                sent_at: now,
            },
        );
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        (
            RegisterOutcome::Registered,
            Some(SendTicket {
                in_flight: self.in_flight.clone(),
            }),
        )
    }

    /// Acknowledge a reply, removing and returning the pending RPC it
    /// answers, if any is still outstanding.
    pub fn handle(&mut self, muid: Muid, from_ip: IpAddr) -> Option<(SocketAddr, RpcKind)> {
        self.pending
            .remove(&(muid, from_ip))
            .map(|pending| (pending.addr, pending.kind))
    }

    /// Sweep and remove RPCs that have outlived `RPC_LIFETIME_SECS`,
    /// returning the `(muid, addr)` of each for timeout handling upstream.
    pub fn sweep_timeouts(&mut self, now: DateTime<UTC>) -> Vec<(Muid, SocketAddr)> {
        let cutoff = now - Duration::seconds(self.lifetime_secs);
        let expired_keys: Vec<(Muid, IpAddr)> = self
            .pending
            .iter()
            .filter(|&(_, pending)| pending.sent_at <= cutoff)
            .map(|(key, _)| *key)
            .collect();

        let mut results = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(pending) = self.pending.remove(&key) {
                results.push((key.0, pending.addr));
            }
        }
        results
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for GuessRpc {
    fn default() -> GuessRpc {
        GuessRpc::new()
    }
}
