extern crate chrono;
extern crate guess_net;
extern crate guess_util;

use chrono::UTC;

use guess_net::bandwidth::BandwidthGate;
use guess_net::ggep;
use guess_net::link_cache::GuessLinkCache;
use guess_net::query::{Dispatch, GuessQuery};
use guess_net::query_key::GuessQueryKeyStore;
use guess_net::rpc::{GuessRpc, RegisterOutcome, RpcKind};
use guess_net::{HitMatcher, MatchMode};
use guess_util::test_support::dummy_socket_addr;
use guess_util::trans::Muid;

fn muid(tag: u64) -> Muid {
    Muid::from_halves(tag, tag)
}

/// A query seeded with a single endpoint, which never answers, eventually
/// reports no pool left once `EndStarving` is set and no reload is
/// pending -- the "nobody home" scenario.
#[test]
fn seed_query_no_responses_terminates_after_end_starving() {
    let mut query = GuessQuery::new(muid(1), "lonely search".into(), MatchMode::Contains, 50, 1000);
    assert!(!query.is_terminated());

    query.set_end_starving();
    // Pool is empty (nothing was ever offered), so starving + empty pool
    // terminates the query even though zero acks were ever received.
    assert!(query.is_terminated());
}

/// A single cooperative ultrapeer: we ping for a key, it replies with one,
/// we then issue the real query and the ack is credited.
#[test]
fn single_cooperative_ultrapeer_completes_key_then_query_handshake() {
    let addr = dummy_socket_addr(1, 6346);
    let mut query = GuessQuery::new(muid(2), "ubuntu".into(), MatchMode::Contains, 50, 1000);
    query.offer_candidate(addr);

    let mut store = GuessQueryKeyStore::new();
    let mut links = GuessLinkCache::new();
    let now = UTC::now();

    // First iteration: no key cached yet, scheduler must ask for one.
    let first = query.iterate(&store, now);
    assert_eq!(first.len(), 1);
    assert!(matches!(first[0], Dispatch::QueryKeyPing { .. }));

    // Ultrapeer cooperates: pong carries a fresh key.
    query.handle_ack(addr, query.hops, &mut store, &mut links, Some(vec![1, 2, 3]), &[], now);
    assert!(store.get(addr.ip(), addr.port()).is_some());

    // Next iteration: key is now cached, the real query goes out.
    let second = query.iterate(&store, now);
    assert_eq!(second.len(), 1);
    assert!(matches!(second[0], Dispatch::Query { .. }));
}

/// A peer that answers a query-key ping with extensions carrying neither a
/// key nor a host list is an alien; it must be dropped from the query's
/// pool and marked in the link cache.
#[test]
fn alien_peer_is_purged_from_pool() {
    let addr = dummy_socket_addr(2, 6346);
    let mut query = GuessQuery::new(muid(3), "ubuntu".into(), MatchMode::Contains, 50, 1000);
    query.offer_candidate(addr);
    assert_eq!(query.pool_len(), 1);

    let mut links = GuessLinkCache::new();
    links.mark_alien(addr);
    query.purge(addr);

    assert_eq!(query.pool_len(), 0);
    assert!(links.is_alien(addr));
}

/// A query key store entry that has expired must not be handed to the
/// scheduler; the endpoint instead gets a fresh key request.
#[test]
fn expired_query_key_triggers_reissue_via_ping() {
    let addr = dummy_socket_addr(3, 6346);
    let mut query = GuessQuery::new(muid(4), "ubuntu".into(), MatchMode::Contains, 50, 1000);
    query.offer_candidate(addr);

    let mut store = GuessQueryKeyStore::new();
    let past = guess_util::test_support::travel_into_past(chrono::Duration::seconds(
        guess_net::query_key::QK_LIFETIME_SECS + 10,
    ));
    store.insert(addr.ip(), addr.port(), vec![9, 9], past);

    let removed = store.prune(UTC::now());
    assert_eq!(removed, 1);

    let dispatched = query.iterate(&store, UTC::now());
    assert!(matches!(dispatched[0], Dispatch::QueryKeyPing { .. }));
}

/// After `warming_count` acknowledgements at the query's current hop
/// count, the mode promotes from `Bounded` to `Loose`.
#[test]
fn loose_mode_promotion_after_warming_count() {
    let mut query = GuessQuery::new(muid(5), "ubuntu".into(), MatchMode::Contains, 1_000_000, 1000);
    let mut store = GuessQueryKeyStore::new();
    let mut links = GuessLinkCache::new();
    query.hops = 1;

    for i in 0..guess_net::query::WARMING_COUNT {
        let addr = dummy_socket_addr((i % 250) as u8, 6346);
        query.handle_ack(addr, 1, &mut store, &mut links, None, &[], UTC::now());
    }

    assert_eq!(query.mode, guess_net::query::QueryMode::Loose);
}

/// Enqueued sends beyond the per-second budget wait for the next tick
/// instead of going out immediately.
#[test]
fn bandwidth_throttling_defers_oversized_burst() {
    let now = UTC::now();
    let mut gate: BandwidthGate<ggep::Extension> = BandwidthGate::new(1000, now);

    assert!(gate.try_reserve(900, now));
    assert!(!gate.try_reserve(900, now));

    gate.enqueue(900, ggep::Extension::new(ggep::KEY_QK, vec![1]));
    let later = guess_util::test_support::travel_into_future(chrono::Duration::seconds(1));
    let released = gate.drain_ready(later);

    assert_eq!(released.len(), 1);
}

/// `GuessRpc` retains a busy ip silently (no error surfaced) rather than
/// rejecting the second registration outright.
#[test]
fn busy_ip_is_retained_not_errored() {
    let mut rpc = GuessRpc::new();
    let now = UTC::now();
    let a = dummy_socket_addr(9, 6346);
    let b = dummy_socket_addr(9, 6347);

    let (first, _ticket) = rpc.register(muid(6), a, RpcKind::Query, now);
    assert_eq!(first, RegisterOutcome::Registered);

    let (second, ticket) = rpc.register(muid(6), b, RpcKind::Query, now);
    assert_eq!(second, RegisterOutcome::BusyIpRetained);
    assert!(ticket.is_none());
}

/// The reintroduced suffix matcher shares behavior with `Contains` but
/// only matches at the end of the filename.
#[test]
fn suffix_matcher_reintroduction_matches_trailing_text_only() {
    let matcher = HitMatcher::new(MatchMode::Suffix, ".iso");
    assert!(matcher.matches("debian-12-amd64-netinst.iso"));
    assert!(!matcher.matches("debian-12-amd64-netinst.iso.asc"));
}
