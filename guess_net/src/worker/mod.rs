pub mod handler;

/// Messages sent into the event loop from other threads via the `mio`
/// channel.
#[derive(Debug)]
pub enum GuessTask {
    Incoming(Vec<u8>, std::net::SocketAddr),
    StartQuery {
        muid: guess_util::trans::Muid,
        search_text: String,
        match_mode: crate::hit::MatchMode,
    },
    CancelQuery(guess_util::trans::Muid),
}

/// Periodic work driven by the event loop's own timeout callouts.
#[derive(Clone, Copy, Debug)]
pub enum ScheduledTask {
    IterateQueries,
    PruneQueryKeys,
    SyncQueryKeys,
    BandwidthTick,
    LinkCachePing,
    RpcTimeoutSweep,
}
