#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate chrono;
#[macro_use]
extern crate error_chain;
extern crate lru_cache;
extern crate mio;
#[macro_use]
extern crate nom;
#[macro_use]
extern crate log;
extern crate rand;

extern crate guess_util;

pub mod bandwidth;
pub mod config;
pub mod error;
pub mod ggep;
pub mod hit;
pub mod link_cache;
pub mod net;
pub mod query;
pub mod query_key;
pub mod rpc;
pub mod worker;

pub use bandwidth::BandwidthGate;
pub use config::{GuessConfig, GuessConfigBuilder};
pub use hit::{HitMatcher, MatchMode};
pub use link_cache::GuessLinkCache;
pub use net::Net;
pub use query::GuessQuery;
pub use query_key::GuessQueryKeyStore;
pub use rpc::{GuessRpc, SendTicket};
