//! Download coordination core: chunk maps, on-disk trailers, per-file
//! source accounting, and the shared index of completed/partial files.

#[macro_use]
extern crate bitflags;
extern crate chrono;
extern crate crc;
#[macro_use]
extern crate error_chain;
extern crate futures;
extern crate futures_cpupool;
extern crate guess_util;
#[macro_use]
extern crate log;

/// Interval set over a file's byte range with per-interval status.
pub mod chunk;

/// Tunable knobs for the swarm, exposed via a builder.
pub mod config;

/// Offloads trailer I/O bursts onto a worker pool.
pub mod disk;

/// `ChunkError`/`TrailerError` boundary error types.
pub mod error;

/// Per-file coordination object.
pub mod file_info;

/// Completed/partial file index, keyed by SHA-1.
pub mod shared_index;

/// Download attempts against a single `FileInfo`.
pub mod source;

/// On-disk trailer format.
pub mod trailer;

pub use chunk::{ChunkMap, Status};
pub use config::{SwarmConfig, SwarmConfigBuilder};
pub use file_info::{FileFlags, FileInfo};
pub use shared_index::SharedIndex;
pub use source::{Source, SourceSet, SourceState};
pub use trailer::Trailer;
