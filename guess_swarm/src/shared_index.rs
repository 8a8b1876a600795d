use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use guess_util::sha::ShaHash;

use crate::chunk::OwnerId;
use crate::file_info::{FileFlags, FileInfo};
use crate::source::SourceState;

/// Completed and partial files exposed for upload, indexed by SHA-1.
///
/// This is the hook by which an inbound query hit is absorbed into an
/// ongoing swarm: `try_to_swarm_with` either hands back an existing
/// `FileInfo` to add a source to, or creates a new one for the caller.
pub struct SharedIndex {
    by_sha1: HashMap<ShaHash, FileInfo>,
}

impl SharedIndex {
    pub fn new() -> SharedIndex {
        SharedIndex {
            by_sha1: HashMap::new(),
        }
    }

    /// Look up a completed or partial file by SHA-1.
    pub fn shared_sha1(&self, sha1: &ShaHash) -> Option<&FileInfo> {
        self.by_sha1.get(sha1)
    }

    pub fn shared_sha1_mut(&mut self, sha1: &ShaHash) -> Option<&mut FileInfo> {
        self.by_sha1.get_mut(sha1)
    }

    pub fn insert(&mut self, info: FileInfo) {
        if let Some(sha1) = info.sha1 {
            info!("guess_swarm: Indexing FileInfo under SHA-1 {:?}", sha1);
            self.by_sha1.insert(sha1, info);
        }
    }

    pub fn remove(&mut self, sha1: &ShaHash) -> Option<FileInfo> {
        self.by_sha1.remove(sha1)
    }

    pub fn len(&self) -> usize {
        self.by_sha1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sha1.is_empty()
    }

    /// Absorb a query hit: if a `FileInfo` for `sha1` already exists, add a
    /// new source at `addr` to it; otherwise create a brand new (transient,
    /// path-less) `FileInfo` under `name` via `FileInfo::get` and swarm on
    /// it, per COMPONENT DESIGN §4.3. A complete file needs no new source
    /// and reports a miss rather than gaining an extra uploader entry.
    pub fn try_to_swarm_with(&mut self, sha1: &ShaHash, name: &str, addr: SocketAddr, next_id: OwnerId) -> bool {
        let existing = self.by_sha1.remove(sha1);
        let was_complete = existing.as_ref().map_or(false, FileInfo::is_complete);
        if was_complete {
            self.by_sha1.insert(*sha1, existing.unwrap());
            return false;
        }

        let is_new = existing.is_none();
        let mut info = FileInfo::get(existing, name.to_string(), PathBuf::new(), None, Some(*sha1), false);
        if is_new {
            info.flags.insert(FileFlags::TRANSIENT);
        }
        info.add_new_source(next_id, addr, SourceState::AQueued);
        self.insert(info);
        true
    }

    /// Directory-scan hook: for each file with a trailer whose `ChunkMap` is
    /// fully `Done`, mark it complete in the index. Takes already-loaded
    /// `FileInfo`s (loading from disk is the caller's responsibility, via
    /// `Trailer::read_from` plus `FileInfo::from_trailer`).
    pub fn spot_completed_orphans(&mut self, candidates: Vec<FileInfo>) {
        for info in candidates {
            if info.is_complete() {
                self.insert(info);
            }
        }
    }
}

impl Default for SharedIndex {
    fn default() -> SharedIndex {
        SharedIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::SharedIndex;
    use crate::file_info::FileInfo;
    use guess_util::test_support::{dummy_sha1, dummy_socket_addr};
    use std::path::PathBuf;

    #[test]
    fn positive_swarm_with_existing_file_adds_source() {
        let mut index = SharedIndex::new();
        let sha1 = dummy_sha1("movie.mkv");
        index.insert(FileInfo::new(
            "movie.mkv".into(),
            PathBuf::from("/tmp"),
            Some(100),
            Some(sha1),
        ));

        let added = index.try_to_swarm_with(&sha1, "movie.mkv", dummy_socket_addr(5, 6346), 42);

        assert!(added);
        assert_eq!(index.shared_sha1(&sha1).unwrap().refcount(), 1);
    }

    #[test]
    fn positive_swarm_with_unknown_sha1_creates_transient_file_info() {
        let mut index = SharedIndex::new();
        let sha1 = dummy_sha1("unknown.mkv");

        let created = index.try_to_swarm_with(&sha1, "unknown.mkv", dummy_socket_addr(5, 6346), 1);

        assert!(created);
        let info = index.shared_sha1(&sha1).unwrap();
        assert!(info.flags.contains(crate::file_info::FileFlags::TRANSIENT));
        assert_eq!(info.refcount(), 1);
    }

    #[test]
    fn negative_swarm_with_complete_file_does_not_add_source() {
        let mut index = SharedIndex::new();
        let sha1 = dummy_sha1("movie.mkv");
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), Some(sha1));
        info.update(1, 0, 100, crate::chunk::Status::Done);
        index.insert(info);

        assert!(!index.try_to_swarm_with(&sha1, "movie.mkv", dummy_socket_addr(5, 6346), 2));
    }
}
