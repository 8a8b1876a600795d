use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, UTC};
use guess_util::sha::ShaHash;

use crate::chunk::{ChunkMap, OwnerId, Status};
use crate::source::{Source, SourceSet, SourceState};
use crate::trailer::Trailer;

bitflags! {
    /// Flags carried on a `FileInfo`; see DATA MODEL.
    pub struct FileFlags: u8 {
        /// No new download attempts should be started.
        const SUSPENDED = 0b0001;
        /// Remove this `FileInfo` once its refcount reaches zero.
        const DISCARD   = 0b0010;
        /// Not persisted to a trailer (e.g. a size-unknown placeholder).
        const TRANSIENT = 0b0100;
        /// Traversal scratch bit, used by directory/index scans.
        const MARK      = 0b1000;
    }
}

/// Per-file coordination object: owns the `ChunkMap`, persisted trailer
/// fields, and the set of sources attempting to complete the file.
#[derive(Clone)]
pub struct FileInfo {
    pub file_name: String,
    pub path: PathBuf,
    pub sha1: Option<ShaHash>,
    pub aliases: Vec<String>,
    pub chunks: ChunkMap,
    pub sources: SourceSet,
    pub first_seen: DateTime<UTC>,
    pub last_seen: DateTime<UTC>,
    pub lifecount: u64,
    pub flags: FileFlags,
    pub dirty: bool,
    /// Bytes of progress accumulated since the last trailer flush; gates
    /// `update`'s flush heuristic so a write doesn't fire per chunk.
    pub bytes_since_flush: u64,
}

impl FileInfo {
    /// Create a brand new, empty-progress `FileInfo`. Restoring one from an
    /// existing trailer is `from_trailer`; deduplicating against an already
    /// loaded `FileInfo` with the same `sha1` is the caller's responsibility
    /// (via `SharedIndex`), per DATA MODEL's uniqueness invariant.
    pub fn new(file_name: String, path: PathBuf, size: Option<u64>, sha1: Option<ShaHash>) -> FileInfo {
        let now = UTC::now();
        FileInfo {
            file_name,
            path,
            sha1,
            aliases: Vec::new(),
            chunks: match size {
                Some(size) => ChunkMap::new(size),
                None => ChunkMap::new_size_unknown(),
            },
            sources: SourceSet::new(),
            first_seen: now,
            last_seen: now,
            lifecount: 0,
            flags: FileFlags::empty(),
            dirty: false,
            bytes_since_flush: 0,
        }
    }

    /// Rebuild a `FileInfo` from a trailer read off disk by `Trailer::read_from`.
    pub fn from_trailer(file_name: String, path: PathBuf, trailer: Trailer) -> FileInfo {
        FileInfo {
            file_name,
            path,
            sha1: trailer.sha1,
            aliases: trailer.aliases,
            chunks: trailer.chunks,
            sources: SourceSet::new(),
            first_seen: trailer.first_seen,
            last_seen: trailer.last_seen,
            lifecount: 0,
            flags: FileFlags::empty(),
            dirty: false,
            bytes_since_flush: 0,
        }
    }

    /// Coordinate a freshly-seen file against a possible already-indexed
    /// `FileInfo` and an on-disk trailer, in that priority order, per DATA
    /// MODEL's uniqueness invariant: `sha1`-index hit first (the caller is
    /// responsible for the index lookup and passes the result as
    /// `existing`), then a trailer at `path/name`, then a brand new file.
    pub fn get(
        existing: Option<FileInfo>,
        file_name: String,
        path: PathBuf,
        size: Option<u64>,
        sha1: Option<ShaHash>,
        size_known: bool,
    ) -> FileInfo {
        if let Some(mut info) = existing {
            info.add_alias(file_name);
            return info;
        }

        let full_path = path.join(&file_name);
        if let Ok((trailer, _)) = Trailer::read_from(&full_path) {
            let mut info = FileInfo::from_trailer(file_name, path, trailer);
            if let Some(sha1) = sha1 {
                info.got_sha1(sha1);
            }
            if size_known {
                if let Some(size) = size {
                    let _ = info.size_known(size);
                }
            }
            return info;
        }

        FileInfo::new(file_name, path, if size_known { size } else { None }, sha1)
    }

    pub fn full_path(&self) -> PathBuf {
        self.path.join(&self.file_name)
    }

    pub fn alive_count(&self) -> usize {
        let (aqueued, pqueued, recv) = self.sources.counts();
        aqueued + pqueued + recv
    }

    pub fn refcount(&self) -> usize {
        self.sources.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.is_complete()
    }

    pub fn add_alias(&mut self, name: String) {
        if !self.aliases.contains(&name) {
            self.aliases.push(name);
            self.dirty = true;
        }
    }

    pub fn add_source(&mut self, id: OwnerId, source: Source) {
        self.sources.add(source);
        self.lifecount += 1;
        let _ = id;
    }

    /// Convenience wrapper over `add_source` that builds the `Source` from
    /// its parts, for callers (like `SharedIndex::try_to_swarm_with`) that
    /// don't already have one assembled.
    pub fn add_new_source(&mut self, id: OwnerId, addr: SocketAddr, state: SourceState) {
        self.add_source(id, Source::new(id, addr, state));
    }

    /// Release all chunk reservations held by `id`. When `decrement_lifecount`
    /// is set, also decrement `lifecount` -- used when the source is leaving
    /// for good rather than just being reassigned a new hole.
    pub fn clear_download(&mut self, id: OwnerId, decrement_lifecount: bool) {
        self.chunks.clear_owner(id);
        if decrement_lifecount {
            self.lifecount = self.lifecount.saturating_sub(1);
        }
    }

    /// Remove a source. If `discard_if_empty` is set and no sources remain,
    /// mark the `FileInfo` for destruction (the caller is responsible for
    /// actually dropping it once `should_destroy` returns true).
    pub fn remove_source(&mut self, id: OwnerId, discard_if_empty: bool) {
        self.clear_download(id, true);
        self.sources.remove(id);

        if discard_if_empty && self.sources.is_empty() {
            self.flags.insert(FileFlags::DISCARD);
        }
    }

    pub fn should_destroy(&self) -> bool {
        self.refcount() == 0 && self.flags.contains(FileFlags::DISCARD)
    }

    /// Set the SHA-1 once, if unset. Returns `false` if a different SHA-1
    /// was already recorded (the caller must not overwrite it; SHA-1 is
    /// immutable once set, per DATA MODEL).
    pub fn got_sha1(&mut self, sha1: ShaHash) -> bool {
        match self.sha1 {
            Some(existing) => existing == sha1,
            None => {
                self.sha1 = Some(sha1);
                self.dirty = true;
                true
            }
        }
    }

    /// Lock the size of a size-unknown file, truncating the `ChunkMap`.
    /// Returns the set of sources whose in-flight reservation was clipped;
    /// the caller must fail those sources (their current range now extends
    /// past `size`).
    pub fn size_known(&mut self, size: u64) -> crate::error::ChunkResult<Vec<OwnerId>> {
        let clipped = self.chunks.lock_size(size)?;
        self.dirty = true;
        Ok(clipped)
    }

    pub fn update(&mut self, owner: OwnerId, from: u64, to: u64, status: Status) {
        self.chunks.update(owner, from, to, status);
        self.last_seen = UTC::now();
        self.bytes_since_flush = self.bytes_since_flush.saturating_add(to.saturating_sub(from));
        self.dirty = true;
    }

    /// Whether accumulated progress has crossed `threshold_bytes` since the
    /// last flush, the dirty-page heuristic gating `store_binary` calls.
    pub fn flush_due(&self, threshold_bytes: u64) -> bool {
        self.dirty && self.bytes_since_flush >= threshold_bytes
    }

    /// Reset after an integrity failure: clear progress, keep sources (they
    /// will be handed fresh holes on their next turn).
    pub fn recreate(&mut self) {
        self.chunks.reset();
        self.dirty = true;
    }

    /// Serialize the current `Done` intervals for upload advertisement.
    pub fn available_ranges(&self) -> Vec<(u64, u64)> {
        self.chunks.done_ranges()
    }

    /// Clamp a requested upload range to the intersection with `Done`
    /// intervals, returning `None` if nothing in the request is available.
    pub fn restrict_range(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        self.chunks
            .done_ranges()
            .into_iter()
            .filter_map(|(from, to)| {
                let clamped_from = from.max(start);
                let clamped_to = to.min(end);
                if clamped_from < clamped_to {
                    Some((clamped_from, clamped_to))
                } else {
                    None
                }
            })
            .max_by_key(|&(from, to)| to - from)
    }

    pub fn to_trailer(&self) -> Trailer {
        Trailer {
            size: self.chunks.size().unwrap_or(0),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            aliases: self.aliases.clone(),
            chunks: self.chunks.clone(),
            sha1: self.sha1,
        }
    }

    /// Write the current trailer state synchronously; callers on the event
    /// loop thread should instead route through `disk::TrailerManager` so
    /// the write happens off-thread (see CONCURRENCY & RESOURCE MODEL).
    pub fn store_binary(&mut self) -> crate::error::TrailerResult<()> {
        if self.flags.contains(FileFlags::TRANSIENT) {
            return Ok(());
        }

        self.to_trailer().write_to(&self.full_path())?;
        self.dirty = false;
        self.bytes_since_flush = 0;
        Ok(())
    }

    /// Remove the on-disk trailer, if any. Used when a file is relinked
    /// (see `got_sha1`'s merge path) or discarded before completion.
    pub fn strip_binary(&mut self) -> crate::error::TrailerResult<()> {
        if self.flags.contains(FileFlags::TRANSIENT) {
            return Ok(());
        }

        Trailer::strip_from(&self.full_path())?;
        self.dirty = false;
        self.bytes_since_flush = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileFlags, FileInfo};
    use crate::chunk::Status;
    use crate::source::{Source, SourceState};
    use guess_util::sha::ShaHash;
    use guess_util::test_support::{dummy_sha1, dummy_socket_addr};
    use std::path::PathBuf;

    #[test]
    fn positive_new_file_info_is_not_complete() {
        let info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        assert!(!info.is_complete());
    }

    #[test]
    fn positive_full_completion_after_updates() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        info.update(1, 0, 100, Status::Done);

        assert!(info.is_complete());
    }

    #[test]
    fn positive_got_sha1_sets_once() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        let hash = dummy_sha1("movie.mkv");

        assert!(info.got_sha1(hash));
        assert_eq!(info.sha1, Some(hash));
    }

    #[test]
    fn negative_got_sha1_rejects_conflicting_hash() {
        let mut info = FileInfo::new(
            "movie.mkv".into(),
            PathBuf::from("/tmp"),
            Some(100),
            Some(dummy_sha1("movie.mkv")),
        );

        assert!(!info.got_sha1(dummy_sha1("other.mkv")));
        assert_eq!(info.sha1, Some(dummy_sha1("movie.mkv")));
    }

    #[test]
    fn positive_remove_source_marks_discard_when_requested() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        info.add_source(1, Source::new(1, dummy_socket_addr(1, 6346), SourceState::Receiving));

        info.remove_source(1, true);

        assert!(info.flags.contains(FileFlags::DISCARD));
        assert!(info.should_destroy());
    }

    #[test]
    fn positive_restrict_range_clamps_to_done() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        info.update(1, 0, 50, Status::Done);

        assert_eq!(info.restrict_range(20, 80), Some((20, 50)));
        assert_eq!(info.restrict_range(60, 80), None);
    }

    #[allow(dead_code)]
    fn assert_shahash_eq(a: ShaHash, b: ShaHash) -> bool {
        a == b
    }

    #[test]
    fn positive_flush_due_waits_for_threshold() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        info.update(1, 0, 10, Status::Done);

        assert!(!info.flush_due(50));
        info.update(1, 10, 60, Status::Done);
        assert!(info.flush_due(50));
    }

    #[test]
    fn positive_remove_source_decrements_lifecount() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        info.add_source(1, Source::new(1, dummy_socket_addr(1, 6346), SourceState::Receiving));
        assert_eq!(info.lifecount, 1);

        info.remove_source(1, false);
        assert_eq!(info.lifecount, 0);
    }

    #[test]
    fn positive_add_new_source_builds_and_adds() {
        let mut info = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), None);
        info.add_new_source(1, dummy_socket_addr(1, 6346), SourceState::AQueued);

        assert_eq!(info.refcount(), 1);
    }

    #[test]
    fn positive_get_with_no_existing_or_trailer_creates_new() {
        let info = FileInfo::get(None, "movie.mkv".into(), PathBuf::from("/tmp/nonexistent-dir-xyz"), Some(100), None, true);

        assert_eq!(info.file_name, "movie.mkv");
        assert_eq!(info.chunks.size(), Some(100));
    }

    #[test]
    fn positive_get_with_existing_appends_alias() {
        let existing = FileInfo::new("movie.mkv".into(), PathBuf::from("/tmp"), Some(100), Some(dummy_sha1("movie.mkv")));
        let info = FileInfo::get(Some(existing), "movie (copy).mkv".into(), PathBuf::from("/tmp"), Some(100), Some(dummy_sha1("movie.mkv")), true);

        assert_eq!(info.aliases, vec!["movie (copy).mkv".to_string()]);
    }
}
