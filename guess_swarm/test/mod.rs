extern crate chrono;
extern crate guess_swarm;
extern crate guess_util;

use std::fs;
use std::path::PathBuf;

use guess_swarm::chunk::Status;
use guess_swarm::file_info::FileInfo;
use guess_swarm::shared_index::SharedIndex;
use guess_swarm::source::{Source, SourceState};
use guess_swarm::trailer::Trailer;
use guess_util::test_support::{dummy_sha1, dummy_socket_addr};

fn scratch_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("guess_swarm_integration_{}_{}.bin", tag, std::process::id()))
}

/// A full download lifecycle: a file starts empty, two sources split the
/// work, completion is detected, the trailer is persisted, and a fresh
/// `FileInfo` rebuilt from that trailer reports the same completed state.
#[test]
fn full_download_persists_and_reloads() {
    let path = scratch_path("full_download");
    fs::write(&path, vec![0u8; 200]).unwrap();

    let sha1 = dummy_sha1("disk.iso");
    let mut info = FileInfo::new(
        path.file_name().unwrap().to_str().unwrap().to_string(),
        path.parent().unwrap().to_path_buf(),
        Some(200),
        Some(sha1),
    );

    info.add_source(1, Source::new(1, dummy_socket_addr(1, 6346), SourceState::Receiving));
    info.add_source(2, Source::new(2, dummy_socket_addr(2, 6346), SourceState::Receiving));

    info.update(1, 0, 100, Status::Done);
    info.update(2, 100, 200, Status::Done);

    assert!(info.is_complete());

    info.store_binary().unwrap();

    let (trailer, data_len) = Trailer::read_from(&path).unwrap();
    assert_eq!(data_len, 200);

    let reloaded = FileInfo::from_trailer(
        path.file_name().unwrap().to_str().unwrap().to_string(),
        path.parent().unwrap().to_path_buf(),
        trailer,
    );

    assert!(reloaded.is_complete());
    assert_eq!(reloaded.sha1, Some(sha1));

    fs::remove_file(&path).ok();
}

/// A query hit against a file already fully shared should not spawn a
/// redundant source; a hit against a partial file should.
#[test]
fn shared_index_absorbs_hits_only_for_incomplete_files() {
    let mut index = SharedIndex::new();

    let partial_sha1 = dummy_sha1("partial.iso");
    let mut partial = FileInfo::new("partial.iso".into(), PathBuf::from("/tmp"), Some(100), Some(partial_sha1));
    partial.update(1, 0, 50, Status::Done);
    index.insert(partial);

    let complete_sha1 = dummy_sha1("complete.iso");
    let mut complete = FileInfo::new("complete.iso".into(), PathBuf::from("/tmp"), Some(100), Some(complete_sha1));
    complete.update(1, 0, 100, Status::Done);
    index.insert(complete);

    assert!(index.try_to_swarm_with(&partial_sha1, "partial.iso", dummy_socket_addr(9, 6346), 10));
    assert!(!index.try_to_swarm_with(&complete_sha1, "complete.iso", dummy_socket_addr(9, 6346), 11));

    assert_eq!(index.shared_sha1(&partial_sha1).unwrap().refcount(), 1);
    assert_eq!(index.shared_sha1(&complete_sha1).unwrap().refcount(), 0);
}

/// An integrity failure resets progress but keeps the file's identity and
/// sources intact so the download can resume from empty.
#[test]
fn recreate_resets_progress_without_losing_sources() {
    let mut info = FileInfo::new("bad.iso".into(), PathBuf::from("/tmp"), Some(100), None);
    info.add_source(1, Source::new(1, dummy_socket_addr(1, 6346), SourceState::Receiving));
    info.update(1, 0, 100, Status::Done);
    assert!(info.is_complete());

    info.recreate();

    assert!(!info.is_complete());
    assert_eq!(info.refcount(), 1);
}
