//! On-disk trailer format appended to the tail of a partially or fully
//! downloaded file, so a directory scan at startup can reconstruct progress
//! without an external index (see EXTERNAL INTERFACES / File trailer on
//! disk).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, TimeZone, UTC};
use crc::crc32;
use guess_util::convert::{bytes_le_to_u64, u64_to_bytes_le};
use guess_util::sha::{ShaHash, SHA_HASH_LEN};

use crate::chunk::{ChunkMap, Status};
use crate::error::{TrailerErrorKind, TrailerResult};

const MAGIC: [u8; 4] = *b"GSWT";
const VERSION: u8 = 1;

/// The parts of a `FileInfo` that are persisted verbatim to disk. Derived
/// counters (`aqueued_count`, `refcount`, ...) are never written; they are
/// rebuilt from the `SourceSet` at runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct Trailer {
    pub size: u64,
    pub first_seen: DateTime<UTC>,
    pub last_seen: DateTime<UTC>,
    pub aliases: Vec<String>,
    pub chunks: ChunkMap,
    pub sha1: Option<ShaHash>,
}

impl Trailer {
    fn status_byte(status: Status) -> u8 {
        match status {
            Status::Empty => 0,
            Status::Busy => 1,
            Status::Done => 2,
            Status::Overlap => unreachable!("Overlap is never stored"),
        }
    }

    fn byte_status(byte: u8) -> Status {
        match byte {
            1 => Status::Busy,
            2 => Status::Done,
            _ => Status::Empty,
        }
    }

    /// Serialize the trailer body (everything except the trailing length
    /// field) used both to write the file and to compute the checksum.
    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&MAGIC);
        body.push(VERSION);
        body.extend_from_slice(&u64_to_bytes_le(self.size));
        body.extend_from_slice(&u64_to_bytes_le(self.first_seen.timestamp() as u64));
        body.extend_from_slice(&u64_to_bytes_le(self.last_seen.timestamp() as u64));

        body.extend_from_slice(&(self.aliases.len() as u32).to_le_bytes());
        for alias in &self.aliases {
            let alias_bytes = alias.as_bytes();
            body.extend_from_slice(&(alias_bytes.len() as u32).to_le_bytes());
            body.extend_from_slice(alias_bytes);
        }

        // Busy reservations are runtime-only; only Empty/Done boundaries are
        // meaningful across a restart, but we persist the full interval set
        // so a reload reconstructs an identical ChunkMap (Busy intervals
        // revert to Empty on load, see `decode`).
        let intervals: Vec<_> = self.chunks.intervals().to_vec();
        body.extend_from_slice(&(intervals.len() as u32).to_le_bytes());
        for interval in &intervals {
            body.extend_from_slice(&u64_to_bytes_le(interval.from()));
            body.extend_from_slice(&u64_to_bytes_le(interval.to()));
            body.push(Self::status_byte(interval.status()));
        }

        match self.sha1 {
            Some(hash) => {
                body.push(1);
                body.extend_from_slice(hash.as_ref());
            }
            None => body.push(0),
        }

        body
    }

    /// Write this trailer to the tail of `path`, replacing any trailer
    /// already there so repeated flushes stay idempotent instead of
    /// concatenating. A previously written trailer is located and its data
    /// length recovered the same way `read_from` does; if none is found
    /// (first write) the trailer is appended after the existing file data.
    /// Writes the checksum before the length field so a crash mid-write
    /// leaves the length field (the last bytes touched) as the only
    /// indicator the trailer is incomplete; a reader that fails to find a
    /// valid length simply reports no trailer present.
    pub fn write_to(&self, path: &Path) -> TrailerResult<()> {
        let mut body = self.encode_body();
        let checksum = crc32::checksum_ieee(&body);
        body.extend_from_slice(&checksum.to_le_bytes());

        let total_len = (body.len() + 4) as u32;

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let data_len = Self::existing_data_len(&mut file)?;

        file.seek(SeekFrom::Start(data_len))?;
        file.write_all(&body)?;
        file.write_all(&total_len.to_le_bytes())?;
        file.set_len(data_len + body.len() as u64 + 4)?;
        file.sync_data()?;

        Ok(())
    }

    /// Remove any trailer appended to `path`, truncating the file back to
    /// its underlying data. A no-op if no trailer is present.
    pub fn strip_from(path: &Path) -> TrailerResult<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let data_len = Self::existing_data_len(&mut file)?;
        file.set_len(data_len)?;
        file.sync_data()?;
        Ok(())
    }

    /// Byte offset where a prior trailer (if any) begins, so a fresh write
    /// overwrites it rather than appending after it. Falls back to the
    /// current end of file when no valid trailer is present.
    fn existing_data_len(file: &mut std::fs::File) -> TrailerResult<u64> {
        let file_len = file.seek(SeekFrom::End(0))?;
        if file_len < 4 {
            return Ok(file_len);
        }

        file.seek(SeekFrom::End(-4))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let total_len = u32::from_le_bytes(len_bytes) as u64;

        if total_len < 4 || total_len > file_len {
            return Ok(file_len);
        }

        Ok(file_len - total_len)
    }

    /// Read the trailer appended to `path`, returning the on-disk `Trailer`
    /// plus the byte length of the data portion preceding it.
    pub fn read_from(path: &Path) -> TrailerResult<(Trailer, u64)> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let file_len = file.seek(SeekFrom::End(0))?;

        if file_len < 4 {
            return Err(TrailerErrorKind::BadMagic { found: [0; 4] }.into());
        }

        file.seek(SeekFrom::End(-4))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let total_len = u32::from_le_bytes(len_bytes) as u64;

        if total_len < 4 || total_len > file_len {
            return Err(TrailerErrorKind::BadMagic { found: [0; 4] }.into());
        }

        let data_len = file_len - total_len;
        file.seek(SeekFrom::Start(data_len))?;
        let mut body = vec![0u8; (total_len - 4) as usize];
        file.read_exact(&mut body)?;

        let (trailer, _) = Self::decode(&body)?;
        Ok((trailer, data_len))
    }

    fn decode(body: &[u8]) -> TrailerResult<(Trailer, usize)> {
        if body.len() < 4 || body[0..4] != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&body[0..4.min(body.len())]);
            return Err(TrailerErrorKind::BadMagic { found }.into());
        }
        if body.len() < 4 {
            return Err(TrailerErrorKind::BadChecksum {}.into());
        }

        let checksum_offset = body.len() - 4;
        let mut stored_checksum_bytes = [0u8; 4];
        stored_checksum_bytes.copy_from_slice(&body[checksum_offset..]);
        let stored_checksum = u32::from_le_bytes(stored_checksum_bytes);
        let computed_checksum = crc32::checksum_ieee(&body[..checksum_offset]);
        if stored_checksum != computed_checksum {
            return Err(TrailerErrorKind::BadChecksum {}.into());
        }

        let mut cursor = 4usize;
        let version = body[cursor];
        cursor += 1;
        if version != VERSION {
            return Err(TrailerErrorKind::UnsupportedVersion { found: version }.into());
        }

        let size = read_u64(body, &mut cursor);
        let first_seen = UTC.timestamp(read_u64(body, &mut cursor) as i64, 0);
        let last_seen = UTC.timestamp(read_u64(body, &mut cursor) as i64, 0);

        let alias_count = read_u32(body, &mut cursor);
        let mut aliases = Vec::with_capacity(alias_count as usize);
        for _ in 0..alias_count {
            let alias_len = read_u32(body, &mut cursor) as usize;
            let alias = String::from_utf8_lossy(&body[cursor..cursor + alias_len]).into_owned();
            cursor += alias_len;
            aliases.push(alias);
        }

        let interval_count = read_u32(body, &mut cursor);
        let mut chunks = ChunkMap::new(size);
        for _ in 0..interval_count {
            let from = read_u64(body, &mut cursor);
            let to = read_u64(body, &mut cursor);
            let status = Self::byte_status(body[cursor]);
            cursor += 1;

            // Busy reservations don't survive a restart: no source holds
            // them any more, so they are reloaded as Empty.
            let persisted_status = if status == Status::Busy { Status::Empty } else { status };
            chunks.update(0, from, to, persisted_status);
        }

        let has_sha1 = body[cursor];
        cursor += 1;
        let sha1 = if has_sha1 == 1 {
            let hash = ShaHash::from_hash(&body[cursor..cursor + SHA_HASH_LEN]);
            cursor += SHA_HASH_LEN;
            hash
        } else {
            None
        };

        Ok((
            Trailer {
                size,
                first_seen,
                last_seen,
                aliases,
                chunks,
                sha1,
            },
            cursor,
        ))
    }
}

fn read_u64(body: &[u8], cursor: &mut usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&body[*cursor..*cursor + 8]);
    *cursor += 8;
    bytes_le_to_u64(bytes)
}

fn read_u32(body: &[u8], cursor: &mut usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&body[*cursor..*cursor + 4]);
    *cursor += 4;
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use chrono::UTC;
    use guess_util::test_support::dummy_sha1;

    use super::Trailer;
    use crate::chunk::{ChunkMap, Status};

    fn sample_trailer() -> Trailer {
        let mut chunks = ChunkMap::new(100);
        chunks.update(1, 0, 40, Status::Done);

        Trailer {
            size: 100,
            first_seen: UTC::now(),
            last_seen: UTC::now(),
            aliases: vec!["movie.mkv".to_string(), "movie (copy).mkv".to_string()],
            chunks,
            sha1: Some(dummy_sha1("movie.mkv")),
        }
    }

    #[test]
    fn positive_write_then_read_round_trips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("guess_swarm_trailer_test_{}.bin", std::process::id()));

        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&vec![0u8; 100]).unwrap();
        }

        let trailer = sample_trailer();
        trailer.write_to(&path).unwrap();

        let (read_back, data_len) = Trailer::read_from(&path).unwrap();

        assert_eq!(data_len, 100);
        assert_eq!(read_back.size, trailer.size);
        assert_eq!(read_back.aliases, trailer.aliases);
        assert_eq!(read_back.sha1, trailer.sha1);
        assert_eq!(read_back.chunks.done_ranges(), trailer.chunks.done_ranges());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn positive_busy_intervals_reload_as_empty() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("guess_swarm_trailer_busy_{}.bin", std::process::id()));

        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&vec![0u8; 100]).unwrap();
        }

        let mut trailer = sample_trailer();
        trailer.chunks.update(7, 40, 60, Status::Busy);
        trailer.write_to(&path).unwrap();

        let (read_back, _) = Trailer::read_from(&path).unwrap();
        assert_eq!(read_back.chunks.chunk_status(40, 60), Status::Empty);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn positive_strip_from_truncates_trailer_away() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("guess_swarm_trailer_strip_{}.bin", std::process::id()));

        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&vec![0u8; 100]).unwrap();
        }

        let trailer = sample_trailer();
        trailer.write_to(&path).unwrap();
        assert!(Trailer::read_from(&path).is_ok());

        Trailer::strip_from(&path).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
        assert!(Trailer::read_from(&path).is_err());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn negative_corrupted_checksum_is_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("guess_swarm_trailer_bad_{}.bin", std::process::id()));

        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&vec![0u8; 100]).unwrap();
        }

        let trailer = sample_trailer();
        trailer.write_to(&path).unwrap();

        // Flip a byte inside the trailer body.
        let mut bytes = std::fs::read(&path).unwrap();
        let flip_index = bytes.len() - 10;
        bytes[flip_index] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(Trailer::read_from(&path).is_err());

        std::fs::remove_file(&path).ok();
    }
}
