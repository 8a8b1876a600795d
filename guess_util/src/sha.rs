use std::fmt;

use sha1::Sha1;

/// Length of a SHA-1 hash in bytes.
pub const SHA_HASH_LEN: usize = 20;

/// SHA-1 content hash used as the identity of a shared or downloading file.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaHash {
    hash: [u8; SHA_HASH_LEN],
}

impl ShaHash {
    /// Hash the given bytes in one shot.
    pub fn from_bytes(bytes: &[u8]) -> ShaHash {
        ShaHashBuilder::new().add_bytes(bytes).build()
    }

    /// Wrap an already-computed 20 byte digest.
    ///
    /// Returns `None` if `hash` is not exactly `SHA_HASH_LEN` bytes.
    pub fn from_hash(hash: &[u8]) -> Option<ShaHash> {
        if hash.len() != SHA_HASH_LEN {
            None
        } else {
            let mut buffer = [0u8; SHA_HASH_LEN];
            buffer.copy_from_slice(hash);

            Some(ShaHash { hash: buffer })
        }
    }
}

impl AsRef<[u8]> for ShaHash {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

impl From<[u8; SHA_HASH_LEN]> for ShaHash {
    fn from(hash: [u8; SHA_HASH_LEN]) -> ShaHash {
        ShaHash { hash }
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.hash.iter() {
            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Builds a `ShaHash` by streaming bytes into it, mirroring how a trailer checksum
/// or a whole-file identity hash is accumulated across several writes.
#[derive(Clone)]
pub struct ShaHashBuilder {
    sha: Sha1,
}

impl ShaHashBuilder {
    pub fn new() -> ShaHashBuilder {
        ShaHashBuilder { sha: Sha1::new() }
    }

    pub fn add_bytes(mut self, bytes: &[u8]) -> ShaHashBuilder {
        self.sha.update(bytes);

        self
    }

    pub fn build(&self) -> ShaHash {
        self.sha.clone().digest().bytes().into()
    }
}
