//! Content hashing and blob path derivation (core component 4.1).
//!
//! `ContentHash` is a tagged union over hash algorithms. Only BLAKE3 is
//! implemented today, matching the rest of this codebase, but callers must
//! not assume a fixed algorithm: `blob_path` and the streaming hasher both
//! dispatch on `HashType`.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported hash algorithms. A tagged union in spirit even though there is
/// currently one variant; new algorithms add a variant, never replace this
/// one, so that historical ContentHash values remain decodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashType {
    Blake3,
}

impl HashType {
    fn byte_len(self) -> usize {
        match self {
            HashType::Blake3 => 32,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            HashType::Blake3 => "blake3",
        }
    }
}

/// A cryptographic content hash, tagged with the algorithm that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash {
    pub algo: HashType,
    pub bytes: [u8; 32],
}

impl ContentHash {
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self {
            algo: HashType::Blake3,
            bytes: *hash.as_bytes(),
        }
    }

    /// First N bytes, hex-encoded: the textual short form used in logs and
    /// in the human-readable part of a BlobPath.
    pub fn short_hex(&self, n: usize) -> String {
        let n = n.min(self.algo.byte_len());
        hex::encode(&self.bytes[..n])
    }

    pub fn full_hex(&self) -> String {
        hex::encode(&self.bytes[..self.algo.byte_len()])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo.tag(), self.full_hex())
    }
}

/// A hierarchical name in the remote namespace: container + folder +
/// relative path. Derived from a ContentHash by a pure function so that any
/// node can compute the storage location without a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath {
    pub container: String,
    pub folder: String,
    pub relative_path: PathBuf,
}

impl BlobPath {
    pub fn to_object_name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.container,
            self.folder,
            self.relative_path.display()
        )
    }
}

/// Derive the BlobPath for a ContentHash: a 3-level hex fan-out under the
/// algorithm's own folder, matching the on-disk layout used by Local CAS
/// (`<algo>/<hh>/<hh>/<hash>_<size>.bin`) so the same derivation serves both
/// the remote object namespace and the local CAS root.
pub fn blob_path(hash: &ContentHash, size: u64) -> BlobPath {
    let hex = hash.full_hex();
    let shard_a = &hex[0..2];
    let shard_b = &hex[2..4];
    BlobPath {
        container: "bcache".to_string(),
        folder: hash.algo.tag().to_string(),
        relative_path: PathBuf::from(shard_a)
            .join(shard_b)
            .join(format!("{hex}_{size}.bin")),
    }
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, HashError>;

/// Hash an entire stream, reading it to completion. Sequential below
/// `parallel_hash_boundary`, multi-threaded (`blake3::Hasher::update_rayon`)
/// at or above it: large inputs dominate wall-clock time with hashing, not
/// I/O, so splitting the hash across the rayon pool pays off there and only
/// there.
pub fn hash_stream<R: Read>(
    _algo: HashType,
    mut reader: R,
    parallel_hash_boundary: u64,
) -> Result<(ContentHash, u64)> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let hash = hash_bytes(&buf, parallel_hash_boundary);
    Ok((hash, buf.len() as u64))
}

fn hash_bytes(data: &[u8], parallel_hash_boundary: u64) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    if data.len() as u64 >= parallel_hash_boundary {
        hasher.update_rayon(data);
    } else {
        hasher.update(data);
    }
    ContentHash::from_blake3(hasher.finalize())
}

/// A streaming hasher that tees every byte written to it into a sink while
/// accumulating a running hash, so a caller can simultaneously persist
/// content and learn its hash without buffering the whole stream twice.
///
/// Below `parallel_hash_boundary` bytes seen so far, each `write` feeds the
/// hasher sequentially; once the running total crosses the boundary, writes
/// switch to `update_rayon` for the remainder. This matches buffered hashing
/// on identical byte sequences because BLAKE3 is a tree hash: sequential and
/// parallel updates of the same bytes produce the same digest.
pub struct TeeHasher<W: Write> {
    sink: W,
    hasher: blake3::Hasher,
    written: u64,
    parallel_hash_boundary: u64,
}

impl<W: Write> TeeHasher<W> {
    pub fn new(sink: W, parallel_hash_boundary: u64) -> Self {
        Self {
            sink,
            hasher: blake3::Hasher::new(),
            written: 0,
            parallel_hash_boundary,
        }
    }

    pub fn finalize(self) -> (ContentHash, u64, W) {
        let hash = ContentHash::from_blake3(self.hasher.finalize());
        (hash, self.written, self.sink)
    }
}

impl<W: Write> Write for TeeHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sink.write(buf)?;
        if self.written >= self.parallel_hash_boundary {
            self.hasher.update_rayon(&buf[..n]);
        } else {
            self.hasher.update(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stream_hash_matches_buffered_hash() {
        let data = vec![7u8; 5000];
        let (streamed, size) = hash_stream(HashType::Blake3, Cursor::new(&data), 1024).unwrap();
        assert_eq!(size, data.len() as u64);
        let buffered = ContentHash::from_blake3(blake3::hash(&data));
        assert_eq!(streamed, buffered);
    }

    #[test]
    fn small_stream_below_boundary_matches_buffered() {
        let data = b"tiny".to_vec();
        let (streamed, _) = hash_stream(HashType::Blake3, Cursor::new(&data), 1 << 20).unwrap();
        let buffered = ContentHash::from_blake3(blake3::hash(&data));
        assert_eq!(streamed, buffered);
    }

    #[test]
    fn tee_hasher_matches_buffered_and_preserves_bytes() {
        let data = vec![3u8; 9000];
        let mut out = Vec::new();
        {
            let mut tee = TeeHasher::new(&mut out, 2048);
            tee.write_all(&data).unwrap();
            let (hash, written, _) = tee.finalize();
            assert_eq!(written, data.len() as u64);
            assert_eq!(hash, ContentHash::from_blake3(blake3::hash(&data)));
        }
        assert_eq!(out, data);
    }

    #[test]
    fn blob_path_is_pure_and_sharded() {
        let hash = ContentHash::from_blake3(blake3::hash(b"hello"));
        let a = blob_path(&hash, 5);
        let b = blob_path(&hash, 5);
        assert_eq!(a, b);
        assert_eq!(a.folder, "blake3");
        let hex = hash.full_hex();
        assert!(a.relative_path.starts_with(&hex[0..2]));
    }

    #[test]
    fn display_shows_algo_and_hex() {
        let hash = ContentHash::from_blake3(blake3::hash(b"x"));
        let s = hash.to_string();
        assert!(s.starts_with("blake3:"));
    }
}
