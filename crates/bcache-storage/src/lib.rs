//! Blob Storage Adapter (core component 4.2): a thin capability over a blob
//! namespace, independent of whatever transport eventually backs it.
//!
//! The trait is kept object-safe and byte-oriented (`dyn BlobStorageAdapter`),
//! following the capability-interface idiom this codebase already uses for
//! `IngestBackend` in its local-CAS ingest path. Typed optimistic-concurrency
//! (`read_modify_write`) is layered on top as a free function rather than a
//! trait method, since a generic trait method is not object-safe.

use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher as _};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use bcache_hash::BlobPath as ObjectPath;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("terminal error: {0}")]
    Terminal(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Per SPEC_FULL §7: timeouts, throttling, transient connection
    /// failures, underlying I/O errors, and unauthorized are all retryable.
    /// Authorization hard-fail, not-found-on-create, and schema errors are
    /// not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Transient(_) | StorageError::PreconditionFailed
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy)]
pub struct TouchInfo {
    pub length: u64,
    pub last_access_nanos: u128,
}

/// Opaque optimistic-concurrency token returned alongside a
/// `read_modify_write` read. `0` means "no object was present".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ETag(pub u64);

pub struct SizedStream {
    pub len: u64,
    pub reader: Box<dyn Read + Send>,
}

/// Thin capability over a remote blob namespace. Every op carries its own
/// timeout budget via `RetryPolicy` rather than a method parameter, since the
/// policy also governs retry classification.
pub trait BlobStorageAdapter: Send + Sync {
    fn ensure_container(&self, container: &str) -> Result<()>;
    fn exists(&self, path: &ObjectPath) -> Result<bool>;
    fn open_read(&self, path: &ObjectPath) -> Result<SizedStream>;
    fn upload_if_absent(&self, path: &ObjectPath, data: &[u8]) -> Result<UploadOutcome>;
    fn touch(&self, path: &ObjectPath) -> Result<TouchInfo>;

    /// Streaming counterpart to `upload_if_absent`, for callers that already
    /// hold the content hash and don't want to buffer the whole blob just to
    /// call the byte-slice entry point. The default forwards through a
    /// buffer for adapters that don't override it; `LocalFsAdapter` writes
    /// straight through instead.
    fn upload_if_absent_stream(
        &self,
        path: &ObjectPath,
        reader: &mut dyn Read,
    ) -> Result<UploadOutcome> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        self.upload_if_absent(path, &buf)
    }

    /// Read the current raw bytes and ETag at `path`. `None` means the
    /// object is absent (caller supplies the default value).
    fn read_raw(&self, path: &ObjectPath) -> Result<Option<(Vec<u8>, ETag)>>;

    /// Write `data` back to `path`, succeeding only if the stored ETag still
    /// equals `expected`. `expected == ETag(0)` means "must not exist yet".
    fn write_if_match(&self, path: &ObjectPath, data: &[u8], expected: ETag) -> Result<ETag>;
}

/// Bounded exponential backoff shared by every retry loop in this crate and
/// its dependents, in the shape of this codebase's existing
/// `lock_with_retry` (non-blocking attempt, doubling delay, bounded count).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut delay = self.initial_delay;
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    tracing::debug!(attempt, error = %e, "retrying after transient storage error");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Optimistic-concurrency read-modify-write over a typed value, built on
/// `BlobStorageAdapter::{read_raw, write_if_match}`. `f` returns
/// `(next, result, updated)`; when `updated` is false nothing is written.
pub fn read_modify_write<A, T, R>(
    adapter: &A,
    path: &ObjectPath,
    retry: &RetryPolicy,
    default: impl Fn() -> T,
    mut f: impl FnMut(T) -> (T, R, bool),
) -> Result<R>
where
    A: BlobStorageAdapter + ?Sized,
    T: Serialize + DeserializeOwned,
{
    retry.run(|_attempt| {
        let (current, etag) = match adapter.read_raw(path)? {
            Some((bytes, etag)) => {
                let value: T = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Terminal(e.to_string()))?;
                (value, etag)
            }
            None => (default(), ETag(0)),
        };
        let (next, result, updated) = f(current);
        if !updated {
            return Ok(result);
        }
        let bytes =
            serde_json::to_vec(&next).map_err(|e| StorageError::Terminal(e.to_string()))?;
        adapter.write_if_match(path, &bytes, etag)?;
        Ok(result)
    })
}

/// Local-filesystem implementation of `BlobStorageAdapter`: one file per
/// `ObjectPath`, plus a sibling `.etag` file holding a generation counter and
/// a sibling `.access` file holding the last-access timestamp used by
/// `touch`. `read_modify_write` callers are serialized per path by an
/// in-process keyed lock, sufficient because this adapter is only ever
/// reached through a single process; a networked adapter would instead rely
/// on the remote store's own conditional-write primitive.
pub struct LocalFsAdapter {
    root: PathBuf,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LocalFsAdapter {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            path_locks: DashMap::new(),
        })
    }

    fn full_path(&self, path: &ObjectPath) -> PathBuf {
        self.root
            .join(&path.container)
            .join(&path.folder)
            .join(&path.relative_path)
    }

    fn etag_path(full: &std::path::Path) -> PathBuf {
        let mut p = full.as_os_str().to_owned();
        p.push(".etag");
        PathBuf::from(p)
    }

    fn access_path(full: &std::path::Path) -> PathBuf {
        let mut p = full.as_os_str().to_owned();
        p.push(".access");
        PathBuf::from(p)
    }

    fn lock_for(&self, full: &std::path::Path) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(full.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_etag(path: &std::path::Path) -> Result<ETag> {
        match fs::read_to_string(path) {
            Ok(s) => Ok(ETag(s.trim().parse().unwrap_or(0))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ETag(0)),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(path: &std::path::Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.to_path_buf();
        let file_name = format!(
            "{}.tmp.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("obj"),
            std::process::id()
        );
        tmp.set_file_name(file_name);
        {
            let mut f = File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

impl BlobStorageAdapter for LocalFsAdapter {
    fn ensure_container(&self, container: &str) -> Result<()> {
        fs::create_dir_all(self.root.join(container))?;
        Ok(())
    }

    fn exists(&self, path: &ObjectPath) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }

    fn open_read(&self, path: &ObjectPath) -> Result<SizedStream> {
        let full = self.full_path(path);
        let file = match File::open(&full) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        Ok(SizedStream {
            len,
            reader: Box::new(io::BufReader::new(file)),
        })
    }

    fn upload_if_absent(&self, path: &ObjectPath, data: &[u8]) -> Result<UploadOutcome> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(mut f) => {
                f.write_all(data)?;
                f.sync_all()?;
                Self::write_atomic(&Self::etag_path(&full), b"0")?;
                Self::write_atomic(
                    &Self::access_path(&full),
                    now_nanos().to_string().as_bytes(),
                )?;
                Ok(UploadOutcome::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(UploadOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    fn upload_if_absent_stream(
        &self,
        path: &ObjectPath,
        reader: &mut dyn Read,
    ) -> Result<UploadOutcome> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(mut f) => {
                io::copy(reader, &mut f)?;
                f.sync_all()?;
                Self::write_atomic(&Self::etag_path(&full), b"0")?;
                Self::write_atomic(
                    &Self::access_path(&full),
                    now_nanos().to_string().as_bytes(),
                )?;
                Ok(UploadOutcome::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Drain the reader so a caller that assumed the write
                // happened doesn't find unread bytes still pending.
                io::copy(reader, &mut io::sink())?;
                Ok(UploadOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn touch(&self, path: &ObjectPath) -> Result<TouchInfo> {
        let full = self.full_path(path);
        let meta = match fs::metadata(&full) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let access_path = Self::access_path(&full);
        let previous = fs::read_to_string(&access_path)
            .ok()
            .and_then(|s| s.trim().parse::<u128>().ok())
            .unwrap_or(0);
        let last_access = previous.max(now_nanos());
        Self::write_atomic(&access_path, last_access.to_string().as_bytes())?;
        Ok(TouchInfo {
            length: meta.len(),
            last_access_nanos: last_access,
        })
    }

    fn read_raw(&self, path: &ObjectPath) -> Result<Option<(Vec<u8>, ETag)>> {
        let full = self.full_path(path);
        match fs::read(&full) {
            Ok(bytes) => {
                let etag = Self::read_etag(&Self::etag_path(&full))?;
                Ok(Some((bytes, etag)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_if_match(&self, path: &ObjectPath, data: &[u8], expected: ETag) -> Result<ETag> {
        let full = self.full_path(path);
        let lock = self.lock_for(&full);
        let _guard = lock.lock().unwrap_or_else(|poison| poison.into_inner());

        let current = Self::read_etag(&Self::etag_path(&full))?;
        if current != expected {
            return Err(StorageError::PreconditionFailed);
        }
        Self::write_atomic(&full, data)?;
        let next = ETag(current.0.wrapping_add(1));
        Self::write_atomic(&Self::etag_path(&full), next.0.to_string().as_bytes())?;
        Ok(next)
    }
}

/// Hash a sender/partition-style key into a bounded integer range, used by
/// the event stream to pick a partition and reusable anywhere a stable
/// key->bucket mapping is needed.
pub fn bucket_of<K: Hash>(key: &K, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % buckets.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache_hash::{blob_path, ContentHash};
    use tempfile::TempDir;

    fn adapter() -> (TempDir, LocalFsAdapter) {
        let dir = TempDir::new().unwrap();
        let a = LocalFsAdapter::new(dir.path()).unwrap();
        (dir, a)
    }

    fn path_for(n: &str) -> ObjectPath {
        let hash = ContentHash::from_blake3(blake3::hash(n.as_bytes()));
        blob_path(&hash, n.len() as u64)
    }

    #[test]
    fn upload_if_absent_is_linearizable() {
        let (_d, a) = adapter();
        let p = path_for("hello");
        assert_eq!(a.upload_if_absent(&p, b"hello").unwrap(), UploadOutcome::Created);
        assert_eq!(
            a.upload_if_absent(&p, b"hello").unwrap(),
            UploadOutcome::AlreadyExists
        );
        let mut s = a.open_read(&p).unwrap();
        let mut buf = Vec::new();
        s.reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn upload_if_absent_stream_writes_without_full_buffer_api() {
        let (_d, a) = adapter();
        let p = path_for("streamed");
        assert_eq!(
            a.upload_if_absent_stream(&p, &mut &b"streamed"[..]).unwrap(),
            UploadOutcome::Created
        );
        assert_eq!(
            a.upload_if_absent_stream(&p, &mut &b"streamed"[..]).unwrap(),
            UploadOutcome::AlreadyExists
        );
        let mut s = a.open_read(&p).unwrap();
        let mut buf = Vec::new();
        s.reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"streamed");
    }

    #[test]
    fn touch_absent_is_not_found() {
        let (_d, a) = adapter();
        let p = path_for("nope");
        assert!(matches!(a.touch(&p), Err(StorageError::NotFound)));
    }

    #[test]
    fn touch_present_returns_length_and_monotonic_access() {
        let (_d, a) = adapter();
        let p = path_for("data");
        a.upload_if_absent(&p, b"data").unwrap();
        let first = a.touch(&p).unwrap();
        assert_eq!(first.length, 4);
        let second = a.touch(&p).unwrap();
        assert!(second.last_access_nanos >= first.last_access_nanos);
    }

    #[test]
    fn read_modify_write_observes_exact_state_read() {
        let (_d, a) = adapter();
        let p = path_for("counter");
        let retry = RetryPolicy::default();

        let r1: u64 = read_modify_write(&a, &p, &retry, || 0u64, |old| (old + 1, old + 1, true)).unwrap();
        assert_eq!(r1, 1);
        let r2: u64 = read_modify_write(&a, &p, &retry, || 0u64, |old| (old + 1, old + 1, true)).unwrap();
        assert_eq!(r2, 2);
    }

    #[test]
    fn read_modify_write_no_op_when_not_updated() {
        let (_d, a) = adapter();
        let p = path_for("noop");
        let retry = RetryPolicy::default();
        let r: u64 = read_modify_write(&a, &p, &retry, || 5u64, |old| (old, old, false)).unwrap();
        assert_eq!(r, 5);
        assert!(!a.exists(&p).unwrap());
    }

    #[test]
    fn write_if_match_rejects_stale_etag() {
        let (_d, a) = adapter();
        let p = path_for("stale");
        a.upload_if_absent(&p, b"v0").unwrap();
        let stale = ETag(999);
        assert!(matches!(
            a.write_if_match(&p, b"v1", stale),
            Err(StorageError::PreconditionFailed)
        ));
    }
}
