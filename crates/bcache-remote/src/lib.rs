//! Remote CAS Session (core component 4.4): a hash-addressed view over a
//! `BlobStorageAdapter`, bound to a single remote folder and the
//! hash -> BlobPath derivation from `bcache-hash`. Every successful
//! mutating operation emits a lifecycle event so the event stream (4.8) can
//! keep other sessions' elision caches honest.

use std::io::{self, Read, Write};

use bcache_events::Event;
use bcache_hash::{blob_path, ContentHash};
use bcache_storage::{BlobStorageAdapter, ObjectPath, RetryPolicy, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found")]
    NotFound,
    #[error("content hash mismatch: expected {expected}, observed {observed}")]
    ContentHashMismatch {
        expected: ContentHash,
        observed: ContentHash,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    Found { size: u64 },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Placed { size: u64 },
    NotPlacedContentNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created { size: u64 },
    AlreadyExists { size: u64 },
}

/// Timings reported by `place_file`, per SPEC_FULL §4.4.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceTimings {
    pub time_to_first_byte: std::time::Duration,
    pub open_stream_duration: std::time::Duration,
    pub download_duration: std::time::Duration,
}

/// Sink for lifecycle events emitted by session operations. Kept separate
/// from `bcache_events::Publisher` (which owns transport/retry/batching) so
/// a session can be tested without a live transport.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<F: Fn(Event) + Send + Sync> EventSink for F {
    fn emit(&self, event: Event) {
        (self)(event)
    }
}

/// No-op sink, for callers that don't care about the event stream (tests,
/// or a session with no registered listeners).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

pub struct RemoteCasSession<A: BlobStorageAdapter> {
    adapter: A,
    retry: RetryPolicy,
    sink: Box<dyn EventSink>,
}

fn classify_retryable(err: &io::Error) -> StorageError {
    StorageError::Transient(err.to_string())
}

impl<A: BlobStorageAdapter> RemoteCasSession<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            retry: RetryPolicy::default(),
            sink: Box::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn path_for(&self, hash: &ContentHash, size: u64) -> ObjectPath {
        blob_path(hash, size)
    }

    fn emit(&self, path: &str, hash: &ContentHash, event: impl FnOnce(String, ContentHash) -> Event) {
        self.sink.emit(event(path.to_string(), *hash));
    }

    /// Refresh last-access for `hash`'s blob. Not-found (missing blob or a
    /// precondition that no longer holds) both collapse to `NotFound` and
    /// both emit `Delete`, since either way the blob is gone as far as this
    /// session can tell.
    pub fn pin(&self, hash: &ContentHash, size_hint: u64) -> Result<PinOutcome> {
        let path = self.path_for(hash, size_hint);
        let result = self.retry.run(|_| self.adapter.touch(&path));
        match result {
            Ok(info) => Ok(PinOutcome::Found { size: info.length }),
            Err(StorageError::NotFound) | Err(StorageError::PreconditionFailed) => {
                self.emit(&path.to_object_name(), hash, |p, h| Event::Delete { path: p, hash: h });
                Ok(PinOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a readable stream over `hash`'s blob without touching the event
    /// sink, so callers that need to verify content before deciding which
    /// event applies (`place_file`) can do so.
    fn open_stream_raw(
        &self,
        hash: &ContentHash,
        size_hint: u64,
    ) -> Result<Option<(Box<dyn Read + Send>, u64)>> {
        let path = self.path_for(hash, size_hint);
        match self.retry.run(|_| self.adapter.open_read(&path)) {
            Ok(stream) => Ok(Some((stream.reader, stream.len))),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a readable stream over `hash`'s blob, emitting `Delete` on a
    /// miss or `Touch` on a hit (opening a stream is itself evidence the
    /// content is still live and worth keeping).
    pub fn open_stream(
        &self,
        hash: &ContentHash,
        size_hint: u64,
    ) -> Result<Option<(Box<dyn Read + Send>, u64)>> {
        let path = self.path_for(hash, size_hint).to_object_name();
        match self.open_stream_raw(hash, size_hint)? {
            Some((reader, len)) => {
                self.emit(&path, hash, |p, h| Event::Touch { path: p, hash: h, size: len });
                Ok(Some((reader, len)))
            }
            None => {
                self.emit(&path, hash, |p, h| Event::Delete { path: p, hash: h });
                Ok(None)
            }
        }
    }

    /// Stream `hash`'s blob to `dest`, verifying the downloaded bytes hash
    /// to exactly `hash` before leaving the file in place. A mismatch means
    /// the remote blob is corrupt: the partial file is removed and this
    /// returns `NotPlacedContentNotFound` rather than silently accepting
    /// wrong bytes.
    pub fn place_file(
        &self,
        hash: &ContentHash,
        dest: &std::path::Path,
        size_hint: u64,
    ) -> Result<(PlaceOutcome, PlaceTimings)> {
        let path = self.path_for(hash, size_hint).to_object_name();
        let t0 = std::time::Instant::now();
        let Some((mut reader, len)) = self.open_stream_raw(hash, size_hint)? else {
            self.emit(&path, hash, |p, h| Event::Delete { path: p, hash: h });
            return Ok((PlaceOutcome::NotPlacedContentNotFound, PlaceTimings::default()));
        };
        let open_stream_duration = t0.elapsed();

        let t1 = std::time::Instant::now();
        let mut file = std::fs::File::create(dest)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        let mut first_byte_at = None;
        loop {
            let n = reader.read(&mut buf).map_err(classify_retryable)?;
            if n == 0 {
                break;
            }
            if first_byte_at.is_none() {
                first_byte_at = Some(t1.elapsed());
            }
            if len >= (1 << 20) {
                hasher.update_rayon(&buf[..n]);
            } else {
                hasher.update(&buf[..n]);
            }
            file.write_all(&buf[..n])?;
        }
        file.sync_all()?;
        let download_duration = t1.elapsed();

        let observed = ContentHash::from_blake3(hasher.finalize());
        if observed != *hash {
            drop(file);
            let _ = std::fs::remove_file(dest);
            tracing::warn!(
                expected = %hash,
                observed = %observed,
                "remote blob failed integrity verification, treating as not found"
            );
            self.emit(&path, hash, |p, h| Event::Delete { path: p, hash: h });
            return Ok((PlaceOutcome::NotPlacedContentNotFound, PlaceTimings {
                time_to_first_byte: first_byte_at.unwrap_or_default(),
                open_stream_duration,
                download_duration,
            }));
        }

        self.emit(&path, hash, |p, h| Event::Touch { path: p, hash: h, size: len });
        Ok((
            PlaceOutcome::Placed { size: len },
            PlaceTimings {
                time_to_first_byte: first_byte_at.unwrap_or_default(),
                open_stream_duration,
                download_duration,
            },
        ))
    }

    /// Upload `data` under its content hash if absent. An `AlreadyExists`
    /// response still refreshes last-access via `touch` before returning,
    /// closing the race window where a GC sweep could otherwise reclaim
    /// content a caller is about to reference in a new memo entry.
    pub fn put_bytes(&self, hash: &ContentHash, data: &[u8]) -> Result<PutOutcome> {
        let size = data.len() as u64;
        let path = self.path_for(hash, size);
        let outcome = self
            .retry
            .run(|_| self.adapter.upload_if_absent(&path, data))?;
        match outcome {
            bcache_storage::UploadOutcome::Created => {
                self.emit(&path.to_object_name(), hash, |p, h| Event::Add { path: p, hash: h, size });
                Ok(PutOutcome::Created { size })
            }
            bcache_storage::UploadOutcome::AlreadyExists => {
                self.retry.run(|_| self.adapter.touch(&path))?;
                self.emit(&path.to_object_name(), hash, |p, h| Event::Touch { path: p, hash: h, size });
                Ok(PutOutcome::AlreadyExists { size })
            }
        }
    }

    /// Hash-then-upload variant of `put_bytes` for callers that don't
    /// already know the content hash.
    pub fn put_unhashed(&self, data: &[u8]) -> Result<(ContentHash, PutOutcome)> {
        let hash = ContentHash::from_blake3(blake3::hash(data));
        let outcome = self.put_bytes(&hash, data)?;
        Ok((hash, outcome))
    }

    /// Streaming counterpart to `put_bytes`: uploads `reader`'s content
    /// under `hash` without buffering the whole blob in memory, via
    /// `BlobStorageAdapter::upload_if_absent_stream`. The retry policy can
    /// only replay the upload if `reader` itself is re-openable, so callers
    /// that need retry-on-transient-failure should pass a type whose
    /// `Clone`/reopen path is cheap (a `File` reopened by path, not a
    /// one-shot pipe).
    pub fn put_stream(
        &self,
        hash: &ContentHash,
        size: u64,
        mut reader: impl Read,
    ) -> Result<PutOutcome> {
        let path = self.path_for(hash, size);
        let outcome = self.adapter.upload_if_absent_stream(&path, &mut reader)?;
        match outcome {
            bcache_storage::UploadOutcome::Created => {
                self.emit(&path.to_object_name(), hash, |p, h| Event::Add { path: p, hash: h, size });
                Ok(PutOutcome::Created { size })
            }
            bcache_storage::UploadOutcome::AlreadyExists => {
                self.retry.run(|_| self.adapter.touch(&path))?;
                self.emit(&path.to_object_name(), hash, |p, h| Event::Touch { path: p, hash: h, size });
                Ok(PutOutcome::AlreadyExists { size })
            }
        }
    }
}
