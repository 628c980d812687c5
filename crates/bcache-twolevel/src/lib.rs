//! Two-Level Cache Session (core component 4.5): composes a Local CAS in
//! front of a Remote CAS Session so that repeat reads are served from disk
//! and repeat writes don't re-upload content the remote already has.
//!
//! The fetch-lock serializing concurrent misses on the same hash follows
//! this codebase's existing lock-manager shape: a mutex-guarded map from key
//! to a `tokio::sync::Notify`, with callers polling try-then-wait instead of
//! blocking on the mutex itself.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bcache_hash::ContentHash;
use bcache_local::{LocalCas, LocalCasError, PlaceRealization, Realization, Replacement};
use bcache_memo::{
    AddOrGetOptions, AddOrGetResult, ContentAvailability, ContentHashListWithDeterminism,
    MemoError, MemoStore, StrongFingerprint,
};
use bcache_remote::{PinOutcome, PlaceOutcome as RemotePlaceOutcome, PutOutcome as RemotePutOutcome, RemoteCasSession, RemoteError};
use bcache_storage::BlobStorageAdapter;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum TwoLevelError {
    #[error("local CAS error: {0}")]
    Local(#[from] LocalCasError),
    #[error("remote CAS error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("memoization error: {0}")]
    Memo(#[from] MemoError),
}

pub type Result<T> = std::result::Result<T, TwoLevelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Placed,
    NotPlacedContentNotFound,
}

#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    pub hash: ContentHash,
    pub size: u64,
    pub existed_locally: bool,
}

/// The six configuration flags enumerated for this component.
#[derive(Debug, Clone)]
pub struct TwoLevelConfig {
    pub remote_read_only: bool,
    pub always_update_from_remote: bool,
    pub skip_remote_put_if_exists_locally_for: Option<Duration>,
    pub skip_remote_pin_on_put: bool,
    pub batch_remote_pins_on_put: bool,
    pub batch_max: usize,
    pub batch_parallelism: usize,
    pub temp_dir: Option<PathBuf>,
}

impl Default for TwoLevelConfig {
    fn default() -> Self {
        Self {
            remote_read_only: false,
            always_update_from_remote: false,
            skip_remote_put_if_exists_locally_for: Some(Duration::from_secs(60)),
            skip_remote_pin_on_put: false,
            batch_remote_pins_on_put: false,
            batch_max: 64,
            batch_parallelism: 4,
            temp_dir: None,
        }
    }
}

/// Per-hash mutual exclusion for cache-fill misses: the first caller to
/// observe a miss becomes the fetcher; everyone else waits on a `Notify`
/// and re-checks Local CAS once woken, rather than duplicating the fetch.
struct FetchLock {
    in_flight: Mutex<HashMap<ContentHash, Arc<Notify>>>,
}

impl FetchLock {
    fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(guard)` if this call won the race and must perform the
    /// fetch; `None` if another fetch is already in flight for `hash` (the
    /// caller should wait via `wait_for` and retry the cache).
    fn try_start(self: &Arc<Self>, hash: ContentHash) -> Option<FetchGuard> {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if map.contains_key(&hash) {
            None
        } else {
            map.insert(hash, Arc::new(Notify::new()));
            Some(FetchGuard {
                lock: self.clone(),
                hash,
            })
        }
    }

    fn notify_for(&self, hash: &ContentHash) -> Option<Arc<Notify>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).get(hash).cloned()
    }
}

struct FetchGuard {
    lock: Arc<FetchLock>,
    hash: ContentHash,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let mut map = self.lock.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(notify) = map.remove(&self.hash) {
            notify.notify_waiters();
        }
    }
}

/// Session-local elision cache: hashes known to already exist on the
/// remote, expiring after a configured duration so a long-lived session
/// doesn't trust a stale positive forever.
struct ElisionCache {
    entries: DashMap<ContentHash, Instant>,
}

impl ElisionCache {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn insert(&self, hash: ContentHash) {
        self.entries.insert(hash, Instant::now());
    }

    fn contains(&self, hash: &ContentHash, ttl: Duration) -> bool {
        match self.entries.get(hash) {
            Some(at) => at.elapsed() < ttl,
            None => false,
        }
    }
}

pub struct TwoLevelSession<A: BlobStorageAdapter> {
    local: LocalCas,
    remote: RemoteCasSession<A>,
    config: TwoLevelConfig,
    fetch_lock: Arc<FetchLock>,
    elision: ElisionCache,
    /// This session's own view of the memoization store (the "L" in
    /// SPEC_FULL §4.5's memoization path).
    local_memo: MemoStore,
    /// The memoization store backing peers converge on (the "R"). Calling
    /// `R.AddOrGet` first, then feeding its result into `L.AddOrGet`, is how
    /// a local memo entry is kept from diverging from what the remote side
    /// has already published.
    shared_memo: MemoStore,
}

impl<A: BlobStorageAdapter> TwoLevelSession<A> {
    pub fn new(local: LocalCas, remote: RemoteCasSession<A>, config: TwoLevelConfig) -> Self {
        Self {
            local,
            remote,
            config,
            fetch_lock: Arc::new(FetchLock::new()),
            elision: ElisionCache::new(),
            local_memo: MemoStore::new(),
            shared_memo: MemoStore::new(),
        }
    }

    /// Read path step 3: ingest from R into L, via a staging directory when
    /// configured (place-then-move) or a direct pipe otherwise.
    fn ingest_from_remote(&self, hash: &ContentHash) -> Result<bool> {
        if let Some(temp_dir) = &self.config.temp_dir {
            std::fs::create_dir_all(temp_dir)?;
            let staging = temp_dir.join(format!("{}.tmp", hash.full_hex()));
            let (outcome, _timings) = self.remote.place_file(hash, &staging, 0)?;
            match outcome {
                RemotePlaceOutcome::NotPlacedContentNotFound => Ok(false),
                RemotePlaceOutcome::Placed { .. } => {
                    self.local.put_file(&staging, Realization::Move)?;
                    Ok(true)
                }
            }
        } else {
            match self.remote.open_stream(hash, 0)? {
                None => Ok(false),
                Some((mut reader, _len)) => {
                    self.local.put_stream(&mut reader)?;
                    Ok(true)
                }
            }
        }
    }

    fn fill_from_remote(&self, hash: &ContentHash) -> Result<bool> {
        if self.local.contains(hash) {
            return Ok(true);
        }
        let guard = self.fetch_lock.try_start(*hash);
        match guard {
            Some(_guard) => {
                let found = self.ingest_from_remote(hash)?;
                if found {
                    self.elision.insert(*hash);
                }
                Ok(found || self.local.contains(hash))
            }
            None => {
                if let Some(notify) = self.fetch_lock.notify_for(hash) {
                    // Blocking wait is acceptable here: this crate exposes a
                    // synchronous API and the fetch in flight always
                    // completes (success or error) and drops its guard.
                    futures_lite_block_on(notify.notified());
                }
                Ok(self.local.contains(hash))
            }
        }
    }

    /// Open a readable stream for `hash`, falling back to the remote on a
    /// local miss and promoting the content into Local CAS before serving
    /// it, so later reads hit Local CAS directly.
    pub fn open_stream(&self, hash: &ContentHash) -> Result<Option<(Box<dyn Read + Send>, u64)>> {
        if self.config.always_update_from_remote {
            let _ = self.fill_from_remote(hash);
        }
        if let Some(found) = self.local.open_stream(hash)? {
            return Ok(Some(found));
        }
        if !self.fill_from_remote(hash)? {
            return Ok(None);
        }
        Ok(self.local.open_stream(hash)?)
    }

    pub fn place_file(
        &self,
        hash: &ContentHash,
        dest: &Path,
        replacement: Replacement,
        realization: PlaceRealization,
    ) -> Result<PlaceOutcome> {
        if self.config.always_update_from_remote {
            let _ = self.fill_from_remote(hash);
        }
        if !self.local.contains(hash) && !self.fill_from_remote(hash)? {
            return Ok(PlaceOutcome::NotPlacedContentNotFound);
        }
        match self.local.place_file(hash, dest, replacement, realization) {
            Ok(bcache_local::PlaceOutcome::Placed) => Ok(PlaceOutcome::Placed),
            Ok(bcache_local::PlaceOutcome::AlreadyExists) => Ok(PlaceOutcome::Placed),
            Ok(bcache_local::PlaceOutcome::Skipped) => Ok(PlaceOutcome::Placed),
            Err(LocalCasError::NotFound(_)) => Ok(PlaceOutcome::NotPlacedContentNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Write path: put to Local CAS first, then replicate to the remote
    /// unless elided by configuration or the elision cache.
    pub fn put_stream<R: Read>(&self, reader: R) -> Result<PutOutcome> {
        let local_outcome = self.local.put_stream(reader)?;
        self.after_local_put(local_outcome)
    }

    pub fn put_file(&self, path: &Path, realization: Realization) -> Result<PutOutcome> {
        let local_outcome = self.local.put_file(path, realization)?;
        self.after_local_put(local_outcome)
    }

    /// Bulk variant of `put_file` for `batch_remote_pins_on_put`: every path
    /// is put to Local CAS first (cheap, already required to learn its
    /// hash), then the remote existence checks for everything that still
    /// needs one are coalesced into chunks of `batch_max` and run with up to
    /// `batch_parallelism` concurrent pins, instead of one round-trip per
    /// file.
    pub fn put_many(&self, paths: &[(PathBuf, Realization)]) -> Result<Vec<PutOutcome>> {
        if !self.config.batch_remote_pins_on_put || self.config.remote_read_only {
            return paths
                .iter()
                .map(|(path, realization)| self.put_file(path, *realization))
                .collect();
        }

        let mut locals = Vec::with_capacity(paths.len());
        for (path, realization) in paths {
            locals.push(self.local.put_file(path, *realization)?);
        }

        let mut needs_pin = Vec::new();
        for local in &locals {
            let skip = local.existed
                && self
                    .config
                    .skip_remote_put_if_exists_locally_for
                    .is_some_and(|ttl| self.elision.contains(&local.hash, ttl));
            if !skip {
                needs_pin.push(local.hash);
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.batch_parallelism.max(1))
            .build()
            .map_err(|e| TwoLevelError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        let mut found = std::collections::HashSet::new();
        for chunk in needs_pin.chunks(self.config.batch_max.max(1)) {
            let results: Vec<(ContentHash, Result<PinOutcome>)> = pool.install(|| {
                use rayon::prelude::*;
                chunk
                    .par_iter()
                    .map(|hash| (*hash, self.remote.pin(hash, 0).map_err(TwoLevelError::from)))
                    .collect()
            });
            for (hash, result) in results {
                if let PinOutcome::Found { .. } = result? {
                    self.elision.insert(hash);
                    found.insert(hash);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(locals.len());
        for local in locals {
            let outcome = PutOutcome {
                hash: local.hash,
                size: local.size,
                existed_locally: local.existed,
            };
            if found.contains(&local.hash) {
                outcomes.push(outcome);
                continue;
            }
            let skip = local.existed
                && self
                    .config
                    .skip_remote_put_if_exists_locally_for
                    .is_some_and(|ttl| self.elision.contains(&local.hash, ttl));
            if skip {
                outcomes.push(outcome);
                continue;
            }
            let (reader, len) = self
                .local
                .open_stream(&local.hash)?
                .expect("content just written to Local CAS must be present");
            self.remote.put_stream(&local.hash, len, reader)?;
            self.elision.insert(local.hash);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn after_local_put(&self, local_outcome: bcache_local::PutOutcome) -> Result<PutOutcome> {
        let hash = local_outcome.hash;
        let outcome = PutOutcome {
            hash,
            size: local_outcome.size,
            existed_locally: local_outcome.existed,
        };

        if self.config.remote_read_only {
            return Ok(outcome);
        }

        if local_outcome.existed {
            if let Some(ttl) = self.config.skip_remote_put_if_exists_locally_for {
                if self.elision.contains(&hash, ttl) {
                    return Ok(outcome);
                }
            }
        }

        if !self.config.skip_remote_pin_on_put {
            if let PinOutcome::Found { .. } = self.remote.pin(&hash, local_outcome.size)? {
                self.elision.insert(hash);
                return Ok(outcome);
            }
        }

        let (reader, len) = self
            .local
            .open_stream(&hash)?
            .expect("content just written to Local CAS must be present");
        match self.remote.put_stream(&hash, len, reader)? {
            RemotePutOutcome::Created { .. } | RemotePutOutcome::AlreadyExists { .. } => {
                self.elision.insert(hash);
            }
        }
        Ok(outcome)
    }

    /// SPEC_FULL §4.5 memoization path: `remote_read_only` sessions only
    /// ever touch the local memo store; otherwise `R.add_or_get` runs
    /// first and its result (whichever value it converges on) is fed as
    /// the candidate value into `L.add_or_get`, so a local memo entry can
    /// never diverge from what a concurrent peer already published to R.
    pub fn add_or_get(
        &self,
        fp: &StrongFingerprint,
        new_value: ContentHashListWithDeterminism,
        content: &dyn ContentAvailability,
        options: AddOrGetOptions,
    ) -> Result<AddOrGetResult> {
        if self.config.remote_read_only {
            return Ok(self.local_memo.add_or_get(fp, new_value, content, options)?);
        }

        let shared_result = self.shared_memo.add_or_get(fp, new_value, content, options)?;
        let value_for_local = match &shared_result {
            AddOrGetResult::Added { value, .. } => value.clone(),
            AddOrGetResult::Superseded { value, .. } => value.clone(),
        };
        Ok(self.local_memo.add_or_get(fp, value_for_local, content, options)?)
    }

    pub fn local(&self) -> &LocalCas {
        &self.local
    }

    pub fn remote(&self) -> &RemoteCasSession<A> {
        &self.remote
    }
}

/// A value is still available without an explicit pin if this session
/// already has it locally; otherwise fall back to a remote existence check
/// (a no-cost `pin`, not a full download) before concluding it's gone.
impl<A: BlobStorageAdapter> ContentAvailability for TwoLevelSession<A> {
    fn ensure_content_available(&self, hashes: &[ContentHash]) -> bool {
        hashes.iter().all(|hash| {
            self.local.contains(hash)
                || matches!(self.remote.pin(hash, 0), Ok(PinOutcome::Found { .. }))
        })
    }
}

/// Blocks the current thread until `fut` resolves, without pulling in a
/// full async runtime dependency for what is, in practice, a short wait on
/// a `Notify` that another in-process fetch will always eventually signal.
fn futures_lite_block_on(fut: impl std::future::Future<Output = ()>) {
    let rt = tokio::runtime::Handle::try_current();
    match rt {
        Ok(handle) => {
            tokio::task::block_in_place(|| handle.block_on(fut));
        }
        Err(_) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build fallback runtime for fetch-lock wait");
            rt.block_on(fut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache_storage::LocalFsAdapter;
    use tempfile::TempDir;

    fn session() -> (TempDir, TempDir, TwoLevelSession<LocalFsAdapter>) {
        let local_dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let local = LocalCas::open(local_dir.path()).unwrap();
        let adapter = LocalFsAdapter::new(remote_dir.path()).unwrap();
        let remote = RemoteCasSession::new(adapter);
        let session = TwoLevelSession::new(local, remote, TwoLevelConfig::default());
        (local_dir, remote_dir, session)
    }

    #[test]
    fn put_then_read_serves_from_local() {
        let (_l, _r, session) = session();
        let outcome = session.put_stream(&b"hello"[..]).unwrap();
        assert!(!outcome.existed_locally);
        let (mut reader, len) = session.open_stream(&outcome.hash).unwrap().unwrap();
        assert_eq!(len, 5);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn put_replicates_to_remote() {
        let (_l, _r, session) = session();
        let outcome = session.put_stream(&b"replicated"[..]).unwrap();
        let pin = session.remote().pin(&outcome.hash, outcome.size).unwrap();
        assert_eq!(pin, PinOutcome::Found { size: outcome.size });
    }

    #[test]
    fn read_falls_back_to_remote_and_promotes_locally() {
        let (_l, _r, session) = session();
        let (hash, _) = session.remote().put_unhashed(b"remote-only").unwrap();
        assert!(!session.local().contains(&hash));

        let (mut reader, len) = session.open_stream(&hash).unwrap().unwrap();
        assert_eq!(len, 11);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"remote-only");
        assert!(session.local().contains(&hash));
    }

    #[test]
    fn remote_read_only_put_skips_replication() {
        let local_dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let local = LocalCas::open(local_dir.path()).unwrap();
        let adapter = LocalFsAdapter::new(remote_dir.path()).unwrap();
        let remote = RemoteCasSession::new(adapter);
        let config = TwoLevelConfig {
            remote_read_only: true,
            ..Default::default()
        };
        let session = TwoLevelSession::new(local, remote, config);
        let outcome = session.put_stream(&b"local-only"[..]).unwrap();
        assert_eq!(
            session.remote().pin(&outcome.hash, outcome.size).unwrap(),
            PinOutcome::NotFound
        );
    }

    #[test]
    fn put_many_batches_remote_pins() {
        let local_dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let local = LocalCas::open(local_dir.path()).unwrap();
        let adapter = LocalFsAdapter::new(remote_dir.path()).unwrap();
        let remote = RemoteCasSession::new(adapter);
        let config = TwoLevelConfig {
            batch_remote_pins_on_put: true,
            batch_max: 2,
            batch_parallelism: 2,
            ..Default::default()
        };
        let session = TwoLevelSession::new(local, remote, config);

        let src_dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..5 {
            let path = src_dir.path().join(format!("f{i}"));
            std::fs::write(&path, format!("content-{i}")).unwrap();
            paths.push((path, Realization::Copy));
        }

        let outcomes = session.put_many(&paths).unwrap();
        assert_eq!(outcomes.len(), 5);
        for outcome in &outcomes {
            assert_eq!(
                session.remote().pin(&outcome.hash, outcome.size).unwrap(),
                PinOutcome::Found { size: outcome.size }
            );
        }
    }

    fn fingerprint(seed: u8) -> StrongFingerprint {
        StrongFingerprint {
            weak: bcache_memo::WeakFingerprint([seed; 32]),
            selector: bcache_memo::Selector(vec![seed]),
        }
    }

    fn memo_value(byte: u8) -> ContentHashListWithDeterminism {
        ContentHashListWithDeterminism {
            hashes: vec![ContentHash::from_blake3(blake3::hash(&[byte]))],
            determinism: bcache_memo::Determinism::None,
        }
    }

    /// Stand-in `ContentAvailability` for tests that exercise `add_or_get`'s
    /// composition rather than a real store's eviction state.
    struct AlwaysAvailable;
    impl ContentAvailability for AlwaysAvailable {
        fn ensure_content_available(&self, _hashes: &[ContentHash]) -> bool {
            true
        }
    }

    #[test]
    fn add_or_get_converges_shared_result_into_local_store() {
        let (_l, _r, session) = session();
        let fp = fingerprint(9);

        let first = session
            .add_or_get(&fp, memo_value(1), &AlwaysAvailable, AddOrGetOptions::default())
            .unwrap();
        assert!(matches!(first, AddOrGetResult::Added { .. }));

        // A second add_or_get for the same fingerprint with a different
        // candidate value must converge on the value the shared store
        // already holds, rather than overwriting it with the new one.
        let second = session
            .add_or_get(&fp, memo_value(2), &AlwaysAvailable, AddOrGetOptions::default())
            .unwrap();
        match second {
            AddOrGetResult::Superseded { value, .. } => assert_eq!(value, memo_value(1)),
            other => panic!("expected Superseded, got {other:?}"),
        }
    }

    #[test]
    fn remote_read_only_add_or_get_never_touches_shared_store() {
        let local_dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let local = LocalCas::open(local_dir.path()).unwrap();
        let adapter = LocalFsAdapter::new(remote_dir.path()).unwrap();
        let remote = RemoteCasSession::new(adapter);
        let config = TwoLevelConfig {
            remote_read_only: true,
            ..Default::default()
        };
        let session = TwoLevelSession::new(local, remote, config);
        let fp = fingerprint(11);

        let result = session
            .add_or_get(&fp, memo_value(3), &AlwaysAvailable, AddOrGetOptions::default())
            .unwrap();
        assert!(matches!(result, AddOrGetResult::Added { .. }));

        // Only the local store should hold this entry; the shared store
        // was never consulted.
        let (shared_value, _, _) = session.shared_memo.get(&fp, true);
        assert!(shared_value.is_none());
        let (local_value, _, _) = session.local_memo.get(&fp, true);
        assert_eq!(local_value, Some(memo_value(3)));
    }
}
