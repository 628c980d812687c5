//! Local CAS (core component 4.3): an on-disk content store keyed by hash,
//! with last-access metadata for GC and a directory lock serializing process
//! ownership of the CAS root.
//!
//! Storage layout and the atomic-write idiom are carried over from this
//! codebase's existing CAS store: a 3-level hex fan-out, self-describing
//! `hash_size.bin` filenames, and temp-file-then-rename writes that tolerate
//! a racing writer of identical content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fs2::FileExt;
use thiserror::Error;

use bcache_hash::{blob_path, ContentHash, HashType, TeeHasher};

#[derive(Debug, Error)]
pub enum LocalCasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("content not found: {0}")]
    NotFound(ContentHash),
    #[error("destination already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("CAS root {0:?} is already owned by another process")]
    RootLocked(PathBuf),
}

pub type Result<T> = std::result::Result<T, LocalCasError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realization {
    Copy,
    Move,
    HardLinkOrCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceRealization {
    Copy,
    HardLink,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement {
    ReplaceExisting,
    SkipIfExists,
    FailIfExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Placed,
    AlreadyExists,
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    pub hash: ContentHash,
    pub size: u64,
    pub existed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PinInfo {
    pub size: u64,
    pub last_access_nanos: u128,
}

/// Holds an exclusive `flock` on `<root>/.lock` for the lifetime of a
/// `LocalCas`, following the polling-with-timeout shape this codebase's
/// manifest registry uses for its own lock file.
struct DirLock {
    _file: File,
}

impl DirLock {
    fn acquire(root: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = root.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        let start = std::time::Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { _file: file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(LocalCasError::RootLocked(root.to_path_buf()));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// On-disk content-addressed store. One process may hold a given CAS root at
/// a time (`DirLock`); last-access metadata lives in an in-memory map backed
/// by an append-only journal file, compacted on open.
pub struct LocalCas {
    root: PathBuf,
    _lock: DirLock,
    last_access: DashMap<ContentHash, u128>,
    parallel_hash_boundary: u64,
}

const JOURNAL_NAME: &str = "last_access.journal";

impl LocalCas {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(root, Duration::from_secs(5), 1 << 20)
    }

    pub fn open_with(
        root: impl Into<PathBuf>,
        lock_timeout: Duration,
        parallel_hash_boundary: u64,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let lock = DirLock::acquire(&root, lock_timeout)?;
        let last_access = Self::load_journal(&root)?;
        Ok(Self {
            root,
            _lock: lock,
            last_access,
            parallel_hash_boundary,
        })
    }

    fn load_journal(root: &Path) -> Result<DashMap<ContentHash, u128>> {
        let map = DashMap::new();
        let path = root.join(JOURNAL_NAME);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(map),
            Err(e) => return Err(e.into()),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some((hex, nanos)) = line.split_once(' ') {
                if let (Ok(bytes), Ok(nanos)) = (hex::decode(hex), nanos.parse::<u128>()) {
                    if bytes.len() == 32 {
                        let mut arr = [0u8; 32];
                        arr.copy_from_slice(&bytes);
                        let hash = ContentHash {
                            algo: HashType::Blake3,
                            bytes: arr,
                        };
                        let entry = map.entry(hash).or_insert(0);
                        if nanos > *entry {
                            *entry = nanos;
                        }
                    }
                }
            }
        }
        Ok(map)
    }

    fn record_access(&self, hash: ContentHash, nanos: u128) -> Result<()> {
        let mut entry = self.last_access.entry(hash).or_insert(0);
        if nanos > *entry {
            *entry = nanos;
        }
        drop(entry);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(JOURNAL_NAME))?;
        writeln!(f, "{} {}", hash.full_hex(), nanos)?;
        Ok(())
    }

    fn blob_file_path(&self, hash: &ContentHash, size: u64) -> PathBuf {
        let bp = blob_path(hash, size);
        self.root.join(bp.folder).join(bp.relative_path)
    }

    /// Find the on-disk path for a hash without knowing its size up front,
    /// by scanning the shard directory for a `<hash>_<size>.bin` entry.
    fn find_blob_path(&self, hash: &ContentHash) -> Option<(PathBuf, u64)> {
        let hex = hash.full_hex();
        let dir = self.root.join("blake3").join(&hex[0..2]).join(&hex[2..4]);
        let entries = fs::read_dir(&dir).ok()?;
        let prefix = format!("{hex}_");
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(&prefix) {
                let size_str = rest.strip_suffix(".bin").unwrap_or(rest);
                if let Ok(size) = size_str.parse::<u64>() {
                    return Some((dir.join(name.as_ref()), size));
                }
            }
        }
        None
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.find_blob_path(hash).is_some()
    }

    /// Hash while storing; on hash collision with existing content, keep the
    /// existing blob (content-addressed stores never need to rewrite).
    pub fn put_stream<R: Read>(&self, mut reader: R) -> Result<PutOutcome> {
        let tmp_dir = self.root.join(".tmp");
        fs::create_dir_all(&tmp_dir)?;
        let tmp_path = tmp_dir.join(format!(
            "put.{}.{:?}.tmp",
            std::process::id(),
            std::thread::current().id()
        ));
        let tmp_file = File::create(&tmp_path)?;
        let mut tee = TeeHasher::new(tmp_file, self.parallel_hash_boundary);
        io::copy(&mut reader, &mut tee)?;
        let (hash, size, mut tmp_file) = tee.finalize();
        tmp_file.sync_all()?;
        drop(tmp_file);

        let final_path = self.blob_file_path(&hash, size);
        let existed = final_path.exists();
        if existed {
            let _ = fs::remove_file(&tmp_path);
        } else {
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(e) = fs::rename(&tmp_path, &final_path) {
                let _ = fs::remove_file(&tmp_path);
                if !final_path.exists() {
                    return Err(e.into());
                }
            }
        }
        self.record_access(hash, now_nanos())?;
        Ok(PutOutcome { hash, size, existed })
    }

    pub fn put_file(&self, path: &Path, realization: Realization) -> Result<PutOutcome> {
        match realization {
            Realization::Copy => {
                let file = File::open(path)?;
                self.put_stream(file)
            }
            Realization::Move => {
                // Hash first (read-only), then try a same-volume rename
                // straight to the content-addressed path: no tmp file, no
                // second copy of the bytes. Only fall back to put_stream's
                // copy-then-delete on a genuine cross-device error.
                let (hash, size) = {
                    let file = File::open(path)?;
                    bcache_hash::hash_stream(HashType::Blake3, file, self.parallel_hash_boundary)?
                };
                let final_path = self.blob_file_path(&hash, size);
                let existed = final_path.exists();
                if existed {
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) => tracing::warn!(error = %e, "failed to remove source after move"),
                    }
                    self.record_access(hash, now_nanos())?;
                    return Ok(PutOutcome { hash, size, existed });
                }
                if let Some(parent) = final_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                match fs::rename(path, &final_path) {
                    Ok(()) => {
                        self.record_access(hash, now_nanos())?;
                        Ok(PutOutcome { hash, size, existed: false })
                    }
                    Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                        let file = File::open(path)?;
                        let outcome = self.put_stream(file)?;
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) => tracing::warn!(error = %e, "failed to remove source after move"),
                        }
                        Ok(outcome)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Realization::HardLinkOrCopy => {
                let data = fs::read(path)?;
                let hash = {
                    let mut hasher = blake3::Hasher::new();
                    if data.len() as u64 >= self.parallel_hash_boundary {
                        hasher.update_rayon(&data);
                    } else {
                        hasher.update(&data);
                    }
                    ContentHash::from_blake3(hasher.finalize())
                };
                let size = data.len() as u64;
                let final_path = self.blob_file_path(&hash, size);
                let existed = final_path.exists();
                if !existed {
                    if let Some(parent) = final_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if fs::hard_link(path, &final_path).is_err() {
                        fs::write(&final_path, &data)?;
                    }
                }
                self.record_access(hash, now_nanos())?;
                Ok(PutOutcome { hash, size, existed })
            }
        }
    }

    pub fn pin(&self, hash: &ContentHash) -> Result<Option<PinInfo>> {
        match self.find_blob_path(hash) {
            Some((_, size)) => {
                let nanos = now_nanos();
                self.record_access(*hash, nanos)?;
                Ok(Some(PinInfo {
                    size,
                    last_access_nanos: nanos,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn open_stream(&self, hash: &ContentHash) -> Result<Option<(Box<dyn Read + Send>, u64)>> {
        match self.find_blob_path(hash) {
            Some((path, size)) => {
                self.record_access(*hash, now_nanos())?;
                let file = File::open(path)?;
                Ok(Some((Box::new(BufReader::new(file)), size)))
            }
            None => Ok(None),
        }
    }

    pub fn place_file(
        &self,
        hash: &ContentHash,
        dest: &Path,
        replacement: Replacement,
        realization: PlaceRealization,
    ) -> Result<PlaceOutcome> {
        let Some((source, _size)) = self.find_blob_path(hash) else {
            return Err(LocalCasError::NotFound(*hash));
        };

        if dest.exists() {
            match replacement {
                Replacement::FailIfExists => return Ok(PlaceOutcome::AlreadyExists),
                Replacement::SkipIfExists => return Ok(PlaceOutcome::Skipped),
                Replacement::ReplaceExisting => fs::remove_file(dest)?,
            }
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match realization {
            PlaceRealization::Copy => {
                fs::copy(&source, dest)?;
            }
            PlaceRealization::HardLink => {
                fs::hard_link(&source, dest)?;
            }
            PlaceRealization::Any => {
                if fs::hard_link(&source, dest).is_err() {
                    fs::copy(&source, dest)?;
                }
            }
        }
        self.record_access(*hash, now_nanos())?;
        Ok(PlaceOutcome::Placed)
    }

    /// Evict blobs whose last access is older than `touch_threshold`, oldest
    /// first. Blobs younger than the threshold are never evicted, even if
    /// the caller wants more space freed.
    pub fn gc(&self, touch_threshold: Duration) -> Result<Vec<ContentHash>> {
        let cutoff = now_nanos().saturating_sub(touch_threshold.as_nanos());
        let mut candidates: Vec<(ContentHash, u128)> = self
            .last_access
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .filter(|(_, last)| *last < cutoff)
            .collect();
        candidates.sort_by_key(|(_, last)| *last);

        let mut evicted = Vec::new();
        for (hash, _) in candidates {
            if let Some((path, _)) = self.find_blob_path(&hash) {
                fs::remove_file(&path)?;
                self.last_access.remove(&hash);
                evicted.push(hash);
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalCas) {
        let dir = TempDir::new().unwrap();
        let cas = LocalCas::open(dir.path()).unwrap();
        (dir, cas)
    }

    #[test]
    fn put_then_open_round_trips() {
        let (_d, cas) = store();
        let outcome = cas.put_stream(&b"hello world"[..]).unwrap();
        assert!(!outcome.existed);
        let (mut reader, size) = cas.open_stream(&outcome.hash).unwrap().unwrap();
        assert_eq!(size, 11);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn duplicate_put_reports_existed() {
        let (_d, cas) = store();
        let a = cas.put_stream(&b"dup"[..]).unwrap();
        let b = cas.put_stream(&b"dup"[..]).unwrap();
        assert!(!a.existed);
        assert!(b.existed);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn second_lock_acquisition_fails_within_timeout() {
        let dir = TempDir::new().unwrap();
        let _first = LocalCas::open(dir.path()).unwrap();
        let second = LocalCas::open_with(dir.path(), Duration::from_millis(100), 1 << 20);
        assert!(matches!(second, Err(LocalCasError::RootLocked(_))));
    }

    #[test]
    fn place_file_fail_if_exists() {
        let (_d, cas) = store();
        let outcome = cas.put_stream(&b"content"[..]).unwrap();
        let target_dir = TempDir::new().unwrap();
        let dest = target_dir.path().join("out.bin");
        fs::write(&dest, b"existing").unwrap();
        let result = cas
            .place_file(&outcome.hash, &dest, Replacement::FailIfExists, PlaceRealization::Copy)
            .unwrap();
        assert_eq!(result, PlaceOutcome::AlreadyExists);
    }

    #[test]
    fn gc_respects_touch_threshold() {
        let (_d, cas) = store();
        let outcome = cas.put_stream(&b"young"[..]).unwrap();
        let evicted = cas.gc(Duration::from_secs(3600)).unwrap();
        assert!(evicted.is_empty());
        assert!(cas.contains(&outcome.hash));
    }

    #[test]
    fn contains_reflects_store_state() {
        let (_d, cas) = store();
        let outcome = cas.put_stream(&b"present"[..]).unwrap();
        assert!(cas.contains(&outcome.hash));
        let bogus = ContentHash::from_blake3(blake3::hash(b"absent"));
        assert!(!cas.contains(&bogus));
    }
}
