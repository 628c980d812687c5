//! Master Election (core component 4.7): a single well-known lease blob
//! that at most one participant holds at a time, realized on top of the
//! Blob Storage Adapter's conditional-write primitive rather than any
//! distributed-consensus machinery.
//!
//! The process-wide mutex guarding a lease's `read_modify_write` follows
//! this codebase's lock-manager pattern (a mutex-guarded map from key to
//! per-key lock state) so two local election clients sharing the same
//! lease path in tests serialize the same way two threads in the daemon
//! serialize on a path lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bcache_storage::{read_modify_write, BlobStorageAdapter, ObjectPath, RetryPolicy, StorageError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, MasterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterLease {
    pub master: Option<String>,
    pub creation: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl Default for MasterLease {
    /// No participant has ever held the lease: already expired, so the
    /// first `get_role` call always wins it outright.
    fn default() -> Self {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).expect("unix epoch is representable");
        Self {
            master: None,
            creation: epoch,
            last_update: epoch,
            expiry: epoch,
        }
    }
}

static LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    LOCKS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

pub struct MasterElection<A: BlobStorageAdapter> {
    adapter: A,
    path: ObjectPath,
    me: String,
    lease_expiry_time: Duration,
    retry: RetryPolicy,
}

impl<A: BlobStorageAdapter> MasterElection<A> {
    pub fn new(adapter: A, path: ObjectPath, me: impl Into<String>, lease_expiry_time: Duration) -> Self {
        Self {
            adapter,
            path,
            me: me.into(),
            lease_expiry_time,
            retry: RetryPolicy::default(),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let arc = lock_for(&self.path.to_object_name());
        let _guard = arc.lock().unwrap_or_else(|p| p.into_inner());
        f()
    }

    /// See SPEC_FULL §4.7: attempt to extend or acquire the lease for `me`.
    /// Returns the resulting `(master, role, expiry)` as observed after the
    /// attempt, whether or not this call actually changed anything.
    pub fn get_role(&self, eligible: bool, shutting_down: bool) -> Result<(Option<String>, Role, DateTime<Utc>)> {
        let me = self.me.clone();
        let lease_expiry_time = self.lease_expiry_time;
        let result = self.with_lock(|| {
            let now = Utc::now();
            read_modify_write(
                &self.adapter,
                &self.path,
                &self.retry,
                MasterLease::default,
                |old: MasterLease| {
                    if !eligible || shutting_down {
                        return (old.clone(), old, false);
                    }
                    let expired = now >= old.expiry;
                    let owned_by_me = old.master.as_deref() == Some(me.as_str());
                    if expired || owned_by_me {
                        let creation = if owned_by_me { old.creation } else { now };
                        let next = MasterLease {
                            master: Some(me.clone()),
                            creation,
                            last_update: now,
                            expiry: now + lease_expiry_time,
                        };
                        (next.clone(), next, true)
                    } else {
                        (old.clone(), old, false)
                    }
                },
            )
        })?;

        let now = Utc::now();
        if now >= result.expiry {
            Ok((None, Role::Worker, result.expiry))
        } else {
            let role = if result.master.as_deref() == Some(self.me.as_str()) {
                Role::Master
            } else {
                Role::Worker
            };
            Ok((result.master, role, result.expiry))
        }
    }

    /// Give up the lease early if this participant currently holds it and
    /// it has not already expired. A no-op otherwise.
    pub fn release_if_necessary(&self, eligible: bool) -> Result<()> {
        if !eligible {
            return Ok(());
        }
        let me = self.me.clone();
        self.with_lock(|| {
            let now = Utc::now();
            read_modify_write(
                &self.adapter,
                &self.path,
                &self.retry,
                MasterLease::default,
                |old: MasterLease| {
                    let owned_by_me = old.master.as_deref() == Some(me.as_str());
                    let expired = now >= old.expiry;
                    if !owned_by_me || expired {
                        (old.clone(), (), false)
                    } else {
                        let next = MasterLease {
                            expiry: now,
                            last_update: now,
                            ..old
                        };
                        (next, (), true)
                    }
                },
            )
        })?;
        Ok(())
    }
}
