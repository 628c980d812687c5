//! Memoization Store (core component 4.6): maps a build action's strong
//! fingerprint to the content hashes it produced, with optimistic
//! concurrency and a determinism-aware replacement policy.
//!
//! The store is a two-layer structure: an immutable base map loaded once
//! plus a mutable delta overlay merged into the base on an explicit
//! `commit`, mirroring this codebase's manifest store's base-plus-delta
//! split between a bulk-loaded map and an in-memory `DashMap` of recent
//! writes. `replacementToken` is realized as a 64-bit generation counter:
//! every successful CompareExchange increments it, and a presented token
//! must match the entry's current generation or the exchange is rejected.

use std::collections::HashMap;
use std::sync::RwLock;

use bcache_hash::ContentHash;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeakFingerprint(pub [u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongFingerprint {
    pub weak: WeakFingerprint,
    pub selector: Selector,
}

/// Partial order over how authoritative a set of outputs is. `Cache` values
/// compare by rank only; whether one dominates another also depends on
/// `expiry`, checked separately since expiry is a runtime fact, not a fixed
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Determinism {
    None,
    SinglePhaseNonDeterministic,
    Tool,
    Cache { guid: u128, expiry: DateTime<Utc> },
}

impl Determinism {
    fn rank(&self) -> u8 {
        match self {
            Determinism::None => 0,
            Determinism::SinglePhaseNonDeterministic => 1,
            Determinism::Tool => 2,
            Determinism::Cache { .. } => 3,
        }
    }

    pub fn is_single_phase_non_deterministic(&self) -> bool {
        matches!(self, Determinism::SinglePhaseNonDeterministic)
    }

    pub fn is_deterministic_tool(&self) -> bool {
        matches!(self, Determinism::Tool)
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self {
            Determinism::Cache { expiry, .. } => now < *expiry,
            _ => true,
        }
    }

    /// `self` should replace `other` iff `self` is strictly higher in the
    /// partial order and, for a `Cache` tag, still unexpired.
    pub fn strictly_dominates(&self, other: &Determinism, now: DateTime<Utc>) -> bool {
        self.is_live(now) && self.rank() > other.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashListWithDeterminism {
    pub hashes: Vec<ContentHash>,
    pub determinism: Determinism,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoEntry {
    pub fingerprint: StrongFingerprint,
    pub value: ContentHashListWithDeterminism,
    pub generation: u64,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementCheckPolicy {
    ReplaceAlways,
    ReplaceNever,
    AllowPinElision,
    PinAlways,
}

/// Capability a caller passes to `add_or_get` so the store can verify an
/// existing entry's content is still retrievable before deciding whether a
/// new value must be published. Grounded on the Two-Level Cache Session's
/// `contains`/pin-style checks (§4.5) without depending on that crate.
pub trait ContentAvailability {
    fn ensure_content_available(&self, hashes: &[ContentHash]) -> bool;
}

#[derive(Debug, Error)]
pub enum MemoError {
    #[error("determinism mismatch: old.isSinglePhaseNonDeterministic != new.isSinglePhaseNonDeterministic")]
    SinglePhaseMixingError,
    #[error("existing value has deterministic-tool provenance and cannot be silently superseded")]
    InvalidToolDeterminismError,
    #[error("exceeded {0} CompareExchange attempts without converging")]
    RaceExhausted(u32),
}

pub type Result<T> = std::result::Result<T, MemoError>;

#[derive(Debug, Clone)]
pub enum AddOrGetResult {
    /// The presented value (or an existing equal one) is now canonical.
    Added {
        value: ContentHashListWithDeterminism,
        generation: u64,
    },
    /// A pre-existing, non-replaceable value is canonical instead.
    Superseded {
        value: ContentHashListWithDeterminism,
        generation: u64,
    },
}

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Session-scoped options for one `add_or_get` call.
#[derive(Debug, Clone, Copy)]
pub struct AddOrGetOptions {
    pub optimize_writes: bool,
    pub prefer_shared: bool,
    pub replacement_policy: ReplacementCheckPolicy,
    pub max_attempts: u32,
}

impl Default for AddOrGetOptions {
    fn default() -> Self {
        Self {
            optimize_writes: false,
            prefer_shared: true,
            replacement_policy: ReplacementCheckPolicy::AllowPinElision,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Base-plus-delta memoization store. `base` is loaded once (e.g. from a
/// bulk export) and never mutated in place; all writes land in `delta` and
/// are folded into a new base by `commit`.
pub struct MemoStore {
    base: RwLock<HashMap<StrongFingerprint, MemoEntry>>,
    delta: DashMap<StrongFingerprint, MemoEntry>,
}

impl Default for MemoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoStore {
    pub fn new() -> Self {
        Self {
            base: RwLock::new(HashMap::new()),
            delta: DashMap::new(),
        }
    }

    pub fn from_base(base: HashMap<StrongFingerprint, MemoEntry>) -> Self {
        Self {
            base: RwLock::new(base),
            delta: DashMap::new(),
        }
    }

    /// Fold the current delta into the base map and clear it, as a
    /// consistent snapshot point for export or compaction.
    pub fn commit(&self) {
        let mut base = self.base.write().unwrap_or_else(|p| p.into_inner());
        for entry in self.delta.iter() {
            base.insert(entry.key().clone(), entry.value().clone());
        }
        self.delta.clear();
    }

    fn read_entry(&self, fp: &StrongFingerprint) -> Option<MemoEntry> {
        if let Some(entry) = self.delta.get(fp) {
            return Some(entry.clone());
        }
        self.base.read().unwrap_or_else(|p| p.into_inner()).get(fp).cloned()
    }

    /// Read the current value, bumping last-access regardless of whether
    /// this read will later be used to decide a replacement.
    pub fn get(
        &self,
        fp: &StrongFingerprint,
        _prefer_shared: bool,
    ) -> (Option<ContentHashListWithDeterminism>, u64, Source) {
        match self.read_entry(fp) {
            Some(mut entry) => {
                entry.last_access = Utc::now();
                let generation = entry.generation;
                let value = entry.value.clone();
                self.delta.insert(fp.clone(), entry);
                (Some(value), generation, Source::Local)
            }
            None => (None, 0, Source::Local),
        }
    }

    /// Compare-and-swap a fingerprint's value: succeeds only if
    /// `expected_generation` matches the entry's current generation (or the
    /// entry is absent and `expected_generation == 0`).
    fn compare_exchange(
        &self,
        fp: &StrongFingerprint,
        expected_generation: u64,
        new_value: ContentHashListWithDeterminism,
    ) -> bool {
        let current_generation = self.read_entry(fp).map(|e| e.generation).unwrap_or(0);
        if current_generation != expected_generation {
            return false;
        }
        let entry = MemoEntry {
            fingerprint: fp.clone(),
            value: new_value,
            generation: expected_generation + 1,
            last_access: Utc::now(),
        };
        // DashMap entries are independently locked per shard; re-check
        // under the shard lock to close the TOCTOU window between the read
        // above and this insert.
        match self.delta.entry(fp.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().generation != expected_generation {
                    return false;
                }
                occ.insert(entry);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if expected_generation != 0 {
                    return false;
                }
                vac.insert(entry);
                true
            }
        }
    }

    /// `add_or_get` per SPEC_FULL §4.6: converges on a canonical value for
    /// `fp` within `options.max_attempts` CompareExchange attempts.
    pub fn add_or_get(
        &self,
        fp: &StrongFingerprint,
        new_value: ContentHashListWithDeterminism,
        content: &dyn ContentAvailability,
        options: AddOrGetOptions,
    ) -> Result<AddOrGetResult> {
        let now = Utc::now();
        for attempt in 0..options.max_attempts {
            let (old_value, read_token) = if options.optimize_writes && attempt == 0 {
                (None, 0)
            } else {
                let (value, token, _source) = self.get(fp, options.prefer_shared);
                (value, token)
            };

            if let Some(old) = &old_value {
                if old.determinism.is_single_phase_non_deterministic()
                    != new_value.determinism.is_single_phase_non_deterministic()
                {
                    return Err(MemoError::SinglePhaseMixingError);
                }
            }

            let can_replace = match &old_value {
                None => true,
                Some(old) => {
                    if new_value.determinism.strictly_dominates(&old.determinism, now) {
                        true
                    } else {
                        match options.replacement_policy {
                            ReplacementCheckPolicy::ReplaceAlways => true,
                            ReplacementCheckPolicy::ReplaceNever => false,
                            ReplacementCheckPolicy::AllowPinElision
                            | ReplacementCheckPolicy::PinAlways => {
                                !content.ensure_content_available(&old.hashes)
                            }
                        }
                    }
                }
            };

            if can_replace {
                if self.compare_exchange(fp, read_token, new_value.clone()) {
                    return Ok(AddOrGetResult::Added {
                        value: new_value,
                        generation: read_token + 1,
                    });
                }
                continue; // lost the race, retry the loop
            }

            let old = old_value.expect("canReplace=false implies an existing value");
            if new_value == old {
                return Ok(AddOrGetResult::Superseded {
                    value: old,
                    generation: read_token,
                });
            }
            if new_value.determinism.is_deterministic_tool() {
                return Err(MemoError::InvalidToolDeterminismError);
            }
            return Ok(AddOrGetResult::Superseded {
                value: old,
                generation: read_token,
            });
        }
        Err(MemoError::RaceExhausted(options.max_attempts))
    }
}
