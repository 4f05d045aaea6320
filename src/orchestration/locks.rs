//! File lock manager: exclusive, lease-based claims on resource keys.
//!
//! Acquisition is all-or-nothing and never blocks: either every
//! requested key is granted under one lease token, or none is and the
//! conflicting keys are reported so the caller can move on. Expired
//! leases are reclaimed lazily before every acquisition attempt, so a
//! crashed holder forfeits its keys after the timeout without any
//! background task.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::flog_debug;
use crate::orchestration::worker::WorkerId;

/// Opaque handle to a granted set of locks. Releasing the token frees
/// every key it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An active claim on a single resource key.
#[derive(Debug, Clone)]
struct LockEntry {
    holder: WorkerId,
    token: LeaseToken,
    #[allow(dead_code)]
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Outcome of an acquisition attempt. `Conflict` is an expected,
/// frequent value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every key was granted under this lease.
    Acquired(LeaseToken),
    /// At least one key is held by another worker; nothing was taken.
    Conflict(Vec<PathBuf>),
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }

    pub fn token(&self) -> Option<LeaseToken> {
        match self {
            AcquireOutcome::Acquired(token) => Some(*token),
            AcquireOutcome::Conflict(_) => None,
        }
    }
}

/// Grants and revokes exclusive locks on resource keys.
#[derive(Default)]
pub struct LockManager {
    locks: HashMap<PathBuf, LockEntry>,
    leases: HashMap<LeaseToken, BTreeSet<PathBuf>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically attempt to acquire every key in the set.
    ///
    /// Non-blocking: returns immediately. Expired locks are reclaimed
    /// first. If any key is held by a different active holder the whole
    /// attempt fails and no partial locks are taken. An empty key set
    /// succeeds trivially (queue-only scheduling).
    pub fn try_acquire(
        &mut self,
        keys: &BTreeSet<PathBuf>,
        holder: WorkerId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> AcquireOutcome {
        self.reclaim_expired(now);

        let conflicts: Vec<PathBuf> = keys
            .iter()
            .filter(|key| {
                self.locks
                    .get(*key)
                    .map(|entry| entry.holder != holder)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            flog_debug!(
                "lock conflict holder={} keys={:?}",
                holder,
                conflicts
            );
            return AcquireOutcome::Conflict(conflicts);
        }

        let token = LeaseToken::new();
        for key in keys {
            // Re-acquisition by the same holder folds the key into the
            // new lease.
            if let Some(old) = self.locks.get(key) {
                let old_token = old.token;
                if let Some(set) = self.leases.get_mut(&old_token) {
                    set.remove(key);
                }
            }
            self.locks.insert(
                key.clone(),
                LockEntry {
                    holder,
                    token,
                    acquired_at: now,
                    expires_at: now + timeout,
                },
            );
        }
        self.leases.insert(token, keys.clone());
        flog_debug!("lock acquired holder={} token={} keys={}", holder, token, keys.len());
        AcquireOutcome::Acquired(token)
    }

    /// Free every key covered by the lease. Idempotent: releasing an
    /// unknown or already-released token is a no-op.
    pub fn release(&mut self, token: &LeaseToken) {
        if let Some(keys) = self.leases.remove(token) {
            for key in keys {
                if let Some(entry) = self.locks.get(&key) {
                    if entry.token == *token {
                        self.locks.remove(&key);
                    }
                }
            }
            flog_debug!("lock released token={}", token);
        }
    }

    /// Free any lock whose lease has expired. Called opportunistically
    /// before every acquisition attempt and at the top of each tick.
    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<PathBuf> = self
            .locks
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.locks.remove(&key) {
                if let Some(set) = self.leases.get_mut(&entry.token) {
                    set.remove(&key);
                    if set.is_empty() {
                        self.leases.remove(&entry.token);
                    }
                }
                flog_debug!("lock reclaimed key={} holder={}", key.display(), entry.holder);
            }
        }
    }

    /// The worker currently holding an active lock on the key, if any.
    pub fn active_holder(&self, key: &Path, now: DateTime<Utc>) -> Option<WorkerId> {
        self.locks
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder)
    }

    pub fn is_locked(&self, key: &Path, now: DateTime<Utc>) -> bool {
        self.active_holder(key, now).is_some()
    }

    /// Number of keys currently locked (expired entries included until
    /// the next reclamation).
    pub fn locked_key_count(&self) -> usize {
        self.locks.len()
    }
}
