//! Lease coordination over the folding workspace
//!
//! Folding a member set is slow and split across many asynchronous steps. A
//! reload, navigation or duplicate tab could spawn a second run over the same
//! durable records and corrupt their invariants, so every run first takes a
//! time-boxed advisory lease and renews it before each unit of work.
//!
//! The underlying store has no native locking primitive, so the lease is a
//! single record transitioned with `compare_and_swap`: of two contexts
//! acquiring near-simultaneously, exactly one CAS wins. An expired lease is
//! treated as abandoned and stolen by the next acquirer - lease loss is a
//! normal, recoverable event, not an exception.

use crate::error::FoldError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LEASE_KEY: &[u8] = b"workspace";

/// The stored lease value
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    token: Uuid,
    /// Unix millis
    expires_at: u64,
}

impl Lease {
    fn valid_at(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Proof of lease ownership. Not cloneable on purpose: one holder per run.
#[derive(Debug, PartialEq, Eq)]
pub struct LeaseToken(Uuid);

fn now_millis() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Lease coordinator backed by a single sled key
#[derive(Clone)]
pub struct LeaseCoordinator {
    tree: sled::Tree,
    duration: Duration,
}

impl LeaseCoordinator {
    pub fn new(tree: sled::Tree, duration: Duration) -> Self {
        Self { tree, duration }
    }

    fn encode(lease: &Lease) -> Result<Vec<u8>, FoldError> {
        Ok(rmp_serde::to_vec(lease)?)
    }

    fn decode(bytes: &[u8]) -> Result<Lease, FoldError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Acquire the lease, stealing it if the stored one has expired.
    ///
    /// Returns `LeaseUnavailable` while another context holds a valid lease.
    pub fn acquire(&self) -> Result<LeaseToken, FoldError> {
        loop {
            let now = now_millis();
            let current = self.tree.get(LEASE_KEY)?;

            if let Some(bytes) = &current {
                let stored = Self::decode(bytes)?;
                if stored.valid_at(now) {
                    debug!(expires_at = stored.expires_at, "Lease held elsewhere");
                    return Err(FoldError::LeaseUnavailable);
                }
                warn!(
                    expired_at = stored.expires_at,
                    "Stealing abandoned lease"
                );
            }

            let lease = Lease {
                token: Uuid::new_v4(),
                expires_at: now + self.duration.as_millis() as u64,
            };
            let new = Self::encode(&lease)?;

            match self
                .tree
                .compare_and_swap(LEASE_KEY, current.as_ref(), Some(new))?
            {
                Ok(()) => {
                    info!(expires_at = lease.expires_at, "Acquired folding lease");
                    return Ok(LeaseToken(lease.token));
                }
                // another acquirer transitioned the lease first; re-read
                Err(_) => continue,
            }
        }
    }

    /// Extend the lease before the next unit of work.
    ///
    /// `LeaseExpired` is a hard stop for the caller: the lease has lapsed or
    /// been stolen, and the workspace may already belong to someone else.
    pub fn renew(&self, token: &LeaseToken) -> Result<(), FoldError> {
        loop {
            let now = now_millis();
            let current = self.tree.get(LEASE_KEY)?.ok_or(FoldError::LeaseExpired)?;
            let stored = Self::decode(&current)?;

            if stored.token != token.0 || !stored.valid_at(now) {
                return Err(FoldError::LeaseExpired);
            }

            let renewed = Lease {
                token: stored.token,
                expires_at: now + self.duration.as_millis() as u64,
            };
            let new = Self::encode(&renewed)?;

            match self
                .tree
                .compare_and_swap(LEASE_KEY, Some(&current), Some(new))?
            {
                Ok(()) => {
                    debug!(expires_at = renewed.expires_at, "Renewed folding lease");
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }

    /// Whether the given token still owns a valid lease. Checked before
    /// every durable write in the folding phase.
    pub fn is_held_by(&self, token: &LeaseToken) -> Result<bool, FoldError> {
        match self.tree.get(LEASE_KEY)? {
            Some(bytes) => {
                let stored = Self::decode(&bytes)?;
                Ok(stored.token == token.0 && stored.valid_at(now_millis()))
            }
            None => Ok(false),
        }
    }

    /// Release the lease if this token still holds it. No-op if the lease
    /// already expired and was reassigned.
    pub fn release(&self, token: LeaseToken) -> Result<(), FoldError> {
        let current = match self.tree.get(LEASE_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(()),
        };
        let stored = Self::decode(&current)?;
        if stored.token != token.0 {
            debug!("Lease already reassigned; release is a no-op");
            return Ok(());
        }

        match self
            .tree
            .compare_and_swap(LEASE_KEY, Some(&current), None::<&[u8]>)?
        {
            Ok(()) => info!("Released folding lease"),
            Err(_) => debug!("Lease transitioned during release; nothing to do"),
        }
        Ok(())
    }

    /// Clear the lease unconditionally. Used by full store reset.
    pub fn reset(&self) -> Result<(), FoldError> {
        self.tree.remove(LEASE_KEY)?;
        Ok(())
    }
}
