//! Durable fold records, one per proof category
//!
//! A record is created by the first successful fold and then accumulates:
//! every append replaces the compressed proof, bumps the fold count and adds
//! the member to the included set. `num_folds == included.len()` holds after
//! every operation. Obfuscation is terminal for proof content.
//!
//! Mutations go through `compare_and_swap` loops so a read-modify-write is
//! never observably interleaved by another writer in this process.
//! Cross-context exclusion is the lease coordinator's job.

use crate::error::FoldError;
use crate::registry::Member;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Proof category. Each category folds an independent membership set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Attendee,
    Speaker,
    Talk,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Attendee, Category::Speaker, Category::Talk];

    /// Stable storage key for this category
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Attendee => "attendee",
            Category::Speaker => "speaker",
            Category::Talk => "talk",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = FoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attendee" => Ok(Category::Attendee),
            "speaker" => Ok(Category::Speaker),
            "talk" => Ok(Category::Talk),
            other => Err(FoldError::Config(format!("Unknown category: {}", other))),
        }
    }
}

/// One persistent fold record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldRecord {
    /// Current proof, compressed
    pub proof: Vec<u8>,
    /// Number of memberships folded in so far
    pub num_folds: u32,
    /// Advisory flag used by upload flows; the engine never branches on it
    pub locked: bool,
    /// Whether the chaff step has been applied. Terminal for proof content.
    pub obfuscated: bool,
    /// Member identifiers folded in, in fold order
    pub included: Vec<String>,
    /// When the record was created (Unix millis)
    pub created_at: u64,
    /// Last mutation (Unix millis)
    pub updated_at: u64,
}

/// Progress state derivable from durable data alone, without any
/// orchestrator internals. A non-obfuscated record can be finalized at
/// any time, so "in progress" and "ready to finalize" are the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldStatus {
    NotStarted,
    InProgress { num_folds: u32 },
    Finalized { num_folds: u32 },
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Fold record storage backed by a sled tree keyed by category
#[derive(Clone)]
pub struct FoldRecordStore {
    tree: sled::Tree,
}

impl FoldRecordStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Get a record, or None if the category has not been folded yet.
    /// Absence is a normal state, not an error.
    pub fn get_record(&self, category: Category) -> Result<Option<FoldRecord>, FoldError> {
        match self.tree.get(category.as_str())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Create the record for a category from its first fold
    pub fn create_record(
        &self,
        category: Category,
        proof: &[u8],
        member_id: &str,
    ) -> Result<FoldRecord, FoldError> {
        let now = now_millis();
        let record = FoldRecord {
            proof: proof.to_vec(),
            num_folds: 1,
            locked: false,
            obfuscated: false,
            included: vec![member_id.to_string()],
            created_at: now,
            updated_at: now,
        };
        let bytes = rmp_serde::to_vec(&record)?;

        let prev =
            self.tree
                .compare_and_swap(category.as_str(), None::<&[u8]>, Some(bytes))?;
        if prev.is_err() {
            return Err(FoldError::RecordExists(category));
        }

        info!(%category, member = member_id, "Created fold record");
        Ok(record)
    }

    /// Replace the proof and fold one more member in
    pub fn append_fold(
        &self,
        category: Category,
        new_proof: &[u8],
        member_id: &str,
    ) -> Result<FoldRecord, FoldError> {
        self.mutate(category, |record| {
            if record.obfuscated {
                return Err(FoldError::AlreadyObfuscated(category));
            }
            if record.included.iter().any(|id| id == member_id) {
                return Err(FoldError::DuplicateMember {
                    category,
                    member: member_id.to_string(),
                });
            }
            record.proof = new_proof.to_vec();
            record.num_folds += 1;
            record.included.push(member_id.to_string());
            Ok(())
        })
        .map(|record| {
            debug!(%category, member = member_id, num_folds = record.num_folds, "Appended fold");
            record
        })
    }

    /// Replace the proof with its obfuscated form and seal the record
    pub fn mark_obfuscated(
        &self,
        category: Category,
        new_proof: &[u8],
    ) -> Result<FoldRecord, FoldError> {
        self.mutate(category, |record| {
            if record.obfuscated {
                return Err(FoldError::AlreadyObfuscated(category));
            }
            record.proof = new_proof.to_vec();
            record.obfuscated = true;
            Ok(())
        })
        .map(|record| {
            info!(%category, num_folds = record.num_folds, "Marked record obfuscated");
            record
        })
    }

    /// Flip the advisory lock flag
    pub fn set_locked(&self, category: Category, locked: bool) -> Result<FoldRecord, FoldError> {
        self.mutate(category, |record| {
            record.locked = locked;
            Ok(())
        })
    }

    /// Deterministic member selection: the first member of the pool, in pool
    /// order, that is eligible and not already folded in. Stable ordering is
    /// what makes interrupted runs converge to the same included set.
    pub fn select_next_eligible(
        &self,
        category: Category,
        pool: &[Member],
    ) -> Result<Option<Member>, FoldError> {
        let included = match self.get_record(category)? {
            Some(record) => record.included,
            None => Vec::new(),
        };
        Ok(pool
            .iter()
            .find(|m| m.eligible() && !included.iter().any(|id| id == &m.id))
            .cloned())
    }

    /// Progress state for the foreground context
    pub fn status(&self, category: Category) -> Result<FoldStatus, FoldError> {
        Ok(match self.get_record(category)? {
            None => FoldStatus::NotStarted,
            Some(FoldRecord {
                obfuscated: true,
                num_folds,
                ..
            }) => FoldStatus::Finalized { num_folds },
            Some(FoldRecord { num_folds, .. }) => FoldStatus::InProgress { num_folds },
        })
    }

    /// Clear all records. Explicit user action only.
    pub fn reset(&self) -> Result<(), FoldError> {
        self.tree.clear()?;
        info!("Cleared fold record store");
        Ok(())
    }

    /// Atomic read-modify-write with CAS retry
    fn mutate(
        &self,
        category: Category,
        f: impl Fn(&mut FoldRecord) -> Result<(), FoldError>,
    ) -> Result<FoldRecord, FoldError> {
        let key = category.as_str();
        loop {
            let current = self
                .tree
                .get(key)?
                .ok_or(FoldError::RecordNotFound(category))?;

            let mut record: FoldRecord = rmp_serde::from_slice(&current)?;
            f(&mut record)?;
            record.updated_at = now_millis();

            let bytes = rmp_serde::to_vec(&record)?;
            match self
                .tree
                .compare_and_swap(key, Some(&current), Some(bytes))?
            {
                Ok(()) => return Ok(record),
                // lost a race with another writer in this process; retry on
                // the fresh value
                Err(_) => continue,
            }
        }
    }
}
