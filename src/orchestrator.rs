//! Folding orchestration state machine
//!
//! Drives a fold from empty to incrementally folded to obfuscated:
//!
//! ```text
//! Idle ──► ParamsAssembling ──► Folding ──► Obfuscating ──► Done
//!   │              │               │             │
//!   └──────────────┴───────────────┴─────────────┴──► Aborted
//! ```
//!
//! Every durable write commits before the next step begins, so the worst an
//! interruption leaves behind is an expired lease and a partially folded
//! record. The next run steals the lease and resumes from member selection,
//! which skips everything already included.
//!
//! Member-level proving failures are recovered locally: the member is
//! skipped and reported in the run's skip count, never aborting the run.
//! Lease expiry is fatal to the run but not to the system.

use crate::chunk_store::ChunkStore;
use crate::error::FoldError;
use crate::lease::{LeaseCoordinator, LeaseToken};
use crate::params::{self, ChunkSource, Params};
use crate::progress::{FoldEvent, ProgressHub};
use crate::prover::{effective_iterations, CompressedProof, ProvingBackend};
use crate::record_store::{Category, FoldRecordStore, FoldStatus};
use crate::registry::{Member, MemberPool};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one folding run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub category: Category,
    /// Members folded in by this run
    pub folded: u32,
    /// Members skipped on proving failure
    pub skipped: u32,
    /// Total folds now in the record
    pub total_folds: u32,
}

/// Sequences parameter assembly, member selection, proof generation and
/// persistence for one category at a time. Category is always an explicit
/// parameter; independent lease-protected runs could fold disjoint
/// categories in parallel, but one run serializes everything under its
/// single lease.
pub struct FoldOrchestrator {
    chunks: ChunkStore,
    records: FoldRecordStore,
    lease: LeaseCoordinator,
    backend: Arc<dyn ProvingBackend>,
    source: Arc<dyn ChunkSource>,
    progress: ProgressHub,
}

impl FoldOrchestrator {
    pub fn new(
        chunks: ChunkStore,
        records: FoldRecordStore,
        lease: LeaseCoordinator,
        backend: Arc<dyn ProvingBackend>,
        source: Arc<dyn ChunkSource>,
        progress: ProgressHub,
    ) -> Self {
        Self {
            chunks,
            records,
            lease,
            backend,
            source,
            progress,
        }
    }

    /// Run the folding loop for one category until the pool is drained.
    ///
    /// Returns `LeaseUnavailable` if another context is already folding, and
    /// `LeaseExpired` if the lease lapses mid-run; in both cases whatever was
    /// persisted stays persisted and a later run resumes transparently.
    pub async fn run_fold(&self, pool: &MemberPool) -> Result<RunReport, FoldError> {
        let token = self.acquire_or_abort()?;

        match self.fold_under_lease(&token, pool).await {
            Ok(report) => {
                self.lease.release(token)?;
                self.progress.send(FoldEvent::RunComplete {
                    category: report.category,
                    folded: report.folded,
                    skipped: report.skipped,
                });
                Ok(report)
            }
            Err(e) => {
                self.progress.send(FoldEvent::RunAborted {
                    reason: e.to_string(),
                });
                // an expired lease is no longer ours to release
                self.release_after_abort(token, &e);
                Err(e)
            }
        }
    }

    async fn fold_under_lease(
        &self,
        token: &LeaseToken,
        pool: &MemberPool,
    ) -> Result<RunReport, FoldError> {
        let category = pool.category;
        let root = pool.merkle_root.as_str();

        // obfuscation is terminal for proof content
        if let Some(record) = self.records.get_record(category)? {
            if record.obfuscated {
                return Err(FoldError::AlreadyObfuscated(category));
            }
        }

        // ParamsAssembling: chunk writes need no lease, but the run renews
        // before moving on so a stalled download can't outlive ownership
        params::ensure_chunks(&self.chunks, self.source.as_ref(), &self.progress).await?;
        self.lease.renew(token)?;
        let params = params::assemble(&self.chunks)?;
        self.progress.send(FoldEvent::ParamsReady {
            digest: params.digest.clone(),
        });

        // Folding loop
        let mut folded = 0u32;
        let mut skipped: HashSet<String> = HashSet::new();
        info!(%category, pool_size = pool.members.len(), "Folding run started");

        loop {
            let candidates: Vec<Member> = pool
                .members
                .iter()
                .filter(|m| !skipped.contains(&m.id))
                .cloned()
                .collect();
            let member = match self.records.select_next_eligible(category, &candidates)? {
                Some(member) => member,
                None => break,
            };

            match self.fold_one(token, category, root, &member, &params).await {
                Ok(num_folds) => {
                    folded += 1;
                    self.progress.send(FoldEvent::MemberFolded {
                        category,
                        member: member.id.clone(),
                        num_folds,
                        pool_size: pool.members.len() as u32,
                    });
                    self.lease.renew(token)?;
                }
                Err(FoldError::Proving(e)) => {
                    // one bad signature must not sink the whole run
                    warn!(%category, member = %member.id, error = %e, "Skipping member");
                    self.progress.send(FoldEvent::MemberSkipped {
                        category,
                        member: member.id.clone(),
                        reason: e.to_string(),
                    });
                    skipped.insert(member.id);
                }
                Err(e) => return Err(e),
            }
        }

        let total_folds = self
            .records
            .get_record(category)?
            .map(|r| r.num_folds)
            .unwrap_or(0);
        info!(%category, folded, skipped = skipped.len(), total_folds, "Folding run drained pool");

        Ok(RunReport {
            category,
            folded,
            skipped: skipped.len() as u32,
            total_folds,
        })
    }

    /// Fold one member and persist the result. Returns the new fold count.
    async fn fold_one(
        &self,
        token: &LeaseToken,
        category: Category,
        root: &str,
        member: &Member,
        params: &Params,
    ) -> Result<u32, FoldError> {
        let existing = self.records.get_record(category)?;

        let proof = match &existing {
            None => self
                .backend
                .start_fold(member, root, params)
                .await
                .map_err(FoldError::Proving)?,
            Some(record) => {
                let prev = self
                    .backend
                    .decompress(CompressedProof(record.proof.clone()))
                    .await
                    .map_err(FoldError::Proving)?;
                self.backend
                    .continue_fold(member, prev, record.num_folds, root, params)
                    .await
                    .map_err(FoldError::Proving)?
            }
        };

        let compressed = self
            .backend
            .compress(proof)
            .await
            .map_err(FoldError::Proving)?;

        // an in-flight fold is only persisted if the lease survived it
        if !self.lease.is_held_by(token)? {
            return Err(FoldError::LeaseExpired);
        }

        let record = match existing {
            None => self
                .records
                .create_record(category, &compressed.0, &member.id)?,
            Some(_) => self
                .records
                .append_fold(category, &compressed.0, &member.id)?,
        };
        Ok(record.num_folds)
    }

    /// Apply the chaff step and seal the record. Explicitly triggered, never
    /// automatic: the caller decides when folding is complete for now.
    pub async fn finalize(&self, category: Category, merkle_root: &str) -> Result<(), FoldError> {
        let record = self
            .records
            .get_record(category)?
            .ok_or(FoldError::RecordNotFound(category))?;
        if record.obfuscated {
            return Err(FoldError::AlreadyObfuscated(category));
        }

        let token = self.acquire_or_abort()?;
        let result = self
            .obfuscate_under_lease(&token, category, merkle_root, record.proof, record.num_folds)
            .await;
        match result {
            Ok(()) => {
                self.lease.release(token)?;
                self.progress.send(FoldEvent::Obfuscated {
                    category,
                    num_folds: record.num_folds,
                });
                Ok(())
            }
            Err(e) => {
                self.progress.send(FoldEvent::RunAborted {
                    reason: e.to_string(),
                });
                self.release_after_abort(token, &e);
                Err(e)
            }
        }
    }

    async fn obfuscate_under_lease(
        &self,
        token: &LeaseToken,
        category: Category,
        root: &str,
        stored_proof: Vec<u8>,
        num_folds: u32,
    ) -> Result<(), FoldError> {
        params::ensure_chunks(&self.chunks, self.source.as_ref(), &self.progress).await?;
        self.lease.renew(token)?;
        let params = params::assemble(&self.chunks)?;

        let proof = self
            .backend
            .decompress(CompressedProof(stored_proof))
            .await
            .map_err(FoldError::Proving)?;
        let chaffed = self
            .backend
            .obfuscate(proof, num_folds, root, &params)
            .await
            .map_err(FoldError::Proving)?;
        let compressed = self
            .backend
            .compress(chaffed)
            .await
            .map_err(FoldError::Proving)?;

        if !self.lease.is_held_by(token)? {
            return Err(FoldError::LeaseExpired);
        }
        self.records.mark_obfuscated(category, &compressed.0)?;
        Ok(())
    }

    /// Verify the stored proof for a category. Stateless and read-only, so
    /// it needs no lease and can run at any time, even mid-fold elsewhere.
    pub async fn verify(&self, category: Category, merkle_root: &str) -> Result<bool, FoldError> {
        let record = self
            .records
            .get_record(category)?
            .ok_or(FoldError::RecordNotFound(category))?;
        let params = params::assemble(&self.chunks)?;

        let proof = self
            .backend
            .decompress(CompressedProof(record.proof))
            .await
            .map_err(FoldError::Proving)?;
        let iterations = effective_iterations(record.num_folds, record.obfuscated);

        self.backend
            .verify(proof, merkle_root, iterations, &params)
            .await
            .map_err(FoldError::Proving)
    }

    /// Progress state derivable from durable data alone
    pub fn status(&self, category: Category) -> Result<FoldStatus, FoldError> {
        self.records.status(category)
    }

    /// Best-effort release on the abort path. The abort cause is what the
    /// caller needs to see; a failed release only costs waiting out the
    /// lease duration, so it is logged, not surfaced.
    fn release_after_abort(&self, token: LeaseToken, cause: &FoldError) {
        // an expired lease is no longer ours to release
        if matches!(cause, FoldError::LeaseExpired) {
            return;
        }
        if let Err(release_err) = self.lease.release(token) {
            warn!(error = %release_err, "Failed to release lease after aborted run");
        }
    }

    fn acquire_or_abort(&self) -> Result<LeaseToken, FoldError> {
        self.lease.acquire().map_err(|e| {
            self.progress.send(FoldEvent::RunAborted {
                reason: e.to_string(),
            });
            e
        })
    }
}
