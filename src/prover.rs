//! Proving backend boundary
//!
//! The folding math itself lives behind this trait. Proof values are opaque
//! byte-strings to the engine; the backend decides their encoding. The
//! durable form is always the compressed one - proofs are inflated on the
//! way into a fold and deflated before every persist.

use crate::params::Params;
use crate::registry::Member;
use async_trait::async_trait;

/// An uncompressed proof, ready to fold onto
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof(pub Vec<u8>);

/// A compressed proof, the durable form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedProof(pub Vec<u8>);

/// The iteration count a verifier must be given: the chaff step of
/// obfuscation consumes one extra folding iteration.
pub fn effective_iterations(num_folds: u32, obfuscated: bool) -> u32 {
    if obfuscated {
        num_folds + 1
    } else {
        num_folds
    }
}

/// Opaque proving capability
#[async_trait]
pub trait ProvingBackend: Send + Sync {
    /// Fold the first membership into a fresh proof
    async fn start_fold(
        &self,
        member: &Member,
        merkle_root: &str,
        params: &Params,
    ) -> anyhow::Result<Proof>;

    /// Fold one more membership onto an existing proof
    async fn continue_fold(
        &self,
        member: &Member,
        prev_proof: Proof,
        prior_folds: u32,
        merkle_root: &str,
        params: &Params,
    ) -> anyhow::Result<Proof>;

    /// Apply the chaff step that hides the true iteration count
    async fn obfuscate(
        &self,
        proof: Proof,
        num_folds: u32,
        merkle_root: &str,
        params: &Params,
    ) -> anyhow::Result<Proof>;

    /// Verify a proof against the given iteration count. Read-only.
    async fn verify(
        &self,
        proof: Proof,
        merkle_root: &str,
        iterations: u32,
        params: &Params,
    ) -> anyhow::Result<bool>;

    /// Deflate a proof into its durable form
    async fn compress(&self, proof: Proof) -> anyhow::Result<CompressedProof>;

    /// Inflate a stored proof
    async fn decompress(&self, compressed: CompressedProof) -> anyhow::Result<Proof>;
}
