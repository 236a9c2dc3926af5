//! Member registry boundary types
//!
//! The candidate pool arrives from an external registry as JSON. Each member
//! carries the private-input material the proving backend needs, already
//! validated upstream - the engine only checks eligibility and dedupes.

use crate::error::FoldError;
use crate::record_store::Category;
use serde::{Deserialize, Serialize};

/// Attestation material for one membership event: the signature exchanged
/// with the member plus the merkle path locating them in the category tree.
/// Opaque to the engine; forwarded to the proving backend as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attestation {
    /// DER-encoded signature, hex
    pub signature: String,
    /// Signed message
    pub message: String,
    /// Root of the tree this member belongs to, hex
    pub merkle_root: String,
    /// Merkle path bits, leaf to root
    pub path_indices: Vec<u8>,
    /// Sibling hashes along the path, hex
    pub siblings: Vec<String>,
}

/// One candidate member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Stable member identifier (signature public key)
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Present once an attestation has actually been exchanged
    #[serde(default)]
    pub attestation: Option<Attestation>,
    /// The pool includes the local user; they cannot fold themselves
    #[serde(default)]
    pub is_self: bool,
}

impl Member {
    /// Whether this member can be folded in at all
    pub fn eligible(&self) -> bool {
        !self.is_self && self.attestation.is_some()
    }
}

/// The candidate pool for one category, as served by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPool {
    pub category: Category,
    /// Root of the category's membership tree, hex
    pub merkle_root: String,
    pub members: Vec<Member>,
}

impl MemberPool {
    pub fn from_json(json: &str) -> Result<Self, FoldError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, FoldError> {
        Ok(serde_json::to_string(self)?)
    }
}
