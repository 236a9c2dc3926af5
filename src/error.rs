//! Error types for fold-engine

use thiserror::Error;

use crate::record_store::Category;

#[derive(Error, Debug)]
pub enum FoldError {
    #[error("Chunk {index} already stored")]
    ChunkExists { index: u32 },

    #[error("Parameter chunks incomplete: {stored} of {expected} stored")]
    ParamsIncomplete { stored: u32, expected: u32 },

    #[error("Fold record for {0} already exists")]
    RecordExists(Category),

    #[error("No fold record for {0}")]
    RecordNotFound(Category),

    #[error("Member {member} already folded into {category}")]
    DuplicateMember { category: Category, member: String },

    #[error("Fold record for {0} is already obfuscated")]
    AlreadyObfuscated(Category),

    #[error("Folding workspace lease is held by another context")]
    LeaseUnavailable,

    #[error("Lease expired or reassigned")]
    LeaseExpired,

    #[error("Chunk fetch failed for index {index}: {source}")]
    ChunkFetch {
        index: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Proving backend error: {0}")]
    Proving(#[source] anyhow::Error),

    #[error("Background worker is gone")]
    WorkerGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for FoldError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FoldError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FoldError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FoldError::Serialization(e.to_string())
    }
}
