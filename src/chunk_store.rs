//! Durable storage for parameter chunks
//!
//! The proving parameters are published upstream as a fixed number of ordered
//! gzip-stream slices. Chunks land here one at a time as the fetcher makes
//! progress, so a reload resumes the download instead of restarting it.
//!
//! Chunks are immutable once written: `put` rejects an index that is already
//! stored, which makes racing writers safe without any locking.

use crate::error::FoldError;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Chunk storage backed by a sled tree keyed by big-endian index,
/// so tree iteration order is chunk index order.
#[derive(Clone)]
pub struct ChunkStore {
    tree: sled::Tree,
    /// Number of chunks the upstream parameter set is split into
    chunk_count: u32,
}

impl ChunkStore {
    pub fn new(tree: sled::Tree, chunk_count: u32) -> Self {
        Self { tree, chunk_count }
    }

    fn key(index: u32) -> [u8; 4] {
        index.to_be_bytes()
    }

    /// Store one chunk. Fails if the index is already present.
    pub fn put(&self, index: u32, payload: &[u8]) -> Result<(), FoldError> {
        let prev = self
            .tree
            .compare_and_swap(Self::key(index), None::<&[u8]>, Some(payload))?;
        if prev.is_err() {
            return Err(FoldError::ChunkExists { index });
        }

        let digest = hex::encode(Sha256::digest(payload));
        debug!(index, size = payload.len(), %digest, "Stored parameter chunk");
        Ok(())
    }

    /// Number of chunks stored so far
    pub fn count(&self) -> u32 {
        self.tree.len() as u32
    }

    /// Whether all expected chunks are present
    pub fn is_complete(&self) -> bool {
        self.count() == self.chunk_count
    }

    /// Expected total number of chunks
    pub fn expected(&self) -> u32 {
        self.chunk_count
    }

    /// Indices not yet stored, in increasing order
    pub fn missing_indices(&self) -> Result<Vec<u32>, FoldError> {
        let mut missing = Vec::new();
        for index in 0..self.chunk_count {
            if self.tree.get(Self::key(index))?.is_none() {
                missing.push(index);
            }
        }
        Ok(missing)
    }

    /// All stored chunks, ordered by index
    pub fn get_all(&self) -> Result<Vec<Vec<u8>>, FoldError> {
        let mut chunks = Vec::with_capacity(self.count() as usize);
        for item in self.tree.iter() {
            let (_, value) = item?;
            chunks.push(value.to_vec());
        }
        Ok(chunks)
    }

    /// Clear all chunks. Explicit user action only.
    pub fn reset(&self) -> Result<(), FoldError> {
        self.tree.clear()?;
        info!("Cleared parameter chunk store");
        Ok(())
    }
}
