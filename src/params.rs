//! Parameter download and assembly
//!
//! The proving parameters are too large to fetch in one shot on a flaky
//! connection, so they are published as ordered slices of a single gzip
//! stream. `ensure_chunks` tops up whatever the chunk store is missing, and
//! `assemble` reconstitutes the in-memory blob. The assembled blob is never
//! persisted - it is always derivable from the chunks.

use crate::chunk_store::ChunkStore;
use crate::error::FoldError;
use crate::progress::{FoldEvent, ProgressHub};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use tracing::{debug, info};

/// External parameter source. Resolves a chunk index to its payload,
/// e.g. via a content-addressed remote fetch.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk(&self, index: u32) -> anyhow::Result<Vec<u8>>;
}

/// Fully assembled proving parameters, held in memory only
#[derive(Clone)]
pub struct Params {
    pub bytes: Vec<u8>,
    /// sha256 of the decompressed blob, hex-encoded
    pub digest: String,
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Params")
            .field("len", &self.bytes.len())
            .field("digest", &self.digest)
            .finish()
    }
}

/// Fetch every chunk the store is missing, in increasing index order.
///
/// Chunk writes are idempotent-by-rejection: a concurrent downloader may have
/// stored an index while our fetch was in flight, in which case the put is
/// skipped. No lease is required for chunk writes.
pub async fn ensure_chunks(
    store: &ChunkStore,
    source: &dyn ChunkSource,
    progress: &ProgressHub,
) -> Result<(), FoldError> {
    let missing = store.missing_indices()?;
    if missing.is_empty() {
        debug!("Parameter chunks previously cached");
        return Ok(());
    }
    info!(
        stored = store.count(),
        expected = store.expected(),
        "Fetching missing parameter chunks"
    );

    for index in missing {
        let payload = source
            .fetch_chunk(index)
            .await
            .map_err(|source| FoldError::ChunkFetch { index, source })?;

        match store.put(index, &payload) {
            Ok(()) => {
                progress.send(FoldEvent::ChunkStored {
                    index,
                    stored: store.count(),
                    total: store.expected(),
                });
            }
            // another context stored this index while we were fetching
            Err(FoldError::ChunkExists { index }) => {
                debug!(index, "Chunk stored by a concurrent downloader");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Concatenate all chunks in index order and gunzip into the parameter blob.
pub fn assemble(store: &ChunkStore) -> Result<Params, FoldError> {
    if !store.is_complete() {
        return Err(FoldError::ParamsIncomplete {
            stored: store.count(),
            expected: store.expected(),
        });
    }

    let mut compressed = Vec::new();
    for chunk in store.get_all()? {
        compressed.extend_from_slice(&chunk);
    }

    let mut bytes = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut bytes)?;

    let digest = hex::encode(Sha256::digest(&bytes));
    info!(
        compressed = compressed.len(),
        decompressed = bytes.len(),
        %digest,
        "Assembled proving parameters"
    );

    Ok(Params { bytes, digest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct SliceSource {
        chunks: Vec<Vec<u8>>,
        fetches: AtomicU32,
    }

    #[async_trait]
    impl ChunkSource for SliceSource {
        async fn fetch_chunk(&self, index: u32) -> anyhow::Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.chunks[index as usize].clone())
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn setup(n: u32, payload: &[u8]) -> (TempDir, ChunkStore, SliceSource) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("test.sled")).unwrap();
        let store = ChunkStore::new(db.open_tree("param_chunks").unwrap(), n);

        let compressed = gzip(payload);
        let chunk_size = (compressed.len() + n as usize - 1) / n as usize;
        let chunks: Vec<Vec<u8>> = compressed.chunks(chunk_size).map(|c| c.to_vec()).collect();
        assert_eq!(chunks.len(), n as usize);

        let source = SliceSource {
            chunks,
            fetches: AtomicU32::new(0),
        };
        (dir, store, source)
    }

    #[tokio::test]
    async fn test_fetch_and_assemble() {
        let payload = b"public parameters, decompressed".repeat(16);
        let (_dir, store, source) = setup(4, &payload);
        let progress = ProgressHub::default();

        ensure_chunks(&store, &source, &progress).await.unwrap();
        assert!(store.is_complete());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);

        let params = assemble(&store).unwrap();
        assert_eq!(params.bytes, payload);
        assert_eq!(params.digest, hex::encode(Sha256::digest(&payload)));
    }

    #[tokio::test]
    async fn test_resume_fetches_only_missing() {
        let payload = b"resumable parameter download".repeat(8);
        let (_dir, store, source) = setup(4, &payload);
        let progress = ProgressHub::default();

        // two chunks already cached from an interrupted run
        store.put(0, &source.chunks[0]).unwrap();
        store.put(1, &source.chunks[1]).unwrap();

        ensure_chunks(&store, &source, &progress).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(store.is_complete());

        // no redundant re-fetch once complete
        ensure_chunks(&store, &source, &progress).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_assemble_incomplete_fails() {
        let payload = b"incomplete".repeat(4);
        let (_dir, store, source) = setup(4, &payload);

        store.put(0, &source.chunks[0]).unwrap();
        let err = assemble(&store).unwrap_err();
        assert!(matches!(
            err,
            FoldError::ParamsIncomplete {
                stored: 1,
                expected: 4
            }
        ));
    }
}
