//! End-to-end folding scenarios over a real (temporary) database
//!
//! Uses an in-memory proving backend that encodes the fold history into the
//! proof bytes, so verification can actually check roots, member sets and
//! iteration counts without any crypto.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use fold_engine::{
    Attestation, Category, ChunkSource, CompressedProof, Config, FoldEngine, FoldError, FoldEvent,
    Member, MemberPool, Params, Proof, ProvingBackend,
};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const ROOT: &str = "1d38ba4c24c07eb8";

/// Proof bytes: "root|chaffed|id,id,id"
struct TestBackend {
    fail_ids: HashSet<String>,
}

struct DecodedProof {
    root: String,
    chaffed: bool,
    members: Vec<String>,
}

impl TestBackend {
    fn new() -> Self {
        Self {
            fail_ids: HashSet::new(),
        }
    }

    fn failing(ids: &[&str]) -> Self {
        Self {
            fail_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn encode(root: &str, chaffed: bool, members: &[String]) -> Proof {
        Proof(format!("{}|{}|{}", root, chaffed, members.join(",")).into_bytes())
    }

    fn decode(proof: &Proof) -> anyhow::Result<DecodedProof> {
        let text = String::from_utf8(proof.0.clone())?;
        let mut parts = text.splitn(3, '|');
        let root = parts.next().context("missing root")?.to_string();
        let chaffed: bool = parts.next().context("missing chaff flag")?.parse()?;
        let members = parts
            .next()
            .context("missing members")?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        Ok(DecodedProof {
            root,
            chaffed,
            members,
        })
    }

    fn check(&self, member: &Member) -> anyhow::Result<()> {
        if self.fail_ids.contains(&member.id) {
            bail!("malformed signature for {}", member.id);
        }
        Ok(())
    }
}

#[async_trait]
impl ProvingBackend for TestBackend {
    async fn start_fold(
        &self,
        member: &Member,
        merkle_root: &str,
        _params: &Params,
    ) -> anyhow::Result<Proof> {
        self.check(member)?;
        Ok(Self::encode(merkle_root, false, &[member.id.clone()]))
    }

    async fn continue_fold(
        &self,
        member: &Member,
        prev_proof: Proof,
        prior_folds: u32,
        merkle_root: &str,
        _params: &Params,
    ) -> anyhow::Result<Proof> {
        self.check(member)?;
        let mut decoded = Self::decode(&prev_proof)?;
        if decoded.chaffed {
            bail!("cannot fold onto an obfuscated proof");
        }
        if decoded.members.len() as u32 != prior_folds {
            bail!(
                "prior fold count mismatch: {} vs {}",
                decoded.members.len(),
                prior_folds
            );
        }
        if decoded.root != merkle_root {
            bail!("root mismatch");
        }
        decoded.members.push(member.id.clone());
        Ok(Self::encode(merkle_root, false, &decoded.members))
    }

    async fn obfuscate(
        &self,
        proof: Proof,
        num_folds: u32,
        merkle_root: &str,
        _params: &Params,
    ) -> anyhow::Result<Proof> {
        let decoded = Self::decode(&proof)?;
        if decoded.members.len() as u32 != num_folds {
            bail!("fold count mismatch at obfuscation");
        }
        if decoded.root != merkle_root {
            bail!("root mismatch");
        }
        Ok(Self::encode(merkle_root, true, &decoded.members))
    }

    async fn verify(
        &self,
        proof: Proof,
        merkle_root: &str,
        iterations: u32,
        _params: &Params,
    ) -> anyhow::Result<bool> {
        let decoded = Self::decode(&proof)?;
        let expected = decoded.members.len() as u32 + decoded.chaffed as u32;
        Ok(decoded.root == merkle_root && iterations == expected)
    }

    async fn compress(&self, proof: Proof) -> anyhow::Result<CompressedProof> {
        let mut bytes = b"gz:".to_vec();
        bytes.extend_from_slice(&proof.0);
        Ok(CompressedProof(bytes))
    }

    async fn decompress(&self, compressed: CompressedProof) -> anyhow::Result<Proof> {
        let rest = compressed
            .0
            .strip_prefix(b"gz:".as_slice())
            .ok_or_else(|| anyhow!("not a compressed proof"))?;
        Ok(Proof(rest.to_vec()))
    }
}

/// Serves slices of one gzip stream and counts fetches
struct FixtureSource {
    chunks: Vec<Vec<u8>>,
    fetches: AtomicU32,
}

impl FixtureSource {
    fn new(n: u32) -> Self {
        let payload = b"proving parameters fixture".repeat(64);
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        let chunk_size = (compressed.len() + n as usize - 1) / n as usize;
        let chunks = compressed.chunks(chunk_size).map(|c| c.to_vec()).collect();
        Self {
            chunks,
            fetches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChunkSource for FixtureSource {
    async fn fetch_chunk(&self, index: u32) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.chunks[index as usize].clone())
    }
}

fn member(id: &str) -> Member {
    Member {
        id: id.to_string(),
        display_name: None,
        attestation: Some(Attestation {
            merkle_root: ROOT.to_string(),
            ..Attestation::default()
        }),
        is_self: false,
    }
}

fn pool(ids: &[&str]) -> MemberPool {
    MemberPool {
        category: Category::Attendee,
        merkle_root: ROOT.to_string(),
        members: ids.iter().map(|id| member(id)).collect(),
    }
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage_dir = dir.path().to_path_buf();
    config.chunk_count = 4;
    config
}

#[tokio::test]
async fn test_fold_finalize_verify_flow() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(
        Arc::new(TestBackend::new()),
        Arc::new(FixtureSource::new(4)),
    );

    let report = orchestrator.run_fold(&pool(&["A", "B"])).await.unwrap();
    assert_eq!(report.folded, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.total_folds, 2);

    let record = engine
        .record_store()
        .get_record(Category::Attendee)
        .unwrap()
        .unwrap();
    assert_eq!(record.num_folds, 2);
    assert_eq!(record.included, vec!["A", "B"]);
    assert!(!record.obfuscated);

    orchestrator.finalize(Category::Attendee, ROOT).await.unwrap();
    let record = engine
        .record_store()
        .get_record(Category::Attendee)
        .unwrap()
        .unwrap();
    assert!(record.obfuscated);
    assert_eq!(record.num_folds, 2);

    // backend accepts exactly num_folds + 1 iterations after the chaff step
    assert!(orchestrator.verify(Category::Attendee, ROOT).await.unwrap());
}

#[tokio::test]
async fn test_interrupted_run_resumes_where_it_left_off() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FixtureSource::new(4));

    {
        let engine = FoldEngine::open(config(&dir)).await.unwrap();
        let orchestrator = engine.orchestrator(Arc::new(TestBackend::new()), source.clone());
        // "interrupted" run got through A and B before the tab closed
        orchestrator.run_fold(&pool(&["A", "B"])).await.unwrap();
    }

    // fresh context over the same storage, fuller pool
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(Arc::new(TestBackend::new()), source.clone());
    let report = orchestrator.run_fold(&pool(&["A", "B", "C"])).await.unwrap();

    assert_eq!(report.folded, 1);
    assert_eq!(report.total_folds, 3);
    let record = engine
        .record_store()
        .get_record(Category::Attendee)
        .unwrap()
        .unwrap();
    assert_eq!(record.included, vec!["A", "B", "C"]);

    // chunks were cached by the first run; the second fetched nothing
    assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_lease_holder_blocks_second_run() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(
        Arc::new(TestBackend::new()),
        Arc::new(FixtureSource::new(4)),
    );

    let token = engine.lease().acquire().unwrap();
    let err = orchestrator.run_fold(&pool(&["A"])).await.unwrap_err();
    assert!(matches!(err, FoldError::LeaseUnavailable));
    assert!(engine
        .record_store()
        .get_record(Category::Attendee)
        .unwrap()
        .is_none());

    engine.lease().release(token).unwrap();
    orchestrator.run_fold(&pool(&["A"])).await.unwrap();
}

#[tokio::test]
async fn test_proving_failure_skips_member_only() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(
        Arc::new(TestBackend::failing(&["mallory"])),
        Arc::new(FixtureSource::new(4)),
    );

    let report = orchestrator
        .run_fold(&pool(&["A", "mallory", "B"]))
        .await
        .unwrap();
    assert_eq!(report.folded, 2);
    assert_eq!(report.skipped, 1);

    let record = engine
        .record_store()
        .get_record(Category::Attendee)
        .unwrap()
        .unwrap();
    assert_eq!(record.included, vec!["A", "B"]);
    assert_eq!(record.num_folds, 2);
}

#[tokio::test]
async fn test_expired_lease_aborts_but_keeps_progress() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    // lease expires immediately: the first renewal is a hard stop
    cfg.lease_duration_ms = 0;

    let source = Arc::new(FixtureSource::new(4));
    {
        let engine = FoldEngine::open(cfg).await.unwrap();
        let orchestrator = engine.orchestrator(Arc::new(TestBackend::new()), source.clone());
        let err = orchestrator.run_fold(&pool(&["A"])).await.unwrap_err();
        assert!(matches!(err, FoldError::LeaseExpired));
    }

    // downloaded chunks survive the abort; a healthy run picks them up
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    assert!(engine.chunk_store().is_complete());
    let orchestrator = engine.orchestrator(Arc::new(TestBackend::new()), source.clone());
    let report = orchestrator.run_fold(&pool(&["A"])).await.unwrap();
    assert_eq!(report.folded, 1);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
}

/// Always fails, for abort-path coverage
struct BrokenSource;

#[async_trait]
impl ChunkSource for BrokenSource {
    async fn fetch_chunk(&self, index: u32) -> anyhow::Result<Vec<u8>> {
        bail!("bucket unreachable for chunk {}", index);
    }
}

#[tokio::test]
async fn test_aborted_run_keeps_its_cause_and_frees_the_lease() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(Arc::new(TestBackend::new()), Arc::new(BrokenSource));

    // the fetch failure is the error the caller sees, not anything from
    // the lease cleanup that follows it
    let err = orchestrator.run_fold(&pool(&["A"])).await.unwrap_err();
    assert!(matches!(err, FoldError::ChunkFetch { index: 0, .. }));

    // and the lease came back with the abort, not after a timeout
    let token = engine.lease().acquire().unwrap();
    engine.lease().release(token).unwrap();
}

#[tokio::test]
async fn test_no_eligible_members_is_a_clean_run() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(
        Arc::new(TestBackend::new()),
        Arc::new(FixtureSource::new(4)),
    );

    let mut untapped = member("carol");
    untapped.attestation = None;
    let mut own = member("me");
    own.is_self = true;
    let pool = MemberPool {
        category: Category::Attendee,
        merkle_root: ROOT.to_string(),
        members: vec![untapped, own],
    };

    let report = orchestrator.run_fold(&pool).await.unwrap();
    assert_eq!(report.folded, 0);
    assert_eq!(report.total_folds, 0);
    assert!(engine
        .record_store()
        .get_record(Category::Attendee)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_finalize_requires_record_and_is_terminal() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let orchestrator = engine.orchestrator(
        Arc::new(TestBackend::new()),
        Arc::new(FixtureSource::new(4)),
    );

    let err = orchestrator
        .finalize(Category::Attendee, ROOT)
        .await
        .unwrap_err();
    assert!(matches!(err, FoldError::RecordNotFound(_)));

    orchestrator.run_fold(&pool(&["A"])).await.unwrap();
    orchestrator.finalize(Category::Attendee, ROOT).await.unwrap();

    let err = orchestrator
        .finalize(Category::Attendee, ROOT)
        .await
        .unwrap_err();
    assert!(matches!(err, FoldError::AlreadyObfuscated(_)));

    // and folding past the chaff step is rejected at the store
    let err = orchestrator.run_fold(&pool(&["A", "B"])).await.unwrap_err();
    assert!(matches!(err, FoldError::AlreadyObfuscated(_)));
}

#[tokio::test]
async fn test_worker_roundtrip_with_events() {
    let dir = TempDir::new().unwrap();
    let engine = FoldEngine::open(config(&dir)).await.unwrap();
    let handle = engine.spawn_worker(
        Arc::new(TestBackend::new()),
        Arc::new(FixtureSource::new(4)),
    );
    let mut events = handle.subscribe();

    let report = handle.run_fold(pool(&["A", "B"])).await.unwrap();
    assert_eq!(report.folded, 2);
    handle.finalize(Category::Attendee, ROOT).await.unwrap();

    let mut folded = 0;
    let mut obfuscated = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            FoldEvent::MemberFolded { .. } => folded += 1,
            FoldEvent::Obfuscated { num_folds, .. } => {
                obfuscated += 1;
                assert_eq!(num_folds, 2);
            }
            _ => {}
        }
    }
    assert_eq!(folded, 2);
    assert_eq!(obfuscated, 1);

    handle.shutdown().await;
}
