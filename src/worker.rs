//! Background folding worker
//!
//! Folding is slow, so it runs on a dedicated task that owns the
//! orchestrator. The foreground holds a cheap handle and talks to the task
//! over a typed command channel; progress flows back over the broadcast hub
//! and durable state, never through the commands.
//!
//! The task can die at any suspension point (process exit, handle drop).
//! That is safe by construction: every durable write commits before the next
//! step, and the next run steals the expired lease and resumes.

use crate::error::FoldError;
use crate::orchestrator::{FoldOrchestrator, RunReport};
use crate::progress::{FoldEvent, ProgressHub};
use crate::record_store::Category;
use crate::registry::MemberPool;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

const COMMAND_BUFFER: usize = 8;

enum FoldCommand {
    RunFold {
        pool: MemberPool,
        reply: oneshot::Sender<Result<RunReport, FoldError>>,
    },
    Finalize {
        category: Category,
        merkle_root: String,
        reply: oneshot::Sender<Result<(), FoldError>>,
    },
    Shutdown,
}

/// Handle to the background folding task
pub struct FoldHandle {
    tx: mpsc::Sender<FoldCommand>,
    progress: ProgressHub,
    join: tokio::task::JoinHandle<()>,
}

/// Spawns and owns the background folding task
pub struct FoldWorker;

impl FoldWorker {
    /// Spawn the worker task. The returned handle is the only way to reach it.
    pub fn spawn(orchestrator: FoldOrchestrator, progress: ProgressHub) -> FoldHandle {
        let (tx, mut rx) = mpsc::channel::<FoldCommand>(COMMAND_BUFFER);

        let join = tokio::spawn(async move {
            info!("Folding worker started");
            while let Some(command) = rx.recv().await {
                match command {
                    FoldCommand::RunFold { pool, reply } => {
                        let result = orchestrator.run_fold(&pool).await;
                        // a dropped reply means the caller went away; the
                        // durable stores already hold the outcome
                        let _ = reply.send(result);
                    }
                    FoldCommand::Finalize {
                        category,
                        merkle_root,
                        reply,
                    } => {
                        let result = orchestrator.finalize(category, &merkle_root).await;
                        let _ = reply.send(result);
                    }
                    FoldCommand::Shutdown => break,
                }
            }
            info!("Folding worker stopped");
        });

        FoldHandle { tx, progress, join }
    }
}

impl FoldHandle {
    /// Run the folding loop for a pool on the background task
    pub async fn run_fold(&self, pool: MemberPool) -> Result<RunReport, FoldError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FoldCommand::RunFold { pool, reply })
            .await
            .map_err(|_| FoldError::WorkerGone)?;
        rx.await.map_err(|_| FoldError::WorkerGone)?
    }

    /// Finalize (obfuscate) a category on the background task
    pub async fn finalize(&self, category: Category, merkle_root: &str) -> Result<(), FoldError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FoldCommand::Finalize {
                category,
                merkle_root: merkle_root.to_string(),
                reply,
            })
            .await
            .map_err(|_| FoldError::WorkerGone)?;
        rx.await.map_err(|_| FoldError::WorkerGone)?
    }

    /// Subscribe to progress events from the running worker
    pub fn subscribe(&self) -> broadcast::Receiver<FoldEvent> {
        self.progress.subscribe()
    }

    /// Stop the worker after the current command finishes
    pub async fn shutdown(self) {
        if self.tx.send(FoldCommand::Shutdown).await.is_err() {
            debug!("Worker already gone at shutdown");
        }
        let _ = self.join.await;
    }
}
