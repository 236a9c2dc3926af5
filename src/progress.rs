//! Progress broadcasting for foreground consumers
//!
//! The background run publishes coarse events over a broadcast channel so any
//! number of foreground contexts can render progress. Slow or absent
//! subscribers never block or fail the engine - events are best-effort and
//! the durable stores remain the source of truth.

use crate::record_store::Category;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast channel capacity
const CHANNEL_CAPACITY: usize = 256;

/// Events emitted during a folding run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FoldEvent {
    /// One parameter chunk landed in the chunk store
    ChunkStored { index: u32, stored: u32, total: u32 },
    /// The parameter blob was assembled and verified
    ParamsReady { digest: String },
    /// One membership was folded in and persisted
    MemberFolded {
        category: Category,
        member: String,
        num_folds: u32,
        pool_size: u32,
    },
    /// A member was skipped; the run continues
    MemberSkipped {
        category: Category,
        member: String,
        reason: String,
    },
    /// The chaff step was applied and the record sealed
    Obfuscated { category: Category, num_folds: u32 },
    /// The run stopped early
    RunAborted { reason: String },
    /// The folding loop drained the pool
    RunComplete {
        category: Category,
        folded: u32,
        skipped: u32,
    },
}

/// Broadcast hub for fold events
#[derive(Clone)]
pub struct ProgressHub {
    tx: broadcast::Sender<FoldEvent>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FoldEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn send(&self, event: FoldEvent) {
        trace!(?event, "Fold event");
        let _ = self.tx.send(event);
    }
}
