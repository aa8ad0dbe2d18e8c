//! Domain event system — decoupled observation of chain progress.
//!
//! The engine publishes an event whenever a chain changes in a way a front
//! end might want to show (plan accepted, step finished, replanned, done).
//! Subscribers filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::chain::{ChainId, ChainState, StepStatus};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A query was accepted and a chain allocated
    ChainCreated {
        chain_id: ChainId,
        query_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// A plan passed validation and replaced the pending steps
    PlanAccepted {
        chain_id: ChainId,
        steps: usize,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A step reached a terminal status
    StepFinished {
        chain_id: ChainId,
        index: usize,
        tool: String,
        status: StepStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The engine discarded the pending plan and asked for a new one
    Replanned {
        chain_id: ChainId,
        after_step: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The chain reached DONE or ABORTED
    ChainFinished {
        chain_id: ChainId,
        state: ChainState,
        partial: bool,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// The chain this event belongs to.
    pub fn chain_id(&self) -> &ChainId {
        match self {
            DomainEvent::ChainCreated { chain_id, .. }
            | DomainEvent::PlanAccepted { chain_id, .. }
            | DomainEvent::StepFinished { chain_id, .. }
            | DomainEvent::Replanned { chain_id, .. }
            | DomainEvent::ChainFinished { chain_id, .. } => chain_id,
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
