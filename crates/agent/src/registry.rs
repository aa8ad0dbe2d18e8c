//! Chain registry — the owned, lock-guarded store of every chain the engine
//! knows about.
//!
//! Each chain is driven by exactly one task; the registry is the only place
//! drivers and callers meet. A `watch` channel per chain carries its current
//! state so callers can wait for it to finish without polling.

use chrono::{Duration, Utc};
use merlin_core::chain::{ChainId, ChainState, ReasoningChain};
use merlin_core::error::ChainError;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, watch};
use tracing::debug;

struct ChainEntry {
    chain: ReasoningChain,
    cancelled: Arc<AtomicBool>,
    state: watch::Sender<ChainState>,
}

impl ChainEntry {
    fn new(chain: ReasoningChain) -> Self {
        let (state, _) = watch::channel(chain.state);
        Self {
            chain,
            cancelled: Arc::new(AtomicBool::new(false)),
            state,
        }
    }
}

/// Snapshot of the chains that were active when [`ChainRegistry::list_active`]
/// was called. Iterating it never touches the registry again.
#[derive(Debug, Clone, Default)]
pub struct ActiveChains {
    chains: Vec<ReasoningChain>,
}

impl ActiveChains {
    pub fn iter(&self) -> std::slice::Iter<'_, ReasoningChain> {
        self.chains.iter()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn ids(&self) -> Vec<ChainId> {
        self.chains.iter().map(|c| c.id.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a ActiveChains {
    type Item = &'a ReasoningChain;
    type IntoIter = std::slice::Iter<'a, ReasoningChain>;

    fn into_iter(self) -> Self::IntoIter {
        self.chains.iter()
    }
}

impl IntoIterator for ActiveChains {
    type Item = ReasoningChain;
    type IntoIter = std::vec::IntoIter<ReasoningChain>;

    fn into_iter(self) -> Self::IntoIter {
        self.chains.into_iter()
    }
}

/// Store of all chains, keyed by id.
#[derive(Default)]
pub struct ChainRegistry {
    chains: RwLock<HashMap<ChainId, ChainEntry>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new chain in PLANNING state.
    pub async fn create(&self, query: impl Into<String>) -> ChainId {
        let query = query.into();
        let mut chains = self.chains.write().await;
        let mut id = ChainId::new();
        while chains.contains_key(&id) {
            id = ChainId::new();
        }
        chains.insert(id.clone(), ChainEntry::new(ReasoningChain::new(id.clone(), query)));
        debug!(chain_id = %id, total = chains.len(), "Chain created");
        id
    }

    /// Snapshot of one chain.
    pub async fn get(&self, id: &ChainId) -> Result<ReasoningChain, ChainError> {
        self.chains
            .read()
            .await
            .get(id)
            .map(|entry| entry.chain.clone())
            .ok_or_else(|| ChainError::NotFound(id.to_string()))
    }

    /// Mutate one chain under the registry lock.
    ///
    /// Subscribers are notified when the closure changed the chain state.
    pub async fn update<T>(
        &self,
        id: &ChainId,
        f: impl FnOnce(&mut ReasoningChain) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        let mut chains = self.chains.write().await;
        let entry = chains
            .get_mut(id)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))?;
        let result = f(&mut entry.chain);
        let state = entry.chain.state;
        entry.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        result
    }

    /// Chains not yet DONE or ABORTED, as of now.
    pub async fn list_active(&self) -> ActiveChains {
        let chains = self.chains.read().await;
        let mut active: Vec<ReasoningChain> = chains
            .values()
            .filter(|entry| !entry.chain.is_terminal())
            .map(|entry| entry.chain.clone())
            .collect();
        active.sort_by_key(|c| c.created_at);
        ActiveChains { chains: active }
    }

    /// Remove one finished chain and return its final snapshot.
    pub async fn retire(&self, id: &ChainId) -> Result<ReasoningChain, ChainError> {
        let mut chains = self.chains.write().await;
        let entry = chains
            .get(id)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))?;
        if !entry.chain.is_terminal() {
            return Err(ChainError::StillActive(id.to_string()));
        }
        let chain = chains
            .remove(id)
            .map(|entry| entry.chain)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))?;
        debug!(chain_id = %id, "Chain retired");
        Ok(chain)
    }

    /// Remove finished chains last updated more than `older_than` ago.
    pub async fn prune(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut chains = self.chains.write().await;
        let before = chains.len();
        chains.retain(|_, entry| !(entry.chain.is_terminal() && entry.chain.updated_at < cutoff));
        let removed = before - chains.len();
        if removed > 0 {
            debug!(removed, remaining = chains.len(), "Pruned finished chains");
        }
        removed
    }

    /// Watch a chain's lifecycle state.
    pub async fn subscribe(&self, id: &ChainId) -> Result<watch::Receiver<ChainState>, ChainError> {
        self.chains
            .read()
            .await
            .get(id)
            .map(|entry| entry.state.subscribe())
            .ok_or_else(|| ChainError::NotFound(id.to_string()))
    }

    /// Request cancellation. Returns `false` when the chain already finished.
    pub async fn cancel(&self, id: &ChainId) -> Result<bool, ChainError> {
        let chains = self.chains.read().await;
        let entry = chains
            .get(id)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))?;
        if entry.chain.is_terminal() {
            return Ok(false);
        }
        entry.cancelled.store(true, Ordering::SeqCst);
        Ok(true)
    }

    pub async fn is_cancelled(&self, id: &ChainId) -> bool {
        self.chains
            .read()
            .await
            .get(id)
            .is_some_and(|entry| entry.cancelled.load(Ordering::SeqCst))
    }

    pub async fn len(&self) -> usize {
        self.chains.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chains.read().await.is_empty()
    }
}
