//! Transaction scheduling.
//!
//! Readers of a store run concurrently; a writer excludes both writers and
//! readers on every store it touches, while writers over disjoint store sets
//! proceed in parallel. Requests that cannot run immediately queue FIFO and
//! are granted as soon as their conflicts drain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use docstore_common::schema::DbSchema;

use crate::error::StoreError;

/// Proof that a transaction holds its locks. Returned by
/// [`TransactionLockHelper::open_transaction`] and surrendered through
/// `transaction_complete` / `transaction_failed`.
#[derive(Debug, Clone)]
pub struct TransactionToken {
    id: u64,
    store_names: Arc<Vec<String>>,
    exclusive: bool,
}

impl TransactionToken {
    pub fn store_names(&self) -> &[String] {
        &self.store_names
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }
}

#[derive(Debug, Clone)]
pub struct TransactionLockHelper {
    inner: Arc<Mutex<LockState>>,
}

#[derive(Debug)]
struct LockState {
    known_stores: HashSet<String>,
    next_id: u64,
    exclusive_locks: HashSet<String>,
    shared_lock_counts: HashMap<String, usize>,
    active: HashSet<u64>,
    pending: VecDeque<PendingTransaction>,
    closed: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct PendingTransaction {
    store_names: Arc<Vec<String>>,
    exclusive: bool,
    grant: oneshot::Sender<TransactionToken>,
}

impl TransactionLockHelper {
    pub fn new(schema: &DbSchema) -> Self {
        TransactionLockHelper {
            inner: Arc::new(Mutex::new(LockState {
                known_stores: schema.stores.iter().map(|s| s.name.clone()).collect(),
                next_id: 0,
                exclusive_locks: HashSet::new(),
                shared_lock_counts: HashMap::new(),
                active: HashSet::new(),
                pending: VecDeque::new(),
                closed: false,
                close_waiters: Vec::new(),
            })),
        }
    }

    /// Acquires locks over `store_names`, waiting for conflicting
    /// transactions to finish first.
    pub async fn open_transaction(
        &self,
        store_names: &[String],
        write_needed: bool,
    ) -> Result<TransactionToken, StoreError> {
        let receiver = {
            let mut state = self.lock_state()?;
            if state.closed {
                return Err(StoreError::BackendUnavailable(
                    "the provider is closing".to_string(),
                ));
            }
            for name in store_names {
                if !state.known_stores.contains(name) {
                    return Err(StoreError::StoreNotFound(name.clone()));
                }
            }
            let (grant, receiver) = oneshot::channel();
            state.pending.push_back(PendingTransaction {
                store_names: Arc::new(store_names.to_vec()),
                exclusive: write_needed,
                grant,
            });
            schedule_pending(&mut state);
            receiver
        };
        receiver
            .await
            .map_err(|_| StoreError::Custom("transaction scheduling was cancelled".to_string()))
    }

    /// Releases the transaction's locks and wakes whatever can now run.
    pub fn transaction_complete(&self, token: &TransactionToken) {
        if let Ok(mut state) = self.inner.lock() {
            release(&mut state, token);
        }
    }

    /// Same lock release as completion; the failure is only reported.
    pub fn transaction_failed(&self, token: &TransactionToken, reason: &str) {
        debug!(
            stores = ?token.store_names,
            exclusive = token.exclusive,
            "transaction failed: {reason}"
        );
        self.transaction_complete(token);
    }

    /// Refuses new transactions and resolves once the last active one has
    /// finished. Pending requests that were never granted are dropped.
    pub async fn close_when_possible(&self) -> Result<(), StoreError> {
        let receiver = {
            let mut state = self.lock_state()?;
            state.closed = true;
            state.pending.clear();
            if state.active.is_empty() {
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                state.close_waiters.push(sender);
                Some(receiver)
            }
        };
        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
        Ok(())
    }

    /// Whether a writer currently holds the given store.
    pub fn has_write_lock(&self, store_name: &str) -> bool {
        self.inner
            .lock()
            .map(|state| state.exclusive_locks.contains(store_name))
            .unwrap_or(false)
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, LockState>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Custom("failed to lock the transaction scheduler".to_string()))
    }
}

fn conflicts(state: &LockState, pending: &PendingTransaction) -> bool {
    pending.store_names.iter().any(|name| {
        state.exclusive_locks.contains(name)
            || (pending.exclusive
                && state.shared_lock_counts.get(name).copied().unwrap_or(0) > 0)
    })
}

fn apply_locks(state: &mut LockState, token: &TransactionToken) {
    for name in token.store_names.iter() {
        if token.exclusive {
            state.exclusive_locks.insert(name.clone());
        } else {
            *state.shared_lock_counts.entry(name.clone()).or_insert(0) += 1;
        }
    }
    state.active.insert(token.id);
}

fn remove_locks(state: &mut LockState, token: &TransactionToken) {
    for name in token.store_names.iter() {
        if token.exclusive {
            state.exclusive_locks.remove(name);
        } else if let Some(count) = state.shared_lock_counts.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.shared_lock_counts.remove(name);
            }
        }
    }
}

fn release(state: &mut LockState, token: &TransactionToken) {
    // Ignore double releases: abort after a failed commit, drop after abort.
    if !state.active.remove(&token.id) {
        return;
    }
    remove_locks(state, token);
    schedule_pending(state);
    if state.closed && state.active.is_empty() {
        for waiter in state.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn schedule_pending(state: &mut LockState) {
    let mut still_pending = VecDeque::new();
    while let Some(pending) = state.pending.pop_front() {
        if conflicts(state, &pending) {
            still_pending.push_back(pending);
            continue;
        }
        let token = TransactionToken {
            id: state.next_id,
            store_names: pending.store_names.clone(),
            exclusive: pending.exclusive,
        };
        state.next_id += 1;
        apply_locks(state, &token);
        if pending.grant.send(token.clone()).is_err() {
            // The opener went away before the grant arrived.
            state.active.remove(&token.id);
            remove_locks(state, &token);
        }
    }
    state.pending = still_pending;
}
