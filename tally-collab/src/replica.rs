//! Narrow contract the engine needs from a document replica.
//!
//! The merge algorithm lives behind [`DocumentReplica`]; the engine only
//! applies remote updates, asks for diffs against a peer's state vector and
//! listens for mutations. Every mutation notification carries an [`Origin`],
//! which is what keeps remote updates from being sent back out.
//!
//! [`YrsReplica`] is the implementation shipped with the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// Who authored a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this participant.
    Local,
    /// Received from another participant through the channel.
    Remote,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// The bytes are not a valid update or state vector.
    #[error("Failed to decode replica payload: {0}")]
    Decode(String),
    /// A well-formed update could not be integrated.
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// Listener invoked with the encoded update and its origin.
pub type MutationCallback = Box<dyn Fn(&[u8], Origin) + Send + Sync>;

/// Operations the engine consumes from a replicated document.
///
/// Merges must be idempotent and commutative; the engine relies on that and
/// never reorders or deduplicates updates itself.
pub trait DocumentReplica: Send + Sync + 'static {
    /// Integrate an encoded update. Listeners observe it with `origin`.
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), ReplicaError>;

    /// Encode everything this replica has that `state_vector` does not cover.
    /// An empty slice stands for an empty state vector.
    fn generate_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError>;

    /// Encoded summary of which updates this replica holds.
    fn state_vector(&self) -> Vec<u8>;

    /// Register a mutation listener; it stays registered until the returned
    /// [`Subscription`] is dropped.
    fn on_mutation(&self, callback: MutationCallback) -> Subscription;
}

/// Registry of mutation listeners, shared by replica implementations.
#[derive(Default)]
pub struct MutationListeners {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Arc<MutationCallback>>>,
}

impl MutationListeners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, callback: MutationCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            listeners: Arc::downgrade(self),
        }
    }

    /// Call every listener. The registry lock is released before callbacks
    /// run, so a callback may subscribe or drop subscriptions.
    pub fn notify(&self, update: &[u8], origin: Origin) {
        let callbacks: Vec<Arc<MutationCallback>> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(update, origin);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Handle for a registered mutation listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<MutationListeners>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// [`DocumentReplica`] backed by a `yrs::Doc`.
///
/// Local edits must go through [`YrsReplica::edit`] so they are announced
/// with [`Origin::Local`].
pub struct YrsReplica {
    doc: Doc,
    listeners: Arc<MutationListeners>,
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsReplica {
    pub fn new() -> Self {
        Self::with_doc(Doc::new())
    }

    /// Wrap an existing document, e.g. one pre-loaded from storage.
    pub fn with_doc(doc: Doc) -> Self {
        Self {
            doc,
            listeners: MutationListeners::new(),
        }
    }

    /// The underlying document, for reads and for obtaining shared types.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Run a local edit in one transaction and announce the resulting update.
    pub fn edit<T>(&self, f: impl FnOnce(&mut TransactionMut) -> T) -> T {
        let (out, update) = {
            let mut txn = self.doc.transact_mut();
            let out = f(&mut txn);
            (out, txn.encode_update_v1())
        };
        if update != EMPTY_UPDATE_V1 {
            log::trace!("Local edit produced {} byte update", update.len());
            self.listeners.notify(&update, Origin::Local);
        }
        out
    }
}

impl DocumentReplica for YrsReplica {
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), ReplicaError> {
        if update.is_empty() {
            return Ok(());
        }
        let decoded =
            Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        self.listeners.notify(update, origin);
        Ok(())
    }

    fn generate_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector)
                .map_err(|e| ReplicaError::Decode(e.to_string()))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn on_mutation(&self, callback: MutationCallback) -> Subscription {
        self.listeners.subscribe(callback)
    }
}
