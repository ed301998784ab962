//! Local transactions with volatile two-phase participants.
//!
//! A [`Transaction`] is passed explicitly to `send`/`receive`. Operations
//! performed under an active transaction are enlisted as
//! [`PendingOperation`]s and only take effect at the broker when the
//! transaction commits:
//!
//! - a deferred **send** transmits nothing until commit, and nothing at all
//!   after a rollback;
//! - a deferred **acknowledgement** leaves the lease in place until commit; a
//!   rollback lets the lease expire so the broker redelivers the message.

use crate::broker::LeasedMessage;
use crate::error::TransportError;
use crate::receiver::acknowledge;
use crate::sender::Delivery;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;

/// Vote cast by a participant during the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    Prepared,
    ForceRollback,
}

/// A non-durable participant driven through prepare, then commit or rollback
///
/// `commit` and `rollback` consume the participant, so each outcome is
/// delivered exactly once.
#[async_trait]
pub trait EnlistmentNotification: Send + Sync {
    async fn prepare(&self) -> PrepareVote;

    async fn commit(self: Box<Self>) -> Result<(), TransportError>;

    async fn rollback(self: Box<Self>);
}

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Completing,
    Committed,
    RolledBack,
    Aborted,
}

struct TransactionState {
    status: TransactionStatus,
    participants: Vec<Box<dyn EnlistmentNotification>>,
}

/// Explicit unit of work collecting deferred transport effects
pub struct Transaction {
    id: Uuid,
    state: Mutex<TransactionState>,
}

impl Transaction {
    /// Begin a new active transaction
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(TransactionState {
                status: TransactionStatus::Active,
                participants: Vec::new(),
            }),
        }
    }

    /// Transaction identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.lock().status
    }

    /// Check whether operations can still be enlisted
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Number of participants waiting for the outcome
    pub fn enlisted(&self) -> usize {
        self.lock().participants.len()
    }

    /// Register a participant to be driven by this transaction's outcome
    ///
    /// # Errors
    ///
    /// Returns `TransportError::TransactionInactive` once commit or rollback
    /// has started.
    pub fn enlist_volatile(
        &self,
        participant: Box<dyn EnlistmentNotification>,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.status != TransactionStatus::Active {
            return Err(TransportError::TransactionInactive);
        }

        state.participants.push(participant);
        debug!(
            transaction_id = %self.id,
            enlisted = state.participants.len(),
            "Participant enlisted"
        );
        Ok(())
    }

    /// Prepare every participant, then commit them in enlistment order
    ///
    /// Every participant is committed even if an earlier one fails; the
    /// failures are reported together.
    ///
    /// # Errors
    ///
    /// - `TransactionInactive` if the transaction already completed
    /// - `TransactionAborted` if a participant voted to roll back
    /// - `CommitFailed` if one or more participants failed to commit
    pub async fn commit(&self) -> Result<(), TransportError> {
        let participants = self.begin_completion()?;

        for participant in &participants {
            if participant.prepare().await == PrepareVote::ForceRollback {
                warn!(
                    transaction_id = %self.id,
                    "Participant forced rollback during prepare"
                );
                for participant in participants {
                    participant.rollback().await;
                }
                self.finish(TransactionStatus::Aborted);
                return Err(TransportError::TransactionAborted);
            }
        }

        let operations = participants.len();
        let mut failures = Vec::new();
        for participant in participants {
            if let Err(e) = participant.commit().await {
                warn!(
                    transaction_id = %self.id,
                    error = %e,
                    "Enlisted operation failed during commit"
                );
                failures.push(e);
            }
        }
        self.finish(TransactionStatus::Committed);

        let failed = failures.len();
        match failures.into_iter().next() {
            None => {
                info!(transaction_id = %self.id, operations, "Transaction committed");
                Ok(())
            }
            Some(first) => Err(TransportError::CommitFailed {
                failures: failed,
                first: Box::new(first),
            }),
        }
    }

    /// Roll back every participant
    ///
    /// # Errors
    ///
    /// Returns `TransportError::TransactionInactive` if the transaction
    /// already completed.
    pub async fn rollback(&self) -> Result<(), TransportError> {
        let participants = self.begin_completion()?;
        let operations = participants.len();

        for participant in participants {
            participant.rollback().await;
        }
        self.finish(TransactionStatus::RolledBack);

        info!(transaction_id = %self.id, operations, "Transaction rolled back");
        Ok(())
    }

    fn begin_completion(&self) -> Result<Vec<Box<dyn EnlistmentNotification>>, TransportError> {
        let mut state = self.lock();
        if state.status != TransactionStatus::Active {
            return Err(TransportError::TransactionInactive);
        }

        state.status = TransactionStatus::Completing;
        Ok(std::mem::take(&mut state.participants))
    }

    fn finish(&self, status: TransactionStatus) {
        self.lock().status = status;
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("enlisted", &self.enlisted())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if state.status == TransactionStatus::Active && !state.participants.is_empty() {
            warn!(
                transaction_id = %self.id,
                discarded = state.participants.len(),
                "Transaction dropped without commit; pending operations discarded"
            );
        }
    }
}

// ============================================================================
// Pending transport operations
// ============================================================================

/// Kind of deferred effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Send,
    Ack,
}

/// A transport effect deferred until the transaction outcome is known
pub enum PendingOperation {
    /// Run the throttling-aware delivery on commit
    Send(Delivery),
    /// Acknowledge the leased message on commit
    Ack(Box<dyn LeasedMessage>),
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Send(_) => OperationKind::Send,
            Self::Ack(_) => OperationKind::Ack,
        }
    }
}

#[async_trait]
impl EnlistmentNotification for PendingOperation {
    async fn prepare(&self) -> PrepareVote {
        // Nothing durable to flush
        PrepareVote::Prepared
    }

    async fn commit(self: Box<Self>) -> Result<(), TransportError> {
        match *self {
            Self::Send(delivery) => delivery.run().await,
            Self::Ack(message) => acknowledge(message.as_ref()).await.map(|_| ()),
        }
    }

    async fn rollback(self: Box<Self>) {
        match *self {
            Self::Send(delivery) => {
                debug!(
                    queue = %delivery.queue_name(),
                    message_id = %delivery.message_id(),
                    "Deferred send discarded"
                );
            }
            Self::Ack(message) => {
                debug!(
                    lock_token = message.lock_token(),
                    "Acknowledgement discarded; lease left to expire"
                );
            }
        }
    }
}
