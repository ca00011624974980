//! Refetch requests owed to the consumer.
//!
//! Requests are coalesced per collection: while a key is still waiting to be
//! read, further invalidations of the same key fold into the queued entry.
//! The queue therefore never holds more entries than there are distinct
//! collections, whether or not anyone reads it.

use crate::cache::CollectionKey;
use crate::reconcile::Invalidation;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Invalidation>,
    sender_gone: bool,
    receiver_gone: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn queue() -> (InvalidationSender, Invalidations) {
    let shared = Arc::new(Shared::default());
    (
        InvalidationSender {
            shared: shared.clone(),
        },
        Invalidations { shared },
    )
}

pub(crate) struct InvalidationSender {
    shared: Arc<Shared>,
}

impl InvalidationSender {
    /// Queues `key`, folding it into an entry already waiting for the same
    /// collection. Returns `false` once the receiver is gone.
    pub(crate) fn push(&self, key: &CollectionKey, cause: &str) -> bool {
        let mut state = self.shared.lock();
        if state.receiver_gone {
            return false;
        }
        if state.pending.iter().any(|queued| &queued.key == key) {
            return true;
        }
        state.pending.push_back(Invalidation {
            key: key.clone(),
            cause: cause.to_string(),
        });
        drop(state);
        self.shared.notify.notify_one();
        true
    }
}

impl Drop for InvalidationSender {
    fn drop(&mut self) {
        self.shared.lock().sender_gone = true;
        self.shared.notify.notify_one();
    }
}

/// Receiving end of the refetch queue. Each entry keeps the cause of the
/// first invalidation that queued it.
#[derive(Debug)]
pub struct Invalidations {
    shared: Arc<Shared>,
}

impl Invalidations {
    /// Next refetch request; `None` once the client is gone and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<Invalidation> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            match self.try_recv() {
                Ok(invalidation) => return Some(invalidation),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => notified.await,
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Invalidation, TryRecvError> {
        let mut state = self.shared.lock();
        match state.pending.pop_front() {
            Some(invalidation) => Ok(invalidation),
            None if state.sender_gone => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Requests waiting to be read.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl Drop for Invalidations {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receiver_gone = true;
        state.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_folds_into_the_waiting_entry() {
        let (tx, mut rx) = queue();
        let sessions = CollectionKey::Sessions("t1".to_string());
        assert!(tx.push(&sessions, "session.ended"));
        assert!(tx.push(&CollectionKey::Tasks, "task.created"));
        for _ in 0..1_000 {
            assert!(tx.push(&sessions, "phase.completed"));
        }
        assert_eq!(rx.pending(), 2);

        let first = rx.try_recv().expect("first");
        assert_eq!(first.key, sessions);
        assert_eq!(first.cause, "session.ended");
        assert_eq!(rx.try_recv().expect("second").key, CollectionKey::Tasks);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        // Once read, the key queues again.
        assert!(tx.push(&sessions, "phase.completed"));
        assert_eq!(rx.try_recv().expect("requeued").cause, "phase.completed");
    }

    #[test]
    fn dropped_receiver_stops_queuing() {
        let (tx, rx) = queue();
        drop(rx);
        assert!(!tx.push(&CollectionKey::Tasks, "project_reset"));
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_after_sender_drops() {
        let (tx, mut rx) = queue();
        let reader = tokio::spawn(async move {
            let mut keys = Vec::new();
            while let Some(invalidation) = rx.recv().await {
                keys.push(invalidation.key);
            }
            keys
        });
        tokio::task::yield_now().await;
        tx.push(&CollectionKey::Findings("t1".to_string()), "review.completed");
        drop(tx);
        let keys = reader.await.expect("reader");
        assert_eq!(keys, vec![CollectionKey::Findings("t1".to_string())]);
    }
}
