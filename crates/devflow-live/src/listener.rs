use devflow_core::{DomainEvent, EventKind};
use std::collections::BTreeSet;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// Live feed of reconciled events for consumers that need more than the
/// cache (toasts, log panes). A listener bound to specific kinds never sees
/// unrecognised events; a generic listener sees everything.
#[derive(Debug)]
pub struct EventListener {
    rx: broadcast::Receiver<DomainEvent>,
    kinds: Option<BTreeSet<EventKind>>,
}

impl EventListener {
    pub(crate) fn new(
        rx: broadcast::Receiver<DomainEvent>,
        kinds: Option<BTreeSet<EventKind>>,
    ) -> Self {
        Self { rx, kinds }
    }

    pub fn wants(&self, event: &DomainEvent) -> bool {
        match (&self.kinds, event.kind()) {
            (None, _) => true,
            (Some(kinds), Some(kind)) => kinds.contains(&kind),
            (Some(_), None) => false,
        }
    }

    /// Next matching event; `None` once the client is gone. Events missed
    /// because this listener fell behind are skipped with a warning.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(event = "live_listener_lagged", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(event = "live_listener_lagged", missed);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
