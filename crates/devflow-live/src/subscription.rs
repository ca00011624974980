use devflow_core::protocol::{ClientMessage, TaskFilter};
use devflow_core::DomainEvent;

/// What the consumer currently wants the server to forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionFilter {
    #[default]
    All,
    Tasks(TaskFilter),
}

impl SubscriptionFilter {
    /// `None` for an empty id set, which is not a valid filter.
    pub fn tasks<I, S>(task_ids: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaskFilter::new(task_ids).map(SubscriptionFilter::Tasks)
    }

    pub fn wire_filter(&self) -> Option<TaskFilter> {
        match self {
            SubscriptionFilter::All => None,
            SubscriptionFilter::Tasks(filter) => Some(filter.clone()),
        }
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Tasks(filter) => event
                .task_id()
                .map(|task_id| filter.contains(task_id))
                .unwrap_or(true),
        }
    }
}

/// Keeps the server-side filter aligned with the desired one across
/// reconnects. The server forgets a connection's filter when it drops, so
/// every fresh connection re-asserts it.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    desired: Option<SubscriptionFilter>,
    asserted: Option<SubscriptionFilter>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(Some(SubscriptionFilter::All))
    }
}

impl SubscriptionManager {
    pub fn new(desired: Option<SubscriptionFilter>) -> Self {
        Self {
            desired,
            asserted: None,
        }
    }

    /// `None` after [`unsubscribe`](Self::unsubscribe).
    pub fn desired(&self) -> Option<&SubscriptionFilter> {
        self.desired.as_ref()
    }

    /// Filter the server is believed to hold for the current connection.
    pub fn asserted(&self) -> Option<&SubscriptionFilter> {
        self.asserted.as_ref()
    }

    pub fn in_sync(&self) -> bool {
        self.desired == self.asserted
    }

    /// Message to send right after a (re)connect, before anything else.
    pub fn on_connected(&mut self) -> Option<ClientMessage> {
        self.asserted = None;
        self.assert_desired()
    }

    pub fn on_disconnected(&mut self) {
        self.asserted = None;
    }

    /// Record a new desired filter; returns the message to send when the
    /// transport is connected.
    pub fn subscribe(
        &mut self,
        filter: SubscriptionFilter,
        connected: bool,
    ) -> Option<ClientMessage> {
        self.desired = Some(filter);
        if connected {
            self.assert_desired()
        } else {
            None
        }
    }

    pub fn unsubscribe(&mut self, connected: bool) -> Option<ClientMessage> {
        self.desired = None;
        if !connected {
            return None;
        }
        self.asserted = None;
        Some(ClientMessage::Unsubscribe)
    }

    /// Whether an inbound event falls inside the desired filter. Used on
    /// transports that cannot change the server-side filter in band.
    pub fn accepts(&self, event: &DomainEvent) -> bool {
        self.desired
            .as_ref()
            .map(|filter| filter.matches(event))
            .unwrap_or(false)
    }

    fn assert_desired(&mut self) -> Option<ClientMessage> {
        let filter = self.desired.clone()?;
        let message = ClientMessage::Subscribe {
            filter: filter.wire_filter(),
        };
        self.asserted = Some(filter);
        Some(message)
    }
}
