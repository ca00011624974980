use crate::cache::{self, CacheReader};
use crate::config::LiveConfig;
use crate::connection::{
    ConnectionState, ConnectionStatus, Directive, DropReason, ReconnectController,
};
use crate::decoder::EventDecoder;
use crate::error::ClientError;
use crate::invalidation::{self, Invalidations};
use crate::listener::EventListener;
use crate::reconcile::{FetchResult, Reconciler};
use crate::subscription::{SubscriptionFilter, SubscriptionManager};
use crate::transport::{Transport, TransportError, TransportSignal};
use devflow_core::protocol::{ClientMessage, ServerMessage};
use devflow_core::{DomainEvent, EventKind};
use futures_util::future::BoxFuture;
use std::collections::BTreeSet;
use std::future;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Subscribe(SubscriptionFilter),
    Unsubscribe,
    ApplyFetch(FetchResult),
    ResetProject,
    Dispose,
}

/// Handle to one live synchronization instance.
///
/// Commands are queued to a driver task that owns the transport, the
/// reconnection controller and the reconciliation engine; observers read
/// connection status, the cache, reconciled events and invalidations.
/// Dropping the handle stops the driver.
pub struct LiveClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    server_error: watch::Receiver<Option<String>>,
    cache: CacheReader,
    events: broadcast::Receiver<DomainEvent>,
    invalidations: Option<Invalidations>,
    driver: JoinHandle<()>,
}

impl LiveClient {
    /// Starts the driver on the current tokio runtime. The client stays
    /// disconnected until [`connect`](Self::connect).
    pub fn spawn(config: LiveConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let (server_error_tx, server_error) = watch::channel(None);
        let (events_tx, events) = broadcast::channel(config.event_buffer.max(1));
        let (invalidations_tx, invalidations) = invalidation::queue();
        let (writer, cache) = cache::shared();

        let driver = Driver {
            controller: ReconnectController::new(config.backoff, config.transport.is_duplex()),
            subscription: SubscriptionManager::new(config.initial_filter.clone()),
            decoder: EventDecoder::new(config.max_frame_bytes),
            reconciler: Reconciler::new(writer, invalidations_tx, events_tx),
            status_tx,
            server_error_tx,
            transport: None,
            opening: None,
            retry_at: None,
            heartbeat: None,
            config,
        };
        let driver = tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            status,
            server_error,
            cache,
            events,
            invalidations: Some(invalidations),
            driver,
        }
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<(), ClientError> {
        self.send(Command::Subscribe(filter))
    }

    pub fn unsubscribe(&self) -> Result<(), ClientError> {
        self.send(Command::Unsubscribe)
    }

    /// Hands an authoritative fetch result to the reconciliation engine.
    pub fn apply_fetch(&self, result: FetchResult) -> Result<(), ClientError> {
        self.send(Command::ApplyFetch(result))
    }

    pub fn reset_project(&self) -> Result<(), ClientError> {
        self.send(Command::ResetProject)
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Latest error notice from the server; cleared by the next `subscribed`.
    pub fn server_error(&self) -> watch::Receiver<Option<String>> {
        self.server_error.clone()
    }

    pub fn cache(&self) -> CacheReader {
        self.cache.clone()
    }

    /// Listener for the given kinds only.
    pub fn listen(&self, kinds: impl IntoIterator<Item = EventKind>) -> EventListener {
        let kinds = kinds.into_iter().collect::<BTreeSet<_>>();
        EventListener::new(self.events.resubscribe(), Some(kinds))
    }

    pub fn listen_all(&self) -> EventListener {
        EventListener::new(self.events.resubscribe(), None)
    }

    /// Queue of refetch requests, coalesced per collection. There is one
    /// consumer; later calls get `None`.
    pub fn take_invalidations(&mut self) -> Option<Invalidations> {
        self.invalidations.take()
    }

    /// Disconnects and waits for the driver to finish.
    pub async fn dispose(self) {
        let _ = self.commands.send(Command::Dispose);
        if let Err(err) = self.driver.await {
            warn!(event = "live_driver_join_error", error = %err);
        }
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

enum Wake {
    Command(Option<Command>),
    Opened(Result<Transport, TransportError>),
    Signal(TransportSignal),
    Retry,
    Heartbeat,
}

struct Driver {
    config: LiveConfig,
    controller: ReconnectController,
    subscription: SubscriptionManager,
    decoder: EventDecoder,
    reconciler: Reconciler,
    status_tx: watch::Sender<ConnectionStatus>,
    server_error_tx: watch::Sender<Option<String>>,
    transport: Option<Transport>,
    opening: Option<BoxFuture<'static, Result<Transport, TransportError>>>,
    retry_at: Option<Instant>,
    heartbeat: Option<Interval>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            event = "live_client_started",
            transport = %self.config.transport,
            url = %self.config.url
        );
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                opened = next_opened(&mut self.opening) => Wake::Opened(opened),
                signal = next_signal(&mut self.transport) => Wake::Signal(signal),
                _ = retry_due(self.retry_at) => Wake::Retry,
                _ = heartbeat_due(&mut self.heartbeat) => Wake::Heartbeat,
            };
            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Dispose)) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Opened(opened) => self.handle_opened(opened).await,
                Wake::Signal(signal) => self.handle_signal(signal).await,
                Wake::Retry => {
                    self.retry_at = None;
                    let directives = self.controller.on_retry_timer();
                    self.execute(directives).await;
                }
                Wake::Heartbeat => self.send(ClientMessage::Ping).await,
            }
        }
        let directives = self.controller.disconnect();
        self.execute(directives).await;
        info!(event = "live_client_stopped", dropped_messages = self.decoder.dropped());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let directives = self.controller.connect();
                self.execute(directives).await;
            }
            Command::Disconnect => {
                let directives = self.controller.disconnect();
                self.execute(directives).await;
            }
            Command::Subscribe(filter) => {
                if self.config.transport.is_duplex() {
                    if let Some(message) = self.subscription.subscribe(filter, self.connected()) {
                        self.send(message).await;
                    }
                    return;
                }
                let changed = self.subscription.desired() != Some(&filter);
                self.subscription.subscribe(filter, false);
                if changed {
                    debug!(event = "live_sse_filter_changed");
                    let directives = self.controller.restart();
                    self.execute(directives).await;
                }
            }
            Command::Unsubscribe => {
                let connected = self.config.transport.is_duplex() && self.connected();
                if let Some(message) = self.subscription.unsubscribe(connected) {
                    self.send(message).await;
                }
            }
            Command::ApplyFetch(result) => self.reconciler.apply_fetch(result),
            Command::ResetProject => self.reconciler.reset_project(),
            Command::Dispose => {}
        }
    }

    async fn handle_opened(&mut self, opened: Result<Transport, TransportError>) {
        self.opening = None;
        match opened {
            Ok(transport) => self.transport = Some(transport),
            Err(err) => {
                warn!(event = "live_connect_error", error = %err);
                let directives = self.controller.on_drop(DropReason::Failed);
                self.execute(directives).await;
            }
        }
    }

    async fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Opened => {
                let directives = self.controller.on_open();
                if self.controller.state() != ConnectionState::Connected {
                    return;
                }
                self.execute(directives).await;
                // The server forgets filters per connection; re-assert before
                // anything else goes out.
                if let Some(message) = self.subscription.on_connected() {
                    if self.config.transport.is_duplex() {
                        self.send(message).await;
                    }
                }
            }
            TransportSignal::Message(raw) => {
                if let Some(message) = self.decoder.decode(&raw) {
                    self.handle_server_message(message);
                }
            }
            TransportSignal::Closed => {
                info!(event = "live_transport_closed");
                let directives = self.controller.on_drop(DropReason::Closed);
                self.execute(directives).await;
            }
            TransportSignal::Failed(reason) => {
                warn!(event = "live_transport_error", error = %reason);
                let directives = self.controller.on_drop(DropReason::Failed);
                self.execute(directives).await;
            }
        }
    }

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Event { envelope } => {
                let event = envelope.event;
                if !self.subscription.accepts(&event) {
                    debug!(event = "live_event_filtered", kind = %event.kind_str());
                    return;
                }
                self.reconciler.apply(event);
            }
            ServerMessage::Subscribed => {
                debug!(event = "live_subscribed");
                self.server_error_tx.send_if_modified(|current| current.take().is_some());
            }
            ServerMessage::Unsubscribed => debug!(event = "live_unsubscribed"),
            ServerMessage::Pong => debug!(event = "live_pong"),
            ServerMessage::Error { message } => {
                warn!(event = "live_server_error", error = %message);
                self.server_error_tx.send_replace(Some(message));
            }
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(err) = transport.send(&message, self.config.max_frame_bytes).await {
            warn!(event = "live_send_error", error = %err);
            let directives = self.controller.on_drop(DropReason::Failed);
            self.execute(directives).await;
        }
    }

    fn connected(&self) -> bool {
        self.transport.is_some() && self.controller.state() == ConnectionState::Connected
    }

    async fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::OpenTransport => {
                    let open = Transport::open(
                        self.config.transport,
                        self.config.url.clone(),
                        self.subscription.desired().cloned(),
                    );
                    self.opening = Some(Box::pin(open));
                }
                Directive::CloseTransport => {
                    self.opening = None;
                    if let Some(transport) = self.transport.take() {
                        transport.close().await;
                    }
                    self.subscription.on_disconnected();
                }
                Directive::ScheduleRetry(delay) => self.retry_at = Some(Instant::now() + delay),
                Directive::CancelRetry => self.retry_at = None,
                Directive::StartHeartbeat => {
                    let period = self.config.heartbeat_interval;
                    let mut heartbeat = interval_at(Instant::now() + period, period);
                    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(heartbeat);
                }
                Directive::StopHeartbeat => self.heartbeat = None,
            }
        }
        let status = self.controller.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(event = "live_status", state = %status.state, attempt = status.attempt);
            *current = status;
            true
        });
    }
}

async fn next_opened(
    opening: &mut Option<BoxFuture<'static, Result<Transport, TransportError>>>,
) -> Result<Transport, TransportError> {
    match opening {
        Some(open) => open.await,
        None => future::pending().await,
    }
}

async fn next_signal(transport: &mut Option<Transport>) -> TransportSignal {
    match transport {
        Some(transport) => transport.next_signal().await,
        None => future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}

async fn heartbeat_due(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => future::pending().await,
    }
}
