use crate::backoff::BackoffPolicy;
use crate::error::ClientError;
use crate::subscription::SubscriptionFilter;
use crate::transport::TransportKind;
use devflow_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub url: Url,
    pub transport: TransportKind,
    pub backoff: BackoffPolicy,
    /// Ping cadence on duplex transports.
    pub heartbeat_interval: Duration,
    /// Capacity of the listener broadcast channel.
    pub event_buffer: usize,
    pub max_frame_bytes: usize,
    /// Filter asserted on the first connect; `None` starts unsubscribed.
    pub initial_filter: Option<SubscriptionFilter>,
}

impl LiveConfig {
    pub fn websocket(url: Url) -> Self {
        Self::with_transport(url, TransportKind::WebSocket)
    }

    pub fn sse(url: Url) -> Self {
        Self::with_transport(url, TransportKind::Sse)
    }

    /// `ws`/`wss` select WebSocket, `http`/`https` select SSE.
    pub fn from_url(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url)?;
        let transport = TransportKind::from_url(&url)
            .ok_or_else(|| ClientError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok(Self::with_transport(url, transport))
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_filter(mut self, filter: Option<SubscriptionFilter>) -> Self {
        self.initial_filter = filter;
        self
    }

    fn with_transport(url: Url, transport: TransportKind) -> Self {
        Self {
            url,
            transport,
            backoff: BackoffPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            initial_filter: Some(SubscriptionFilter::All),
        }
    }
}
