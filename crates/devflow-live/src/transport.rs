use crate::decoder::RawMessage;
use crate::subscription::SubscriptionFilter;
use devflow_core::protocol::{encode_message, ClientMessage, FrameError};
use futures_util::{SinkExt, StreamExt};
use reqwest_eventsource::{retry, Event as SseEvent, EventSource};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

pub const SSE_FILTER_PARAM: &str = "task_ids";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
        }
    }

    /// Only duplex transports carry subscribe messages and heartbeats.
    pub fn is_duplex(&self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        match url.scheme() {
            "ws" | "wss" => Some(TransportKind::WebSocket),
            "http" | "https" => Some(TransportKind::Sse),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "sse" | "eventsource" => Ok(TransportKind::Sse),
            other => Err(format!("Unknown transport: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("event source error: {0}")]
    EventSource(String),
    #[error("transport `{0}` cannot send messages")]
    NotDuplex(TransportKind),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Lifecycle and data signals raised by a live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Opened,
    Message(RawMessage),
    Closed,
    Failed(String),
}

/// One live connection. Dropping it closes the underlying stream.
pub enum Transport {
    WebSocket(WsTransport),
    Sse(SseTransport),
}

impl Transport {
    pub async fn open(
        kind: TransportKind,
        url: Url,
        filter: Option<SubscriptionFilter>,
    ) -> Result<Self, TransportError> {
        match kind {
            TransportKind::WebSocket => {
                let (ws, _) = connect_async(url.as_str()).await?;
                Ok(Transport::WebSocket(WsTransport {
                    ws,
                    announced: false,
                }))
            }
            TransportKind::Sse => {
                let url = sse_url(&url, filter.as_ref());
                debug!(event = "live_sse_open", url = %url);
                let request = reqwest::Client::new().get(url.as_str());
                let mut es = EventSource::new(request)
                    .map_err(|err| TransportError::EventSource(err.to_string()))?;
                es.set_retry_policy(Box::new(retry::Never));
                Ok(Transport::Sse(SseTransport { es }))
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::WebSocket(_) => TransportKind::WebSocket,
            Transport::Sse(_) => TransportKind::Sse,
        }
    }

    /// Next signal; after `Closed` or `Failed` the transport is spent.
    pub async fn next_signal(&mut self) -> TransportSignal {
        match self {
            Transport::WebSocket(ws) => ws.next_signal().await,
            Transport::Sse(sse) => sse.next_signal().await,
        }
    }

    pub async fn send(
        &mut self,
        message: &ClientMessage,
        max_frame_bytes: usize,
    ) -> Result<(), TransportError> {
        match self {
            Transport::WebSocket(ws) => ws.send(message, max_frame_bytes).await,
            Transport::Sse(_) => Err(TransportError::NotDuplex(TransportKind::Sse)),
        }
    }

    pub async fn close(self) {
        match self {
            Transport::WebSocket(mut ws) => {
                let _ = ws.ws.close(None).await;
            }
            Transport::Sse(mut sse) => sse.es.close(),
        }
    }
}

pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    announced: bool,
}

impl WsTransport {
    async fn next_signal(&mut self) -> TransportSignal {
        if !self.announced {
            self.announced = true;
            return TransportSignal::Opened;
        }
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportSignal::Message(RawMessage::Text(text));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return TransportSignal::Message(RawMessage::Text(text)),
                    Err(err) => warn!(event = "live_binary_frame_dropped", error = %err),
                },
                Some(Ok(Message::Close(_))) | None => return TransportSignal::Closed,
                Some(Ok(_)) => {}
                Some(Err(err)) => return TransportSignal::Failed(err.to_string()),
            }
        }
    }

    async fn send(
        &mut self,
        message: &ClientMessage,
        max_frame_bytes: usize,
    ) -> Result<(), TransportError> {
        let text = encode_message(message, max_frame_bytes)?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }
}

pub struct SseTransport {
    es: EventSource,
}

impl SseTransport {
    async fn next_signal(&mut self) -> TransportSignal {
        match self.es.next().await {
            Some(Ok(SseEvent::Open)) => TransportSignal::Opened,
            Some(Ok(SseEvent::Message(message))) => TransportSignal::Message(RawMessage::Sse {
                event: message.event,
                data: message.data,
            }),
            Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => TransportSignal::Closed,
            Some(Err(err)) => TransportSignal::Failed(err.to_string()),
        }
    }
}

/// SSE carries the filter in the query string instead of in band.
pub fn sse_url(base: &Url, filter: Option<&SubscriptionFilter>) -> Url {
    let mut url = base.clone();
    let retained = base
        .query_pairs()
        .filter(|(key, _)| key != SSE_FILTER_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    url.set_query(None);
    let task_ids = match filter {
        Some(SubscriptionFilter::Tasks(filter)) => Some(filter.query_value()),
        _ => None,
    };
    if !retained.is_empty() || task_ids.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        if let Some(task_ids) = &task_ids {
            pairs.append_pair(SSE_FILTER_PARAM, task_ids);
        }
    }
    url
}
