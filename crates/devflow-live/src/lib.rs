//! Live event synchronization for the devflow task board.
//!
//! A [`LiveClient`] keeps one WebSocket or SSE connection to the backend,
//! reconnects with exponential backoff, keeps the server-side subscription
//! aligned with what the consumer wants, and reconciles every decoded
//! domain event into a local [`Cache`]: cheap field changes are patched in
//! place, anything else marks the affected collection stale and emits an
//! [`Invalidation`] for the consumer to refetch.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod invalidation;
pub mod listener;
pub mod reconcile;
pub mod subscription;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use cache::{Cache, CacheReader, CollectionKey};
pub use client::LiveClient;
pub use config::LiveConfig;
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::ClientError;
pub use invalidation::Invalidations;
pub use listener::EventListener;
pub use reconcile::{FetchResult, Invalidation};
pub use subscription::SubscriptionFilter;
pub use transport::TransportKind;
