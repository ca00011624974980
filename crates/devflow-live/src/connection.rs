//! Reconnection state machine.
//!
//! The controller performs no I/O. Each input returns the [`Directive`]s the
//! driver must carry out (open or drop the transport, arm or cancel the retry
//! timer, start or stop the heartbeat), which keeps the lifecycle rules
//! testable without sockets or clocks.

use crate::backoff::BackoffPolicy;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    pub retry_pending: bool,
}

impl ConnectionStatus {
    /// In error with no retry coming; only an explicit connect recovers.
    pub fn is_exhausted(&self) -> bool {
        self.state == ConnectionState::Error && !self.retry_pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    OpenTransport,
    CloseTransport,
    ScheduleRetry(Duration),
    CancelRetry,
    StartHeartbeat,
    StopHeartbeat,
}

/// Why a live transport went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The peer closed the stream cleanly.
    Closed,
    /// Open failed, or the stream errored.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    duplex: bool,
    state: ConnectionState,
    attempt: u32,
    auto_reconnect: bool,
    transport_live: bool,
    retry_pending: bool,
    heartbeat_running: bool,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy, duplex: bool) -> Self {
        Self {
            policy,
            duplex,
            state: ConnectionState::Disconnected,
            attempt: 0,
            auto_reconnect: false,
            transport_live: false,
            retry_pending: false,
            heartbeat_running: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn transport_live(&self) -> bool {
        self.transport_live
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            retry_pending: self.retry_pending,
        }
    }

    /// Explicit connect. A no-op while connecting or connected; otherwise
    /// starts a fresh attempt budget.
    pub fn connect(&mut self) -> Vec<Directive> {
        if self.transport_live {
            return Vec::new();
        }
        let mut directives = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            directives.push(Directive::CancelRetry);
        }
        self.auto_reconnect = true;
        self.attempt = 0;
        self.begin_attempt(&mut directives);
        directives
    }

    /// Explicit disconnect: the only input that stops retries for good.
    pub fn disconnect(&mut self) -> Vec<Directive> {
        self.auto_reconnect = false;
        let mut directives = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            directives.push(Directive::CancelRetry);
        }
        self.stop_heartbeat(&mut directives);
        if self.transport_live {
            self.transport_live = false;
            directives.push(Directive::CloseTransport);
        }
        self.state = ConnectionState::Disconnected;
        directives
    }

    pub fn on_open(&mut self) -> Vec<Directive> {
        if !self.transport_live || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.attempt = 0;
        self.state = ConnectionState::Connected;
        info!(event = "live_connected");
        let mut directives = Vec::new();
        if self.duplex {
            self.heartbeat_running = true;
            directives.push(Directive::StartHeartbeat);
        }
        directives
    }

    pub fn on_drop(&mut self, reason: DropReason) -> Vec<Directive> {
        if !self.transport_live {
            return Vec::new();
        }
        self.transport_live = false;
        let mut directives = Vec::new();
        self.stop_heartbeat(&mut directives);
        directives.push(Directive::CloseTransport);

        self.state = match reason {
            DropReason::Closed => ConnectionState::Disconnected,
            DropReason::Failed => ConnectionState::Error,
        };
        if !self.auto_reconnect {
            return directives;
        }

        let failures = self.attempt.saturating_add(1);
        if !self.policy.allows_retry(failures) {
            self.attempt = failures;
            self.state = ConnectionState::Error;
            error!(event = "live_reconnect_exhausted", attempts = failures);
            return directives;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = failures;
        self.retry_pending = true;
        warn!(
            event = "live_reconnect_scheduled",
            attempt = failures,
            delay_ms = delay.as_millis() as u64
        );
        directives.push(Directive::ScheduleRetry(delay));
        directives
    }

    pub fn on_retry_timer(&mut self) -> Vec<Directive> {
        if !self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = false;
        let mut directives = Vec::new();
        if self.auto_reconnect && !self.transport_live {
            self.begin_attempt(&mut directives);
        }
        directives
    }

    /// Replace a live transport immediately, e.g. when the SSE filter changes.
    /// Does not touch the attempt budget.
    pub fn restart(&mut self) -> Vec<Directive> {
        if !self.transport_live {
            return Vec::new();
        }
        let mut directives = Vec::new();
        self.stop_heartbeat(&mut directives);
        directives.push(Directive::CloseTransport);
        self.transport_live = false;
        self.begin_attempt(&mut directives);
        directives
    }

    fn begin_attempt(&mut self, directives: &mut Vec<Directive>) {
        self.state = ConnectionState::Connecting;
        self.transport_live = true;
        directives.push(Directive::OpenTransport);
    }

    fn stop_heartbeat(&mut self, directives: &mut Vec<Directive>) {
        if self.heartbeat_running {
            self.heartbeat_running = false;
            directives.push(Directive::StopHeartbeat);
        }
    }
}
