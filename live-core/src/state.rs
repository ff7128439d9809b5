//! Reconnecting client state machine.
//!
//! Pure and side-effect free: the machine takes events and produces a new
//! state plus actions. Opening sockets, arming the retry timer and running
//! the heartbeat are done by the connection driver in `live-server`.
//!
//! `retry_count` counts automatic attempts since the last successful
//! connect. It resets to zero on connect and on a manual disconnect, and a
//! manual reconnect does not bump it.

use serde::Serialize;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Offline,
    /// Connection attempt in progress.
    Connecting {
        /// Automatic retries made so far.
        retry_count: u32,
    },
    /// Connected to the peer.
    Connected,
    /// Disconnected, waiting for the retry timer.
    Waiting {
        /// Automatic retries made so far.
        retry_count: u32,
    },
    /// Permanently disconnected. Nothing leaves this state.
    Failed {
        /// Why the connection was shut down.
        reason: Option<String>,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Offline state.
    pub fn new() -> Self {
        Self::Offline
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // Failed is terminal
            (state @ Self::Failed { .. }, _) => (state, vec![]),

            // From Offline
            (Self::Offline, Event::ConnectRequested | Event::ReconnectRequested) => (
                Self::Connecting { retry_count: 0 },
                vec![Action::Connect, Action::EmitStatus],
            ),

            // From Connecting
            (Self::Connecting { .. }, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![Action::StartHeartbeat, Action::EmitStatus],
            ),
            (Self::Connecting { retry_count }, Event::ConnectFailed { .. }) => (
                Self::Waiting { retry_count },
                vec![
                    Action::CloseTransport,
                    Action::ScheduleRetry { count: retry_count },
                    Action::EmitStatus,
                ],
            ),
            // Abandon the attempt in flight and start a fresh one.
            (Self::Connecting { retry_count }, Event::ReconnectRequested) => (
                Self::Connecting { retry_count },
                vec![Action::CloseTransport, Action::Connect, Action::EmitStatus],
            ),

            // From Connected
            (Self::Connected, Event::ConnectionLost { .. }) => (
                Self::Waiting { retry_count: 0 },
                vec![
                    Action::StopHeartbeat,
                    Action::CloseTransport,
                    Action::ScheduleRetry { count: 0 },
                    Action::EmitStatus,
                ],
            ),

            // From Waiting
            (Self::Waiting { retry_count }, Event::RetryTimerFired) => (
                Self::Connecting {
                    retry_count: retry_count.saturating_add(1),
                },
                vec![Action::Connect, Action::EmitStatus],
            ),
            (Self::Waiting { retry_count }, Event::ReconnectRequested) => (
                Self::Connecting { retry_count },
                vec![Action::CancelRetry, Action::Connect, Action::EmitStatus],
            ),

            // Manual disconnect from any live state
            (Self::Offline, Event::DisconnectRequested) => (Self::Offline, vec![]),
            (state, Event::DisconnectRequested) => (Self::Offline, teardown(&state)),

            (state, Event::ForceDisconnect { reason }) => {
                let actions = teardown(&state);
                (Self::Failed { reason }, actions)
            }

            // Stale or out-of-order events - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Waiting { .. })
    }

    /// Automatic retries since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Connecting { retry_count } | Self::Waiting { retry_count } => *retry_count,
            _ => 0,
        }
    }

    /// Coarse status for observers.
    pub fn status_kind(&self) -> StatusKind {
        match self {
            Self::Offline => StatusKind::Offline,
            Self::Connecting { .. } => StatusKind::Connecting,
            Self::Connected => StatusKind::Connected,
            Self::Waiting { .. } => StatusKind::Waiting,
            Self::Failed { .. } => StatusKind::Failed,
        }
    }

    /// Reason given for a permanent disconnect, if any.
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => reason.as_deref(),
            _ => None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn teardown(state: &ConnectionState) -> Vec<Action> {
    let mut actions = Vec::new();
    match state {
        ConnectionState::Connected => {
            actions.push(Action::StopHeartbeat);
            actions.push(Action::CloseTransport);
        }
        ConnectionState::Connecting { .. } => actions.push(Action::CloseTransport),
        ConnectionState::Waiting { .. } => actions.push(Action::CancelRetry),
        ConnectionState::Offline | ConnectionState::Failed { .. } => {}
    }
    actions.push(Action::EmitStatus);
    actions
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked to connect for the first time.
    ConnectRequested,
    /// Transport connection succeeded.
    ConnectSucceeded,
    /// Transport connection failed or timed out.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An established connection dropped (transport error or heartbeat timeout).
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// The retry timer fired.
    RetryTimerFired,
    /// Caller asked to reconnect now.
    ReconnectRequested,
    /// Caller asked to go offline.
    DisconnectRequested,
    /// Caller shut the connection down for good.
    ForceDisconnect {
        /// Reason reported in the status.
        reason: Option<String>,
    },
}

/// Actions to be executed by the connection driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport.
    Connect,
    /// Close the transport.
    CloseTransport,
    /// Begin heartbeating on the open transport.
    StartHeartbeat,
    /// Stop heartbeating.
    StopHeartbeat,
    /// Arm the retry timer with the backoff for attempt `count`.
    ScheduleRetry {
        /// Attempt number passed to the backoff policy.
        count: u32,
    },
    /// Disarm the retry timer.
    CancelRetry,
    /// Publish the new status to observers.
    EmitStatus,
}

/// Coarse connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Connected to the peer.
    Connected,
    /// Connection attempt in progress.
    Connecting,
    /// Permanently disconnected.
    Failed,
    /// Waiting to retry.
    Waiting,
    /// Deliberately disconnected.
    Offline,
}

impl StatusKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Connected => "connected",
            StatusKind::Connecting => "connecting",
            StatusKind::Failed => "failed",
            StatusKind::Waiting => "waiting",
            StatusKind::Offline => "offline",
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
