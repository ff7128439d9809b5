//! Heartbeat state machine.
//!
//! One side of a connection runs a heartbeat: every interval it checks
//! whether any frame arrived since the previous check. If not, it sends a
//! ping and starts a timeout; any inbound frame before the timeout counts as
//! the answer. If the timeout elapses first the peer is declared dead.
//!
//! Both peers run the same discipline and always answer pings with pongs, so
//! a pong is just another inbound frame.
//!
//! ```text
//!            Start                 IntervalElapsed (nothing seen)
//! Stopped ─────────► Idle ───────────────────────────────► AwaitingPong
//!    ▲                ▲  ◄────────── MessageReceived ─────────┘   │
//!    │                │                                           │
//!    └────────────────┴──── Stop ─── / ── TimeoutElapsed ─────────┘
//! ```

/// Liveness state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatState {
    /// No timers armed.
    #[default]
    Stopped,
    /// Interval timer armed, no ping outstanding.
    Idle {
        /// A frame arrived since the last interval check.
        seen_packet: bool,
    },
    /// Ping sent, timeout timer armed.
    AwaitingPong,
}

/// Inputs to the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Begin (or restart) heartbeating.
    Start,
    /// Stop heartbeating.
    Stop,
    /// The interval timer fired.
    IntervalElapsed,
    /// The timeout timer fired.
    TimeoutElapsed,
    /// Any frame arrived from the peer.
    MessageReceived,
}

/// Instructions for the timer driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Arm the interval timer for one interval.
    StartIntervalTimer,
    /// Disarm the interval timer.
    CancelIntervalTimer,
    /// Arm the timeout timer.
    StartTimeoutTimer,
    /// Disarm the timeout timer.
    CancelTimeoutTimer,
    /// Send a ping to the peer.
    SendPing,
    /// Report the peer as dead.
    NotifyTimeout,
}

impl HeartbeatState {
    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: HeartbeatEvent) -> (Self, Vec<HeartbeatAction>) {
        use HeartbeatAction::*;

        match (self, event) {
            (_, HeartbeatEvent::Start) => (
                Self::Idle { seen_packet: false },
                vec![CancelIntervalTimer, CancelTimeoutTimer, StartIntervalTimer],
            ),

            (Self::Stopped, HeartbeatEvent::Stop) => (Self::Stopped, vec![]),
            (_, HeartbeatEvent::Stop) => {
                (Self::Stopped, vec![CancelIntervalTimer, CancelTimeoutTimer])
            }

            (Self::Idle { seen_packet: false }, HeartbeatEvent::IntervalElapsed) => (
                Self::AwaitingPong,
                vec![SendPing, StartTimeoutTimer, StartIntervalTimer],
            ),
            (Self::Idle { seen_packet: true }, HeartbeatEvent::IntervalElapsed) => (
                Self::Idle { seen_packet: false },
                vec![StartIntervalTimer],
            ),
            // Never a second ping while one is outstanding.
            (Self::AwaitingPong, HeartbeatEvent::IntervalElapsed) => {
                (Self::AwaitingPong, vec![StartIntervalTimer])
            }

            (Self::Idle { .. }, HeartbeatEvent::MessageReceived) => {
                (Self::Idle { seen_packet: true }, vec![])
            }
            (Self::AwaitingPong, HeartbeatEvent::MessageReceived) => (
                Self::Idle { seen_packet: true },
                vec![CancelTimeoutTimer],
            ),

            (Self::AwaitingPong, HeartbeatEvent::TimeoutElapsed) => {
                (Self::Stopped, vec![CancelIntervalTimer, NotifyTimeout])
            }

            // Stale timer fires and traffic while stopped.
            (state, _) => (state, vec![]),
        }
    }

    /// Check if timers are armed.
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Stopped)
    }

    /// Check if a ping is outstanding.
    pub fn is_awaiting_pong(&self) -> bool {
        matches!(self, Self::AwaitingPong)
    }
}
