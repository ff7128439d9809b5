//! Reconnecting client connection.
//!
//! [`Connection`] keeps one transport connected to a server. A driver task
//! owns the [`ConnectionState`] machine from `live-core` and interprets its
//! actions:
//!
//! ```text
//! Connection API ─┐
//! connect result ─┼→ driver → ConnectionState::on_event → actions
//! session ended  ─┤                                       ├─ Connect (bounded by connect_timeout)
//! retry timer    ─┘                                       ├─ Start/StopHeartbeat (session pump)
//!                                                         ├─ ScheduleRetry / CancelRetry
//!                                                         └─ EmitStatus (watch channel)
//! ```
//!
//! Every connect attempt gets a number. Results, session ends and retry
//! timers tagged with an older attempt are stale and dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use live_core::{Action, ConnectionState, Event, StatusKind};
use live_types::Frame;

use crate::config::{Config, HeartbeatConfig};
use crate::retry::Retry;
use crate::session::{Session, SessionEnd, SessionHandle};
use crate::transport::{Transport, TransportError};

/// Snapshot of the connection status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    /// Coarse status.
    pub status: StatusKind,
    /// Whether frames can be sent right now.
    pub connected: bool,
    /// Automatic retries since the last successful connect.
    pub retry_count: u32,
    /// Delay until the next automatic attempt, while waiting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in: Option<Duration>,
    /// Reason for a permanent disconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Status {
    fn of(state: &ConnectionState, retry_in: Option<Duration>) -> Self {
        Self {
            status: state.status_kind(),
            connected: state.is_connected(),
            retry_count: state.retry_count(),
            retry_in: matches!(state, ConnectionState::Waiting { .. })
                .then_some(retry_in)
                .flatten(),
            reason: state.failure_reason().map(str::to_string),
        }
    }
}

/// A client connection that reconnects with backoff.
///
/// Dropping the connection closes the command channel; the driver then goes
/// offline and exits.
pub struct Connection {
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<Status>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Create an offline connection.
    ///
    /// Data frames received from the server are delivered on the returned
    /// receiver, across reconnects.
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = ConnectionState::new();
        let (status_tx, status_rx) = watch::channel(Status::of(&state, None));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            transport: Arc::clone(&transport),
            url: config.connection.url.clone(),
            connect_timeout: config.connection.connect_timeout(),
            heartbeat: config.heartbeat.clone(),
            retry: Retry::new(config.retry.policy()),
            state,
            attempt: 0,
            retry_in: None,
            connecting: None,
            session: None,
            status: status_tx,
            inbound: inbound_tx,
            internal_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx, internal_rx));

        let connection = Self {
            transport,
            commands: commands_tx,
            status: status_rx,
            task,
        };
        (connection, inbound_rx)
    }

    /// Start connecting.
    pub fn start(&self) {
        self.command(Event::ConnectRequested);
    }

    /// Connect now, skipping any pending backoff.
    pub fn reconnect(&self) {
        self.command(Event::ReconnectRequested);
    }

    /// Go offline. `start` or `reconnect` brings the connection back.
    pub fn disconnect(&self) {
        self.command(Event::DisconnectRequested);
    }

    /// Shut down for good. Nothing reconnects afterwards.
    pub fn force_disconnect(&self, reason: Option<String>) {
        self.command(Event::ForceDisconnect { reason });
    }

    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless the status is connected, or the transport's
    /// send error.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.status.borrow().connected {
            return Err(TransportError::NotConnected);
        }
        let json = frame
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.transport.send(json.as_bytes()).await
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Check whether the driver task has exited.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    fn command(&self, event: Event) {
        if self.commands.send(event).is_err() {
            tracing::debug!("connection driver has exited");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Results reported back to the driver by tasks and timers it started.
#[derive(Debug)]
enum Internal {
    Attempt {
        attempt: u64,
        result: Result<(), TransportError>,
    },
    SessionEnded {
        attempt: u64,
        end: SessionEnd,
    },
    RetryFired {
        attempt: u64,
    },
}

struct Driver {
    transport: Arc<dyn Transport>,
    url: String,
    connect_timeout: Duration,
    heartbeat: HeartbeatConfig,
    retry: Retry,
    state: ConnectionState,
    attempt: u64,
    retry_in: Option<Duration>,
    connecting: Option<JoinHandle<()>>,
    session: Option<(SessionHandle, JoinHandle<()>)>,
    status: watch::Sender<Status>,
    inbound: mpsc::UnboundedSender<Frame>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Event>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(event) => self.handle(event).await,
                    None => {
                        self.handle(Event::DisconnectRequested).await;
                        break;
                    }
                },
                Some(message) = internal.recv() => {
                    if let Some(event) = self.accept(message) {
                        self.handle(event).await;
                    }
                }
            }
        }
        tracing::debug!("connection driver exiting");
    }

    /// Turn a task report into a machine event, dropping stale ones.
    fn accept(&self, message: Internal) -> Option<Event> {
        match message {
            Internal::Attempt { attempt, result } if attempt == self.attempt => Some(match result {
                Ok(()) => Event::ConnectSucceeded,
                Err(e) => Event::ConnectFailed {
                    error: e.to_string(),
                },
            }),
            Internal::SessionEnded { attempt, end } if attempt == self.attempt => {
                Some(Event::ConnectionLost {
                    reason: end.to_string(),
                })
            }
            Internal::RetryFired { attempt } if attempt == self.attempt => Some(Event::RetryTimerFired),
            stale => {
                tracing::trace!("connection: ignoring stale {:?}", stale);
                None
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        match &event {
            Event::ConnectFailed { error } => tracing::warn!("connection: connect failed: {}", error),
            Event::ConnectionLost { reason } => tracing::warn!("connection: lost ({})", reason),
            _ => {}
        }
        let (next, actions) = std::mem::take(&mut self.state).on_event(event);
        self.state = next;
        for action in actions {
            self.perform(action).await;
        }
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::Connect => self.connect(),
            Action::CloseTransport => {
                if let Some(task) = self.connecting.take() {
                    task.abort();
                }
                if let Err(e) = self.transport.close().await {
                    tracing::debug!("connection: close failed: {}", e);
                }
            }
            Action::StartHeartbeat => self.start_session(),
            Action::StopHeartbeat => {
                if let Some((handle, task)) = self.session.take() {
                    handle.shutdown();
                    task.abort();
                }
            }
            Action::ScheduleRetry { count } => {
                let attempt = self.attempt;
                let internal = self.internal_tx.clone();
                let delay = self.retry.retry_later(count, move || {
                    let _ = internal.send(Internal::RetryFired { attempt });
                });
                self.retry_in = Some(delay);
            }
            Action::CancelRetry => {
                self.retry.clear();
                self.retry_in = None;
            }
            Action::EmitStatus => {
                let status = Status::of(&self.state, self.retry_in);
                tracing::info!(
                    "connection status: {} (retry_count={})",
                    status.status,
                    status.retry_count
                );
                self.status.send_replace(status);
            }
        }
    }

    fn connect(&mut self) {
        self.attempt += 1;
        self.retry_in = None;
        if let Some(task) = self.connecting.take() {
            task.abort();
        }

        let attempt = self.attempt;
        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        let limit = self.connect_timeout;
        let internal = self.internal_tx.clone();
        tracing::debug!("connection: attempt {} to {}", attempt, url);
        self.connecting = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, transport.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = internal.send(Internal::Attempt { attempt, result });
        }));
    }

    fn start_session(&mut self) {
        self.connecting = None;
        let (session, handle) = Session::new(
            Arc::clone(&self.transport),
            &self.heartbeat,
            self.inbound.clone(),
        );
        let attempt = self.attempt;
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let end = session.run().await;
            let _ = internal.send(Internal::SessionEnded { attempt, end });
        });
        self.session = Some((handle, task));
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some((_, task)) = self.session.take() {
            task.abort();
        }
    }
}
