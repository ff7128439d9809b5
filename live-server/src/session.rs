//! Per-connection session: frame pump plus liveness.
//!
//! A session owns one open transport. It decodes inbound frames, answers
//! pings, forwards everything else to the owner and writes queued outbound
//! frames. A [`Heartbeat`] watches the inbound side; any frame counts as
//! traffic, and a heartbeat timeout closes the transport.
//!
//! Both ends of a connection run the same session, so each side detects a
//! silent peer on its own.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use live_types::{Frame, SessionId};

use crate::config::HeartbeatConfig;
use crate::heartbeat::Heartbeat;
use crate::transport::{Transport, TransportError};

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The transport closed or failed.
    PeerClosed(TransportError),
    /// Nothing arrived within the heartbeat timeout.
    HeartbeatTimeout,
    /// The owner shut the session down.
    Shutdown,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::PeerClosed(e) => write!(f, "peer closed: {}", e),
            SessionEnd::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            SessionEnd::Shutdown => write!(f, "shut down"),
        }
    }
}

/// A per-connection session.
pub struct Session {
    id: SessionId,
    transport: Arc<dyn Transport>,
    heartbeat: HeartbeatConfig,
    inbound: mpsc::UnboundedSender<Frame>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    shutdown: oneshot::Receiver<()>,
}

/// Owner's side of a running [`Session`].
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Session {
    /// Create a session over an already connected transport.
    ///
    /// Data frames (anything but ping and pong) are forwarded to `inbound`.
    pub fn new(
        transport: Arc<dyn Transport>,
        heartbeat: &HeartbeatConfig,
        inbound: mpsc::UnboundedSender<Frame>,
    ) -> (Self, SessionHandle) {
        let id = SessionId::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let session = Self {
            id,
            transport,
            heartbeat: heartbeat.clone(),
            inbound,
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            shutdown: shutdown_rx,
        };
        let handle = SessionHandle {
            id,
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
        };
        (session, handle)
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run the session until the peer goes away, the heartbeat times out or
    /// the handle shuts it down.
    pub async fn run(mut self) -> SessionEnd {
        tracing::debug!("session {}: started", self.id);

        let (timeout_tx, mut timeout_rx) = mpsc::unbounded_channel::<()>();
        let pings = self.outbound_tx.clone();
        let heartbeat = Heartbeat::from_config(
            &self.heartbeat,
            move || {
                let _ = pings.send(Frame::Ping { id: None });
            },
            move || {
                let _ = timeout_tx.send(());
            },
        );
        if let Some(heartbeat) = &heartbeat {
            heartbeat.start();
        }

        let end = loop {
            tokio::select! {
                received = self.transport.recv() => match received {
                    Ok(bytes) => {
                        if let Some(heartbeat) = &heartbeat {
                            heartbeat.message_received();
                        }
                        if let Err(e) = self.handle_inbound(&bytes).await {
                            break SessionEnd::PeerClosed(e);
                        }
                    }
                    Err(e) => break SessionEnd::PeerClosed(e),
                },
                Some(frame) = self.outbound_rx.recv() => {
                    if let Err(e) = self.send_frame(&frame).await {
                        break SessionEnd::PeerClosed(e);
                    }
                }
                Some(()) = timeout_rx.recv() => {
                    tracing::warn!("session {}: heartbeat timed out", self.id);
                    let _ = self.transport.close().await;
                    break SessionEnd::HeartbeatTimeout;
                }
                _ = &mut self.shutdown => break SessionEnd::Shutdown,
            }
        };

        if let Some(heartbeat) = &heartbeat {
            heartbeat.stop();
        }
        tracing::debug!("session {}: ended ({})", self.id, end);
        end
    }

    async fn handle_inbound(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let frame = match std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| Frame::from_json(text).ok())
        {
            Some(frame) => frame,
            None => {
                tracing::warn!("session {}: dropping undecodable frame ({} bytes)", self.id, bytes.len());
                return Ok(());
            }
        };

        match frame {
            Frame::Ping { id } => self.send_frame(&Frame::Pong { id }).await,
            Frame::Pong { .. } => Ok(()),
            data => {
                if self.inbound.send(data).is_err() {
                    tracing::trace!("session {}: inbound receiver gone", self.id);
                }
                Ok(())
            }
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let json = frame
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.transport.send(json.as_bytes()).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl SessionHandle {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame for the peer.
    ///
    /// # Errors
    ///
    /// `NotConnected` once the session has ended.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    /// Ask the session to stop. The transport is left open.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    fn heartbeat(interval_ms: u64, timeout_ms: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms,
            timeout_ms,
        }
    }

    async fn connected() -> MockTransport {
        let transport = MockTransport::new();
        transport.connect("peer").await.unwrap();
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn answers_ping_with_pong() {
        let transport = connected().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, handle) = Session::new(Arc::new(transport.clone()), &heartbeat(0, 0), tx);
        let task = tokio::spawn(session.run());

        transport.queue_frame(&Frame::Ping { id: Some("7".into()) });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.sent_frames(), vec![Frame::Pong { id: Some("7".into()) }]);
        handle.shutdown();
        assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_data_and_sends_queued_frames() {
        let transport = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, handle) = Session::new(Arc::new(transport.clone()), &heartbeat(0, 0), tx);
        let task = tokio::spawn(session.run());

        let added = Frame::Added {
            collection: "docs".into(),
            id: "a".into(),
            fields: json!({"n": 1}).as_object().cloned().unwrap(),
        };
        transport.queue_frame(&added);
        assert_eq!(rx.recv().await, Some(added));

        handle
            .send(Frame::Updated {
                methods: vec!["1".into()],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            transport.sent_frames(),
            vec![Frame::Updated {
                methods: vec!["1".into()]
            }]
        );

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_frames_are_dropped() {
        let transport = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, handle) = Session::new(Arc::new(transport.clone()), &heartbeat(0, 0), tx);
        let task = tokio::spawn(session.run());

        transport.queue_response(b"not json".to_vec());
        transport.queue_frame(&Frame::Updated { methods: vec![] });
        assert_eq!(rx.recv().await, Some(Frame::Updated { methods: vec![] }));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let transport = connected().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, _handle) = Session::new(Arc::new(transport.clone()), &heartbeat(100, 100), tx);

        let start = tokio::time::Instant::now();
        let end = session.run().await;

        assert_eq!(end, SessionEnd::HeartbeatTimeout);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(transport.sent_frames(), vec![Frame::Ping { id: None }]);
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_session_alive() {
        let transport = connected().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, handle) = Session::new(Arc::new(transport.clone()), &heartbeat(100, 100), tx);
        let task = tokio::spawn(session.run());

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            transport.queue_frame(&Frame::Pong { id: None });
        }
        assert!(!task.is_finished());
        assert!(transport.sent_frames().is_empty());

        handle.shutdown();
        assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_ends_session() {
        let transport = connected().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, _handle) = Session::new(Arc::new(transport.clone()), &heartbeat(0, 0), tx);
        let task = tokio::spawn(session.run());

        transport.simulate_disconnect();
        assert_eq!(
            task.await.unwrap(),
            SessionEnd::PeerClosed(TransportError::ConnectionClosed)
        );
    }
}
