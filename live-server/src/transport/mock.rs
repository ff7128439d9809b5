//! Mock transport for testing.
//!
//! Allows queueing inbound frames and capturing sent frames for verification.
//! `recv()` waits for a queued frame instead of failing on an empty queue, so
//! silence on the wire looks like silence.

use super::{Transport, TransportError};
use async_trait::async_trait;
use live_types::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one clone while the code under
/// test owns another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    wake: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_count: usize,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    fail_next_connect: Option<String>,
    stall_next_connect: bool,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue raw bytes to be returned by `recv()`.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.lock().receive_queue.push_back(data);
        self.wake.notify_waiters();
    }

    /// Queue a frame to be returned by `recv()`.
    pub fn queue_frame(&self, frame: &Frame) {
        if let Ok(json) = frame.to_json() {
            self.queue_response(json.into_bytes());
        }
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.lock().sent_messages.clone()
    }

    /// Get all sent messages that decode as frames.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.lock()
            .sent_messages
            .iter()
            .filter_map(|bytes| std::str::from_utf8(bytes).ok())
            .filter_map(|text| Frame::from_json(text).ok())
            .collect()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        self.lock().connected_address.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next connect() to hang forever.
    pub fn stall_next_connect(&self) {
        self.lock().stall_next_connect = true;
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
        self.wake.notify_waiters();
    }

    /// Drop the connection from the peer's side.
    pub fn simulate_disconnect(&self) {
        self.lock().connected = false;
        self.wake.notify_waiters();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let stall = {
            let mut inner = self.lock();

            // Check for forced failure
            if let Some(error) = inner.fail_next_connect.take() {
                return Err(TransportError::ConnectionFailed(error));
            }
            std::mem::take(&mut inner.stall_next_connect)
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut inner = self.lock();
        inner.connected = true;
        inner.connected_address = Some(address.to_string());
        inner.connect_count += 1;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            // Register before checking so a wake between check and await is not lost.
            let notified = self.wake.notified();
            {
                let mut inner = self.lock();

                if !inner.connected {
                    return Err(TransportError::ConnectionClosed);
                }

                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }

                if let Some(data) = inner.receive_queue.pop_front() {
                    return Ok(data);
                }
            }
            notified.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        self.wake.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("localhost:3000").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(
            transport.connected_address(),
            Some("localhost:3000".to_string())
        );
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_sends_messages() {
        let transport = MockTransport::new();
        transport.connect("node").await.unwrap();

        transport.send(b"message 1").await.unwrap();
        transport.send(b"message 2").await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"message 1");
        assert_eq!(sent[1], b"message 2");
    }

    #[tokio::test]
    async fn mock_transport_receives_queued_frames() {
        let transport = MockTransport::new();
        transport.connect("node").await.unwrap();

        transport.queue_frame(&Frame::Ping { id: None });
        transport.queue_frame(&Frame::Pong { id: Some("7".into()) });

        let r1 = transport.recv().await.unwrap();
        let r2 = transport.recv().await.unwrap();

        assert_eq!(
            Frame::from_json(std::str::from_utf8(&r1).unwrap()).unwrap(),
            Frame::Ping { id: None }
        );
        assert_eq!(
            Frame::from_json(std::str::from_utf8(&r2).unwrap()).unwrap(),
            Frame::Pong { id: Some("7".into()) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recv_waits_for_a_frame() {
        let transport = MockTransport::new();
        transport.connect("node").await.unwrap();

        let feeder = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            feeder.queue_response(b"late".to_vec());
        });

        let data = transport.recv().await.unwrap();
        assert_eq!(data, b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_disconnect_wakes_receiver() {
        let transport = MockTransport::new();
        transport.connect("node").await.unwrap();

        let peer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            peer.simulate_disconnect();
        });

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect("node").await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.fail_next_connect("network unreachable");

        let result = transport.connect("node").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());

        transport.connect("node").await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_never_completes() {
        let transport = MockTransport::new();
        transport.stall_next_connect();

        let result =
            tokio::time::timeout(Duration::from_secs(1), transport.connect("node")).await;
        assert!(result.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn forced_send_and_recv_failures() {
        let transport = MockTransport::new();
        transport.connect("node").await.unwrap();

        transport.fail_next_send("buffer full");
        assert!(matches!(
            transport.send(b"data").await,
            Err(TransportError::SendFailed(_))
        ));

        transport.fail_next_recv("corrupt");
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::ReceiveFailed(_))
        ));
    }
}
