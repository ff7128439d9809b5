//! Server façade tying the store, crossbar, fetcher and sessions together.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use live_core::CursorDescription;
use live_types::Frame;

use crate::config::Config;
use crate::crossbar::Crossbar;
use crate::doc_fetcher::DocFetcher;
use crate::error::Result;
use crate::observe::{ObserveHub, Observer, PollSettings};
use crate::session::{Session, SessionEnd, SessionHandle};
use crate::store::{DocumentStore, MemoryStore};
use crate::transport::Transport;
use crate::write_fence::WriteFence;

/// Server metrics.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Fenced writes whose effects every observer has seen.
    pub writes_completed: AtomicU64,
    /// Observer handles opened, including ones that joined a running query.
    pub observers_started: AtomicU64,
    /// Sessions opened.
    pub sessions_opened: AtomicU64,
    /// Sessions ended by a heartbeat timeout.
    pub heartbeat_timeouts: AtomicU64,
}

/// Result of a method call: its output plus the `updated` frame to send
/// once the output has been delivered.
#[derive(Debug)]
pub struct MethodOutcome<T> {
    /// What the method returned.
    pub result: T,
    /// `updated` frame for the method.
    pub updated: Frame,
}

/// The livedata server.
pub struct LivedataServer {
    config: Config,
    crossbar: Crossbar,
    store: Arc<dyn DocumentStore>,
    observers: ObserveHub,
    metrics: ServerMetrics,
}

impl LivedataServer {
    /// Create a server over an in-memory store.
    pub fn new(config: Config) -> Self {
        let crossbar = Crossbar::new();
        let store = Arc::new(MemoryStore::new(crossbar.clone()));
        Self::with_store(config, crossbar, store)
    }

    /// Create a server over `store`, which must notify `crossbar` on writes.
    pub fn with_store(config: Config, crossbar: Crossbar, store: Arc<dyn DocumentStore>) -> Self {
        let fetcher = Arc::new(DocFetcher::new(Arc::clone(&store)));
        let observers = ObserveHub::new(
            Arc::clone(&store),
            crossbar.clone(),
            fetcher,
            PollSettings::from_config(&config),
        );
        Self {
            config,
            crossbar,
            store,
            observers,
            metrics: ServerMetrics::default(),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the crossbar.
    pub fn crossbar(&self) -> &Crossbar {
        &self.crossbar
    }

    /// Get the document store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Get the shared document fetcher.
    pub fn fetcher(&self) -> &Arc<DocFetcher> {
        self.observers.fetcher()
    }

    /// Get the observer hub.
    pub fn observers(&self) -> &ObserveHub {
        &self.observers
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Run `f` inside a fresh write fence and return its output once every
    /// write it made has been seen by every observer.
    ///
    /// # Errors
    ///
    /// Fails only on fence misuse, such as `f` arming the fence itself.
    pub async fn run_write<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let fence = WriteFence::new();
        let output = WriteFence::scope(fence.clone(), f()).await;
        fence.arm_and_wait().await?;
        fence.retire()?;
        self.metrics.writes_completed.fetch_add(1, Ordering::Relaxed);
        Ok(output)
    }

    /// [`run_write`](Self::run_write) for a method call, pairing the output
    /// with the method's `updated` frame.
    ///
    /// # Errors
    ///
    /// Same as [`run_write`](Self::run_write).
    pub async fn run_method<F, Fut, T>(&self, method_id: &str, f: F) -> Result<MethodOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let result = self.run_write(f).await?;
        tracing::debug!("method {} complete", method_id);
        Ok(MethodOutcome {
            result,
            updated: Frame::Updated {
                methods: vec![method_id.to_string()],
            },
        })
    }

    /// Start observing a query, sharing the poller of an identical query
    /// already being observed.
    ///
    /// # Errors
    ///
    /// Fails if the initial query fails or a trigger is malformed.
    pub async fn observe(&self, description: CursorDescription) -> Result<Observer> {
        let observer = self.observers.observe(description).await?;
        self.metrics.observers_started.fetch_add(1, Ordering::Relaxed);
        Ok(observer)
    }

    /// Open a session over an accepted transport.
    ///
    /// Data frames from the client are delivered on `inbound`.
    pub fn open_session(
        &self,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedSender<Frame>,
    ) -> (Session, SessionHandle) {
        self.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
        let (session, handle) = Session::new(transport, &self.config.heartbeat, inbound);
        tracing::info!("session {} opened", session.id());
        (session, handle)
    }

    /// Run a session to completion.
    pub async fn serve(&self, session: Session) -> SessionEnd {
        let id = session.id();
        let end = session.run().await;
        if end == SessionEnd::HeartbeatTimeout {
            self.metrics.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!("session {} closed: {}", id, end);
        end
    }
}

impl std::fmt::Debug for LivedataServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivedataServer")
            .field("config", &self.config)
            .field("observers", &self.observers)
            .field("metrics", &self.metrics)
            .finish()
    }
}
