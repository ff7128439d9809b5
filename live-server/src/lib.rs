//! # livedata-server
//!
//! Runtime for livedata: the pieces that make a client's view of the data
//! catch up with its own writes.
//!
//! - [`WriteFence`] tracks a batch of writes and fires once all of them are
//!   visible to every observer
//! - [`Crossbar`] routes write notifications to listeners by field-subset
//!   matching and reports when every listener has acked
//! - [`DocFetcher`] collapses concurrent fetches of the same document
//! - [`ObserveHub`] keeps each distinct query's result set current and fans
//!   its changes out to every [`Observer`] of that query
//! - [`Heartbeat`] and [`Retry`] drive the liveness and backoff machines
//!   from `live-core` on tokio timers
//! - [`Session`] and [`Connection`] run the server and client ends of a
//!   transport
//!
//! ## Architecture
//!
//! ```text
//!  run_write(f) ──► WriteFence ◄── committed ──┐
//!       │                                      │
//!       ▼                                      │
//!  DocumentStore ── fire ──► Crossbar ──► Observer ──► DocFetcher
//!                                           │
//!                                           ▼
//!                                    Session ──► Transport ──► Connection
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod crossbar;
pub mod doc_fetcher;
pub mod error;
pub mod heartbeat;
pub mod observe;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod write_fence;

pub use config::Config;
pub use connection::{Connection, Status};
pub use crossbar::{Ack, Crossbar, ListenerHandle};
pub use doc_fetcher::DocFetcher;
pub use error::{LivedataError, Result};
pub use heartbeat::Heartbeat;
pub use observe::{change_frame, ObserveHub, Observer, PollSettings};
pub use retry::Retry;
pub use server::{LivedataServer, MethodOutcome, ServerMetrics};
pub use session::{Session, SessionEnd, SessionHandle};
pub use store::{DocumentStore, MemoryStore};
pub use transport::{MockTransport, Transport, TransportError};
pub use write_fence::{current_fence, WriteFence, WriteHandle};
