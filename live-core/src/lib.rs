//! # live-core
//!
//! Pure logic for the livedata sync core (no I/O, instant tests).
//!
//! This crate holds the data structures and state machines that the runtime
//! in `live-server` drives:
//! - [`IdMap`] / [`CowIdMap`] - id-keyed snapshots and copy-on-write deltas
//! - [`diff`] - add/change/remove events between two snapshots
//! - [`HeartbeatState`] - ping/pong liveness state machine
//! - [`RetryPolicy`] - exponential backoff with jitter
//! - [`ConnectionState`] - reconnecting client status machine
//! - [`CursorDescription`] - which crossbar triggers a query listens on
//!
//! State machines take an event and return the new state plus a list of
//! actions. Timers, sockets and callbacks belong to the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cow_id_map;
pub mod diff;
pub mod heartbeat;
pub mod id_map;
pub mod retry;
pub mod state;
pub mod triggers;

pub use cow_id_map::{CowChange, CowIdMap, Slot};
pub use diff::{cow_change_events, diff_query_changes, make_changed_fields, ChangeEvent};
pub use heartbeat::{HeartbeatAction, HeartbeatEvent, HeartbeatState};
pub use id_map::{IdKey, IdMap};
pub use retry::RetryPolicy;
pub use state::{Action, ConnectionState, Event, StatusKind};
pub use triggers::{id_value, CursorDescription, Selector};
