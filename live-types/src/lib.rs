//! # live-types
//!
//! Foundational types shared by the livedata crates:
//! - [`DocId`], [`ObjectId`], [`SessionId`] - document and connection identity
//! - [`Fields`] - flat key/JSON mappings used as crossbar notifications and triggers
//! - [`Frame`] - DDP-style wire frames (ping/pong and data messages)
//! - [`TypesError`] - error type

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod fields;
mod ids;
mod messages;

pub use error::TypesError;
pub use fields::{Document, Fields, Notification, Trigger};
pub use ids::{DocId, ObjectId, SessionId};
pub use messages::Frame;
