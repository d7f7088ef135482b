//! Live Sync shared types and wire protocol
//!
//! This crate contains the types, protocol frames, and errors shared by the
//! broker and its clients.

pub mod error;
pub mod protocol;
pub mod topic;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientFrame, ServerFrame, ServerMessage};
pub use topic::Topic;
pub use types::*;
