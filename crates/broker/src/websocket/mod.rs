//! Live sync over WebSocket
//!
//! Pushes catalog changes (materials, notices, courses) to connected
//! dashboards as they are persisted.
//!
//! # Architecture
//!
//! - **Gateway**: handshake authentication, default topics, control frames
//! - **Registry**: connection, user and topic indexes behind one lock
//! - **Router**: resolves event topics to connections, once per connection
//! - **Publisher**: stamps event ids and fans events out, fire-and-forget
//! - **Worker**: drains a connection's bounded queue onto its socket
//! - **Handler**: Axum WebSocket route handler

pub mod connection;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod router;
pub mod worker;

pub use connection::{Connection, ConnectionState};
pub use events::{Event, Outbound};
pub use gateway::{Gateway, HandshakeRequest};
pub use handler::ws_handler;
pub use publisher::{EventPublisher, Published};
pub use registry::{RegistryStats, SessionRegistry};
pub use router::{DeliveryStats, DispatchReport, TopicRouter};
pub use worker::{DeliveryWorker, WorkerExit};
