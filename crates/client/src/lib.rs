//! Live sync client
//!
//! Keeps a dashboard connected to the broker: reconnects with capped
//! exponential backoff, re-sends subscriptions on every new session and hands
//! each decoded server message to a single callback.

pub mod backoff;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod reconcile;

pub use backoff::{Backoff, ReconnectPolicy};
pub use credentials::{CredentialProvider, Credentials};
pub use error::ClientError;
pub use manager::{ClientStatus, LiveSyncClient};
pub use reconcile::{Collection, LiveCollection};
