//! # wirebus-client
//!
//! Typed client for the WireBus event bus. An [`EventClient`] connects to a
//! broker over TCP, verifies it with a handshake probe, and then offers:
//!
//! - `subscribe`/`subscribe_async` — register typed handlers per subject;
//!   the payload type is fixed at registration, so delivery decodes without
//!   any runtime type inspection.
//! - `publish` — fire-and-forget fan-out through the broker.
//! - `query` — request/response on top of pub/sub, correlated by task id.
//!
//! Liveness is maintained by a heartbeat loop; a dead connection is torn
//! down and re-established automatically, re-announcing every subscribed
//! subject.

pub mod client;
pub mod config;
mod subscription;

pub use client::{ClientError, ConnectState, EventClient};
pub use config::ClientConfig;
pub use subscription::SubscriptionId;
