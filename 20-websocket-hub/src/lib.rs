//! WebSocket chat server built around an in-memory broadcast hub.
//!
//! Every message a client sends is fanned out to every connected client,
//! the sender included. A client that cannot keep up is disconnected instead
//! of slowing anyone else down. Each module has one responsibility:
//!
//! - [`hub`] owns membership and fan-out on a single Tokio task; other tasks
//!   only enqueue commands through a [`hub::HubHandle`].
//! - [`client`] defines a client's identity and its bounded mailbox.
//! - [`connection`] adapts one WebSocket to the hub and tracks its lifecycle.
//! - [`dispatch`] holds the per-connection reader and writer loops.
//! - [`payload`] is the opaque text/binary frame passed through the hub.
//! - [`server`] wires the upgrade endpoint, uploads and static files into an
//!   axum router.
//! - [`upload`] stores uploaded images under the media directory.
//! - [`cli`] parses command-line flags and environment variables.

pub mod cli;
pub mod client;
pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod payload;
pub mod server;
pub mod upload;
