//! Reverse TCP tunnel: a LAN agent dials out to a public bind server, which
//! allocates a per-tunnel relay and pairs public clients with pre-warmed
//! connections from the agent.
//!
//! Wire overview:
//! - control channel: 64-byte handshake tokens, then newline-delimited JSON
//!   (`protocol`), then an echo/heartbeat liveness loop.
//! - relay port: one dedicated TCP connection per public client, gated by a
//!   handshake over the per-tunnel secret, then opaque bytes.

pub mod agent;
pub mod bind_server;
pub mod cryptor;
pub mod handshake;
pub mod local_client;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod relay_server;
pub mod transport;
