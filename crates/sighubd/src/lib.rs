//! WebRTC signaling hub — a wallet-authenticated WebSocket room router.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and the configuration document model.
pub mod config;
mod connection;
/// Error types for signaling server operations.
pub mod error;
/// Challenge/response wallet handshake.
pub mod handshake;
/// Ordered whitelist/blacklist IP screening.
pub mod ipfilter;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Per-connection sliding-window rate limiting.
pub mod ratelimit;
/// Shared connection registry and per-IP accounting.
pub mod registry;
/// Room membership tables and default-room resolution.
pub mod rooms;
/// Frame fan-out by room and routing mode.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
