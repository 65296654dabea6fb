//! # Termgate Gateway Library
//!
//! This crate provides the gateway (`termgate-gateway`): the broker that
//! connects end-user WebSocket clients to persistent terminal sessions
//! served by a session host.
//!
//! ## Overview
//!
//! The gateway is the rendezvous point. Clients cannot reach the session
//! host directly; both sides connect to the gateway:
//!
//! - **Client listener**: end-user clients connect, open with an attach
//!   handshake, and exchange terminal frames
//! - **Upstream listener**: the session host dials in and carries frames
//!   for all of its sessions over one multiplexed link
//! - **Multiplexer**: fans session output out to attached clients through
//!   bounded per-connection queues so a slow client never stalls the rest
//! - **Idle reaper**: evicts client connections that go quiet
//!
//! ## Architecture
//!
//! ```text
//!  clients                        gateway                   session host
//!  ┌──────┐  ws  ┌─────────────────────────────────┐  ws  ┌───────────┐
//!  │ tty A├──────▶ client     ┌──────────────┐     ◀──────┤  uplink   │
//!  └──────┘      │ listener──▶│ multiplexer  │──upstream  └───────────┘
//!  ┌──────┐      │            │ (per-conn    │     link
//!  │ tty B├──────▶            │  queues)     │
//!  └──────┘      │            └──────────────┘
//!                │                 ▲
//!                │            idle reaper
//!                └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and profile defaults
//! - [`mux`]: Per-connection queues and session routing
//! - [`server`]: Listeners, handshake, and frame relay
//! - [`reaper`]: Idle-connection eviction

pub mod config;
pub mod mux;
pub mod reaper;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError, OverflowPolicy, Profile};
pub use mux::{CloseReason, ConnId, Multiplexer, OutboundQueue, QueueStats};
pub use server::{Gateway, GatewayStatus};
