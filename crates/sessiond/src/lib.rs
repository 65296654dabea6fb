//! # Termgate Session Host Library
//!
//! This crate provides the session host (`termgate-sessiond`): the daemon
//! that owns persistent terminal sessions and serves them to the gateway.
//!
//! ## Overview
//!
//! The session host runs on the machine whose shell you want to reach. It
//! provides:
//!
//! - **Session Registry**: Persistent PTY sessions keyed by user, created
//!   idempotently and surviving client disconnects
//! - **PTY Bridge**: A duplex byte channel per session with a single-writer
//!   input funnel and broadcast output
//! - **Gateway Uplink**: One WebSocket to the gateway multiplexing frames for
//!   all sessions, with automatic reconnection
//! - **Sweeper**: Background destruction of sessions left detached too long
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                 termgate-sessiond                 │
//! ├───────────────────────────────────────────────────┤
//! │                                                   │
//! │  ┌─────────────────┐     ┌─────────────────────┐  │
//! │  │ Session Registry│────▶│ PTY Bridge (per     │  │
//! │  │ (user → session)│     │ session: shell proc)│  │
//! │  └─────────────────┘     └─────────────────────┘  │
//! │           ▲                        │              │
//! │           │ attach/input/resize    │ output       │
//! │  ┌────────┴────────────────────────▼───────────┐  │
//! │  │        Gateway Uplink (one WebSocket)       │  │
//! │  └─────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and profile defaults
//! - [`bridge`]: PTY spawning and terminal I/O
//! - [`registry`]: Session arena and lifecycle
//! - [`uplink`]: Gateway connection and frame dispatch

pub mod bridge;
pub mod config;
pub mod registry;
pub mod uplink;

// Re-export protocol for convenience
pub use protocol;

pub use bridge::{BridgeFactory, PtyBridge, PtyBridgeFactory, SessionError, SpawnSpec, TerminalBridge};
pub use config::{Config, ConfigError, Profile};
pub use registry::{Lifecycle, RegistryConfig, SessionEntry, SessionInfo, SessionRegistry};
pub use uplink::Uplink;
