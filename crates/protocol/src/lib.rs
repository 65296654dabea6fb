//! # Termgate Protocol Library
//!
//! Wire protocol shared by the gateway and the session host.
//!
//! ## Overview
//!
//! Every link in the system speaks the same frame vocabulary:
//!
//! - **Client link**: an end-user client attaches to a session through the
//!   gateway and exchanges terminal bytes with it.
//! - **Upstream link**: the session host multiplexes frames for all of its
//!   sessions over a single connection to the gateway, addressed by
//!   session id.
//!
//! Frames are MessagePack-encoded and carried as binary WebSocket messages.
//!
//! ## Modules
//!
//! - [`frames`]: Frame definitions and codec
//! - [`error`]: Error types

pub mod error;
pub mod frames;

pub use error::{ProtocolError, Result};
pub use frames::{
    Attach, Detach, ErrorFrame, ErrorKind, Frame, Input, InputPolicy, Output, Resize, SessionId,
    MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
