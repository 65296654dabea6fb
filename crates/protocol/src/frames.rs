//! Wire frame definitions.
//!
//! A [`Frame`] is the atomic unit exchanged over every WebSocket link in the
//! system: between clients and the gateway, and between the gateway and the
//! session host. Frames are serialized with MessagePack and sent as binary
//! WebSocket messages. On the upstream link, frames for many sessions are
//! multiplexed over one connection and addressed by session id.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version. Carried in every attach request; peers reject
/// requests speaking a different version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum serialized frame size (1 MiB).
///
/// Terminal chunks are small; anything near this limit indicates a broken or
/// hostile peer and is rejected before deserialization.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Unique identifier for a session.
pub type SessionId = String;

/// Input arbitration policy for a session with multiple attached clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Any attached connection may write; concurrent typists interleave.
    #[default]
    Shared,
    /// Only the holder of the write slot may write; others view.
    Exclusive,
}

/// Error taxonomy carried by [`Frame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown session or connection id.
    NotFound,
    /// The referenced session has been terminated.
    Gone,
    /// The session-count ceiling has been reached.
    ResourceExhausted,
    /// The connection's outbound queue overflowed.
    Backpressure,
    /// The session host link is down.
    UpstreamUnavailable,
    /// Malformed or unexpected frame.
    ProtocolError,
}

/// Terminal input bytes, client → session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Target session.
    pub session_id: SessionId,
    /// Raw terminal bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Terminal output bytes, session → clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Originating session.
    pub session_id: SessionId,
    /// Per-session sequence number, monotonically increasing from 0.
    pub seq: u64,
    /// Raw terminal bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Terminal geometry change. Last writer wins across attached clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    /// Target session.
    pub session_id: SessionId,
    /// New row count.
    pub rows: u16,
    /// New column count.
    pub cols: u16,
}

/// Attachment request or confirmation.
///
/// A client sends either a session id or a user id (resolved to the user's
/// current session by the registry). The reply travels as the same frame kind
/// with both ids and the session's input policy filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attach {
    /// Session to attach to, if known.
    pub session_id: Option<SessionId>,
    /// User whose session to attach to, if the session id is unknown.
    pub user_id: Option<String>,
    /// Input policy of the resolved session. Set on replies only.
    pub policy: Option<InputPolicy>,
    /// Protocol version spoken by the requester.
    pub version: u8,
    /// Pump restart after a link reconnect. Does not represent a new viewer,
    /// so it must not be counted as an attachment.
    pub resume: bool,
}

/// Detachment notice. Leaves the session process running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detach {
    /// Session being detached from.
    pub session_id: SessionId,
}

/// Error notice, usually the last frame before a close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Error classification.
    pub kind: ErrorKind,
    /// Session the error relates to, when there is one.
    pub session_id: Option<SessionId>,
    /// Human-readable description.
    pub message: String,
}

/// One discrete protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// Terminal input bytes.
    Input(Input),
    /// Terminal output bytes.
    Output(Output),
    /// Terminal geometry change.
    Resize(Resize),
    /// Attachment request/confirmation.
    Attach(Attach),
    /// Detachment notice.
    Detach(Detach),
    /// Keepalive probe. Carries no payload; updates activity timestamps.
    Ping,
    /// Keepalive response.
    Pong,
    /// Error notice.
    Error(ErrorFrame),
}

impl Frame {
    /// Builds an input frame.
    pub fn input(session_id: impl Into<SessionId>, data: impl Into<Vec<u8>>) -> Self {
        Frame::Input(Input {
            session_id: session_id.into(),
            data: data.into(),
        })
    }

    /// Builds an output frame.
    pub fn output(session_id: impl Into<SessionId>, seq: u64, data: impl Into<Vec<u8>>) -> Self {
        Frame::Output(Output {
            session_id: session_id.into(),
            seq,
            data: data.into(),
        })
    }

    /// Builds a resize frame.
    pub fn resize(session_id: impl Into<SessionId>, rows: u16, cols: u16) -> Self {
        Frame::Resize(Resize {
            session_id: session_id.into(),
            rows,
            cols,
        })
    }

    /// Builds an attach request addressed by session id.
    pub fn attach_session(session_id: impl Into<SessionId>) -> Self {
        Frame::Attach(Attach {
            session_id: Some(session_id.into()),
            user_id: None,
            policy: None,
            version: PROTOCOL_VERSION,
            resume: false,
        })
    }

    /// Builds an attach request addressed by user id.
    pub fn attach_user(user_id: impl Into<String>) -> Self {
        Frame::Attach(Attach {
            session_id: None,
            user_id: Some(user_id.into()),
            policy: None,
            version: PROTOCOL_VERSION,
            resume: false,
        })
    }

    /// Builds a pump-resume request, sent for each routed session when the
    /// session host reconnects. Not a viewer attachment.
    pub fn resume_session(session_id: impl Into<SessionId>) -> Self {
        Frame::Attach(Attach {
            session_id: Some(session_id.into()),
            user_id: None,
            policy: None,
            version: PROTOCOL_VERSION,
            resume: true,
        })
    }

    /// Builds an attach confirmation.
    pub fn attach_reply(
        session_id: impl Into<SessionId>,
        user_id: impl Into<String>,
        policy: InputPolicy,
    ) -> Self {
        Frame::Attach(Attach {
            session_id: Some(session_id.into()),
            user_id: Some(user_id.into()),
            policy: Some(policy),
            version: PROTOCOL_VERSION,
            resume: false,
        })
    }

    /// Builds a detach frame.
    pub fn detach(session_id: impl Into<SessionId>) -> Self {
        Frame::Detach(Detach {
            session_id: session_id.into(),
        })
    }

    /// Builds an error frame.
    pub fn error(
        kind: ErrorKind,
        session_id: Option<SessionId>,
        message: impl Into<String>,
    ) -> Self {
        Frame::Error(ErrorFrame {
            kind,
            session_id,
            message: message.into(),
        })
    }

    /// Returns the session this frame addresses, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Frame::Input(f) => Some(&f.session_id),
            Frame::Output(f) => Some(&f.session_id),
            Frame::Resize(f) => Some(&f.session_id),
            Frame::Attach(f) => f.session_id.as_deref(),
            Frame::Detach(f) => Some(&f.session_id),
            Frame::Error(f) => f.session_id.as_deref(),
            Frame::Ping | Frame::Pong => None,
        }
    }

    /// Serializes the frame to MessagePack bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = rmp_serde::to_vec(self)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserializes a frame from MessagePack bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode().expect("encode");
        Frame::decode(&bytes).expect("decode")
    }

    #[test]
    fn test_input_roundtrip() {
        let frame = Frame::input("sess-1", b"echo hi\n".to_vec());
        assert_eq!(roundtrip(frame.clone()), frame);
        assert_eq!(frame.session_id(), Some("sess-1"));
    }

    #[test]
    fn test_output_roundtrip_preserves_binary_payload() {
        let payload = vec![0x1b, b'[', b'2', b'J', 0x00, 0xff];
        let frame = Frame::output("sess-1", 42, payload.clone());
        match roundtrip(frame) {
            Frame::Output(out) => {
                assert_eq!(out.seq, 42);
                assert_eq!(out.data, payload);
            }
            other => panic!("expected Output, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_carry_no_payload() {
        assert_eq!(roundtrip(Frame::Ping), Frame::Ping);
        assert_eq!(roundtrip(Frame::Pong), Frame::Pong);
        assert_eq!(Frame::Ping.session_id(), None);
    }

    #[test]
    fn test_attach_request_and_reply() {
        let req = Frame::attach_user("alice");
        match roundtrip(req) {
            Frame::Attach(a) => {
                assert_eq!(a.user_id.as_deref(), Some("alice"));
                assert!(a.session_id.is_none());
                assert!(a.policy.is_none());
                assert_eq!(a.version, PROTOCOL_VERSION);
                assert!(!a.resume);
            }
            other => panic!("expected Attach, got {:?}", other),
        }

        let reply = Frame::attach_reply("sess-1", "alice", InputPolicy::Exclusive);
        match roundtrip(reply) {
            Frame::Attach(a) => {
                assert_eq!(a.session_id.as_deref(), Some("sess-1"));
                assert_eq!(a.policy, Some(InputPolicy::Exclusive));
            }
            other => panic!("expected Attach, got {:?}", other),
        }
    }

    #[test]
    fn test_resume_request_is_flagged() {
        match roundtrip(Frame::resume_session("sess-1")) {
            Frame::Attach(a) => {
                assert_eq!(a.session_id.as_deref(), Some("sess-1"));
                assert!(a.resume);
                assert_eq!(a.version, PROTOCOL_VERSION);
            }
            other => panic!("expected Attach, got {:?}", other),
        }
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let frame = Frame::error(
            ErrorKind::Gone,
            Some("sess-1".to_string()),
            "session terminated",
        );
        match roundtrip(frame) {
            Frame::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Gone);
                assert_eq!(e.session_id.as_deref(), Some("sess-1"));
                assert_eq!(e.message, "session terminated");
            }
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_kind_wire_names_are_stable() {
        // Wire compatibility: renaming a variant breaks deployed peers.
        let names: Vec<String> = [
            ErrorKind::NotFound,
            ErrorKind::Gone,
            ErrorKind::ResourceExhausted,
            ErrorKind::Backpressure,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::ProtocolError,
        ]
        .iter()
        .map(|k| serde_json::to_string(k).unwrap())
        .collect();

        assert_eq!(
            names,
            vec![
                "\"not_found\"",
                "\"gone\"",
                "\"resource_exhausted\"",
                "\"backpressure\"",
                "\"upstream_unavailable\"",
                "\"protocol_error\"",
            ]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = Frame::decode(&[0xc1, 0xc1, 0xc1]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let frame = Frame::input("sess-1", vec![0u8; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_buffer_rejected_before_decode() {
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            Frame::decode(&huge),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_default_input_policy_is_shared() {
        assert_eq!(InputPolicy::default(), InputPolicy::Shared);
    }
}
