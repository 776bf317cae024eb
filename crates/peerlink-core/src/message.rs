//! Wire messages exchanged between nodes.

use crate::auth::AuthorizationToken;
use crate::capability::Capability;
use crate::load::Load;
use serde::{Deserialize, Serialize};

/// Protocol version carried in every envelope; peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Top-level frame body: protocol version, authorization and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's protocol version
    pub version: u32,
    /// Authorization for `message`
    pub token: AuthorizationToken,
    /// Message body
    pub message: NetworkMessage,
}

impl Envelope {
    /// Wrap `message` with the current protocol version
    pub fn new(token: AuthorizationToken, message: NetworkMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token,
            message,
        }
    }
}

/// Messages understood by the networking layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// First handshake message, sent by the initiator
    HandshakeRequest {
        /// Initiator's capability
        capability: Capability,
        /// Initiator's load
        load: Load,
    },
    /// Handshake reply, sent by the responder
    HandshakeResponse {
        /// Responder's capability
        capability: Capability,
        /// Responder's load
        load: Load,
    },
    /// Peer is about to close the connection
    CloseConnection {
        /// Name of the close reason on the sender's side
        reason: String,
    },
    /// Opaque upper-layer message
    Application(ApplicationMessage),
}

impl NetworkMessage {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            NetworkMessage::HandshakeRequest { .. } => "HandshakeRequest",
            NetworkMessage::HandshakeResponse { .. } => "HandshakeResponse",
            NetworkMessage::CloseConnection { .. } => "CloseConnection",
            NetworkMessage::Application(_) => "Application",
        }
    }

    /// Canonical bytes that authorization tokens bind to
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

impl From<ApplicationMessage> for NetworkMessage {
    fn from(message: ApplicationMessage) -> Self {
        NetworkMessage::Application(message)
    }
}

/// Request/response correlation attached to an application message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Correlation {
    /// This message expects a response carrying the same id
    Request {
        /// Request id
        request_id: String,
    },
    /// This message answers the request with the same id
    Response {
        /// Request id being answered
        request_id: String,
    },
}

/// Upper-layer payload with a kind tag and optional correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    /// Application-defined message kind
    pub kind: String,
    /// Request/response correlation, if any
    pub correlation: Option<Correlation>,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl ApplicationMessage {
    /// Uncorrelated message
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            correlation: None,
            payload: payload.into(),
        }
    }

    /// Request expecting a response
    pub fn request(
        kind: impl Into<String>,
        request_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            kind: kind.into(),
            correlation: Some(Correlation::Request {
                request_id: request_id.into(),
            }),
            payload: payload.into(),
        }
    }

    /// Response to a request
    pub fn response(
        kind: impl Into<String>,
        request_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            kind: kind.into(),
            correlation: Some(Correlation::Response {
                request_id: request_id.into(),
            }),
            payload: payload.into(),
        }
    }

    /// Request id if this is a request
    pub fn request_id(&self) -> Option<&str> {
        match &self.correlation {
            Some(Correlation::Request { request_id }) => Some(request_id),
            _ => None,
        }
    }

    /// Answered request id if this is a response
    pub fn response_id(&self) -> Option<&str> {
        match &self.correlation {
            Some(Correlation::Response { request_id }) => Some(request_id),
            _ => None,
        }
    }
}
