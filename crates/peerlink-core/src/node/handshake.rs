//! Connection handshake
//!
//! One round trip per new socket agrees on capabilities and loads and proves
//! both sides can produce valid authorization before the socket becomes a
//! [`Connection`](crate::node::Connection).
//!
//! ```text
//! Initiator                                   Responder
//!     |                                           |
//!     |-- Envelope{v, token(INITIAL_LOAD, 0),  -->|  version, type, ban list,
//!     |            HandshakeRequest{cap, load}}   |  authorized at INITIAL_LOAD
//!     |                                           |
//!     |<- Envelope{v, token(initiator load, 0), --|
//!     |            HandshakeResponse{cap, load}}  |
//!     |                                           |
//!  version, type, ban list,
//!  authorized at own advertised load
//! ```
//!
//! Both roles take ownership of the socket. On failure the socket is dropped,
//! which closes it, and only a [`ConnectionError`] escapes.

use crate::auth::AuthorizationService;
use crate::ban_list::BanList;
use crate::capability::Capability;
use crate::frame::{read_envelope, write_envelope};
use crate::load::{INITIAL_LOAD, Load};
use crate::message::{Envelope, NetworkMessage, PROTOCOL_VERSION};
use crate::node::error::{ConnectionError, Reason};
use crate::node::random_id;
use peerlink_transport::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

/// Everything either handshake role needs from the local node
#[derive(Clone)]
pub struct HandshakeContext {
    /// Token creation and verification
    pub auth: Arc<dyn AuthorizationService>,
    /// Peers we refuse to talk to
    pub ban_list: BanList,
    /// Our advertised capability
    pub my_capability: Capability,
    /// Bound on the whole exchange
    pub timeout: Duration,
}

/// Round-trip measurements of a completed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeMetrics {
    /// Time from first write to final validation
    pub round_trip: Duration,
    /// Bytes written
    pub bytes_sent: usize,
    /// Bytes read
    pub bytes_received: usize,
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Peer's capability as sent in its handshake message
    pub peer_capability: Capability,
    /// Peer's load as sent in its handshake message
    pub peer_load: Load,
    /// Load we advertised to the peer
    pub my_load: Load,
    /// Timing and volume
    pub metrics: HandshakeMetrics,
}

/// Initiator role
pub struct ConnectionHandshake {
    ctx: HandshakeContext,
    peer_address: Address,
}

impl ConnectionHandshake {
    /// Prepare a handshake towards `peer_address`
    pub fn new(ctx: HandshakeContext, peer_address: Address) -> Self {
        Self { ctx, peer_address }
    }

    /// Run the handshake over `stream`, advertising `my_load`.
    ///
    /// # Errors
    /// Returns a [`ConnectionError`] tagged with the failing check; the
    /// stream has been dropped by then.
    pub async fn start<S>(self, mut stream: S, my_load: Load) -> Result<(S, HandshakeOutcome), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeout = self.ctx.timeout;
        let outcome = tokio::time::timeout(timeout, self.exchange(&mut stream, my_load))
            .await
            .map_err(|_| {
                ConnectionError::new(
                    Reason::Timeout,
                    format!("handshake with {} exceeded {:?}", self.peer_address, timeout),
                )
            })??;
        Ok((stream, outcome))
    }

    async fn exchange<S>(&self, stream: &mut S, my_load: Load) -> Result<HandshakeOutcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let ctx = &self.ctx;

        let request = NetworkMessage::HandshakeRequest {
            capability: ctx.my_capability.clone(),
            load: my_load,
        };
        let token = ctx
            .auth
            .create_token(&request, INITIAL_LOAD, &self.peer_address, 0)
            .await?;
        let bytes_sent = write_envelope(stream, &Envelope::new(token, request)).await?;

        let (envelope, bytes_received) = read_envelope(stream).await?.ok_or_else(|| {
            ConnectionError::new(Reason::MissingPayload, "stream closed before handshake response")
        })?;
        check_version(&envelope)?;

        let (peer_capability, peer_load) = match &envelope.message {
            NetworkMessage::HandshakeResponse { capability, load } => (capability.clone(), *load),
            other => {
                return Err(ConnectionError::new(
                    Reason::UnexpectedMessage,
                    format!("expected HandshakeResponse, got {}", other.name()),
                ));
            }
        };

        if ctx.ban_list.is_banned(&self.peer_address) {
            return Err(ConnectionError::new(
                Reason::AddressBanned,
                format!("peer {} is banned", self.peer_address),
            ));
        }

        let handshake_id = random_id();
        let authorized = ctx
            .auth
            .is_authorized(
                &envelope.message,
                &envelope.token,
                my_load,
                &handshake_id,
                ctx.my_capability.address(),
            )
            .await;
        ctx.auth.forget(&handshake_id);
        if !authorized {
            return Err(ConnectionError::new(
                Reason::AuthorizationFailed,
                format!("handshake response from {} not authorized", self.peer_address),
            ));
        }

        tracing::debug!(
            "Handshake with {} completed: {} at {}",
            self.peer_address,
            peer_capability,
            peer_load
        );
        Ok(HandshakeOutcome {
            peer_capability,
            peer_load,
            my_load,
            metrics: HandshakeMetrics {
                round_trip: started.elapsed(),
                bytes_sent,
                bytes_received,
            },
        })
    }
}

/// Responder role
pub struct ConnectionHandshakeResponder {
    ctx: HandshakeContext,
}

impl ConnectionHandshakeResponder {
    /// Prepare to answer one handshake
    pub fn new(ctx: HandshakeContext) -> Self {
        Self { ctx }
    }

    /// Answer the handshake on `stream`, advertising `my_load`.
    ///
    /// # Errors
    /// Returns a [`ConnectionError`] tagged with the failing check; the
    /// stream has been dropped by then.
    pub async fn respond<S>(self, mut stream: S, my_load: Load) -> Result<(S, HandshakeOutcome), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeout = self.ctx.timeout;
        let outcome = tokio::time::timeout(timeout, self.exchange(&mut stream, my_load))
            .await
            .map_err(|_| {
                ConnectionError::new(
                    Reason::Timeout,
                    format!("inbound handshake exceeded {timeout:?}"),
                )
            })??;
        Ok((stream, outcome))
    }

    async fn exchange<S>(&self, stream: &mut S, my_load: Load) -> Result<HandshakeOutcome, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ctx = &self.ctx;
        let (envelope, bytes_received) = read_envelope(stream).await?.ok_or_else(|| {
            ConnectionError::new(Reason::MissingPayload, "stream closed before handshake request")
        })?;
        let started = Instant::now();
        check_version(&envelope)?;

        let (peer_capability, peer_load) = match &envelope.message {
            NetworkMessage::HandshakeRequest { capability, load } => (capability.clone(), *load),
            other => {
                return Err(ConnectionError::new(
                    Reason::UnexpectedMessage,
                    format!("expected HandshakeRequest, got {}", other.name()),
                ));
            }
        };

        if ctx.ban_list.is_banned(peer_capability.address()) {
            return Err(ConnectionError::new(
                Reason::AddressBanned,
                format!("peer {} is banned", peer_capability.address()),
            ));
        }

        let handshake_id = random_id();
        let authorized = ctx
            .auth
            .is_authorized(
                &envelope.message,
                &envelope.token,
                INITIAL_LOAD,
                &handshake_id,
                ctx.my_capability.address(),
            )
            .await;
        ctx.auth.forget(&handshake_id);
        if !authorized {
            return Err(ConnectionError::new(
                Reason::AuthorizationFailed,
                format!("handshake request from {} not authorized", peer_capability.address()),
            ));
        }

        let response = NetworkMessage::HandshakeResponse {
            capability: ctx.my_capability.clone(),
            load: my_load,
        };
        let token = ctx
            .auth
            .create_token(&response, peer_load, peer_capability.address(), 0)
            .await?;
        let bytes_sent = write_envelope(stream, &Envelope::new(token, response)).await?;

        tracing::debug!(
            "Answered handshake from {} at {}",
            peer_capability,
            peer_load
        );
        Ok(HandshakeOutcome {
            peer_capability,
            peer_load,
            my_load,
            metrics: HandshakeMetrics {
                round_trip: started.elapsed(),
                bytes_sent,
                bytes_received,
            },
        })
    }
}

fn check_version(envelope: &Envelope) -> Result<(), ConnectionError> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(ConnectionError::new(
            Reason::ProtocolVersionMismatch,
            format!(
                "peer version {} does not match {}",
                envelope.version, PROTOCOL_VERSION
            ),
        ));
    }
    Ok(())
}
