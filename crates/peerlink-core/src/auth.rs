//! Message authorization backed by proof-of-work.
//!
//! Every envelope carries an [`AuthorizationToken`] bound to the message
//! bytes, the receiver's address and a per-connection counter. The receiver
//! requires a difficulty that grows with its own load, so a busy node costs
//! more to talk to.
//!
//! # Token layout
//!
//! ```text
//! payload_hash = BLAKE3(bincode(message))
//! challenge    = BLAKE3(receiver_address || counter_le)
//! proof        = BLAKE3(payload_hash || challenge || difficulty_le || nonce_le)
//! valid iff    leading_zero_bits(proof) >= difficulty >= required(receiver_load)
//! ```

use crate::load::Load;
use crate::message::NetworkMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use peerlink_transport::Address;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Authorization errors raised while creating tokens
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),

    /// Blocking worker panicked or was cancelled
    #[error("proof-of-work worker failed: {0}")]
    Worker(String),
}

/// Hashcash-style proof over BLAKE3
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProofOfWork {
    /// Hash of the authorized message bytes
    pub payload_hash: [u8; 32],
    /// Hash of the receiver address and counter
    pub challenge: [u8; 32],
    /// Claimed difficulty in leading zero bits
    pub difficulty: u32,
    /// Solution nonce
    pub nonce: u64,
}

impl ProofOfWork {
    fn digest(&self) -> [u8; 32] {
        digest(&self.payload_hash, &self.challenge, self.difficulty, self.nonce)
    }

    /// Returns true if the nonce meets the claimed difficulty
    pub fn is_solved(&self) -> bool {
        leading_zero_bits(&self.digest()) >= self.difficulty
    }
}

/// Credential attached to every envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorizationToken {
    /// Proof over the message
    pub proof_of_work: ProofOfWork,
    /// Sender's per-connection message counter
    pub message_counter: u64,
}

impl AuthorizationToken {
    /// Token that never verifies
    pub fn empty() -> Self {
        Self {
            proof_of_work: ProofOfWork {
                payload_hash: [0u8; 32],
                challenge: [0u8; 32],
                difficulty: 0,
                nonce: 0,
            },
            message_counter: 0,
        }
    }
}

/// Creates and verifies message authorization.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Build a token for sending `message` to a peer at `peer_address`
    /// whose last known load is `peer_load`.
    async fn create_token(
        &self,
        message: &NetworkMessage,
        peer_load: Load,
        peer_address: &Address,
        counter: u64,
    ) -> Result<AuthorizationToken, AuthError>;

    /// Check that `token` authorizes `message` addressed to `my_address`
    /// at `my_load`. `connection_id` scopes replay detection.
    async fn is_authorized(
        &self,
        message: &NetworkMessage,
        token: &AuthorizationToken,
        my_load: Load,
        connection_id: &str,
        my_address: &Address,
    ) -> bool;

    /// Drop replay state for a closed connection or finished handshake
    fn forget(&self, connection_id: &str);
}

/// Proof-of-work difficulty settings
#[derive(Debug, Clone)]
pub struct ProofOfWorkConfig {
    /// Difficulty (leading zero bits) at zero load
    pub base_difficulty: u32,
    /// Upper bound on required difficulty
    pub max_difficulty: u32,
}

impl Default for ProofOfWorkConfig {
    fn default() -> Self {
        Self {
            base_difficulty: 8,
            max_difficulty: 24,
        }
    }
}

impl ProofOfWorkConfig {
    /// Difficulty required of a sender targeting a node at `load`
    pub fn required_difficulty(&self, load: Load) -> u32 {
        let scale = (u64::from(load.num_connections) + 1).ilog2();
        (self.base_difficulty + scale).min(self.max_difficulty)
    }
}

/// [`AuthorizationService`] using BLAKE3 hashcash.
///
/// Mining and verification run on Tokio's blocking pool.
pub struct ProofOfWorkAuthorization {
    config: ProofOfWorkConfig,
    /// Last accepted counter per connection id
    counters: DashMap<String, u64>,
}

impl ProofOfWorkAuthorization {
    /// Create a service with the given difficulty settings
    pub fn new(config: ProofOfWorkConfig) -> Self {
        Self {
            config,
            counters: DashMap::new(),
        }
    }

    /// Difficulty settings
    pub fn config(&self) -> &ProofOfWorkConfig {
        &self.config
    }

    /// Number of connection ids with replay state
    pub fn tracked_connections(&self) -> usize {
        self.counters.len()
    }

    fn accept_counter(&self, connection_id: &str, counter: u64) -> bool {
        match self.counters.entry(connection_id.to_string()) {
            Entry::Occupied(mut last) => {
                if counter <= *last.get() {
                    return false;
                }
                last.insert(counter);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(counter);
                true
            }
        }
    }
}

impl Default for ProofOfWorkAuthorization {
    fn default() -> Self {
        Self::new(ProofOfWorkConfig::default())
    }
}

#[async_trait]
impl AuthorizationService for ProofOfWorkAuthorization {
    async fn create_token(
        &self,
        message: &NetworkMessage,
        peer_load: Load,
        peer_address: &Address,
        counter: u64,
    ) -> Result<AuthorizationToken, AuthError> {
        let bytes = message.to_bytes()?;
        let difficulty = self.config.required_difficulty(peer_load);
        let address = peer_address.to_string();

        let proof_of_work = tokio::task::spawn_blocking(move || {
            let payload_hash = *blake3::hash(&bytes).as_bytes();
            let challenge = challenge(&address, counter);
            mine(payload_hash, challenge, difficulty)
        })
        .await
        .map_err(|e| AuthError::Worker(e.to_string()))?;

        Ok(AuthorizationToken {
            proof_of_work,
            message_counter: counter,
        })
    }

    async fn is_authorized(
        &self,
        message: &NetworkMessage,
        token: &AuthorizationToken,
        my_load: Load,
        connection_id: &str,
        my_address: &Address,
    ) -> bool {
        let required = self.config.required_difficulty(my_load);
        if token.proof_of_work.difficulty < required {
            tracing::debug!(
                "Token difficulty {} below required {} for {}",
                token.proof_of_work.difficulty,
                required,
                my_load
            );
            return false;
        }

        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Cannot encode {} for verification: {}", message.name(), e);
                return false;
            }
        };
        let proof = token.proof_of_work.clone();
        let address = my_address.to_string();
        let counter = token.message_counter;

        let valid = tokio::task::spawn_blocking(move || {
            blake3::hash(&bytes).as_bytes() == &proof.payload_hash
                && challenge(&address, counter) == proof.challenge
                && proof.is_solved()
        })
        .await
        .unwrap_or(false);

        if !valid {
            return false;
        }
        if !self.accept_counter(connection_id, counter) {
            tracing::debug!(
                "Replayed counter {} on connection {}",
                counter,
                connection_id
            );
            return false;
        }
        true
    }

    fn forget(&self, connection_id: &str) {
        self.counters.remove(connection_id);
    }
}

fn challenge(address: &str, counter: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(address.as_bytes());
    hasher.update(&counter.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn digest(payload_hash: &[u8; 32], challenge: &[u8; 32], difficulty: u32, nonce: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload_hash);
    hasher.update(challenge);
    hasher.update(&difficulty.to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn mine(payload_hash: [u8; 32], challenge: [u8; 32], difficulty: u32) -> ProofOfWork {
    let mut nonce: u64 = rand::thread_rng().r#gen();
    loop {
        let hash = digest(&payload_hash, &challenge, difficulty, nonce);
        if leading_zero_bits(&hash) >= difficulty {
            return ProofOfWork {
                payload_hash,
                challenge,
                difficulty,
                nonce,
            };
        }
        nonce = nonce.wrapping_add(1);
    }
}

fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
