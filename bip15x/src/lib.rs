//! Encrypted, mutually authenticated duplex channels
//!
//! A channel first negotiates a symmetric session in the BIP151 style
//! (ephemeral ECDH, ChaCha20-Poly1305 per direction) and then authenticates
//! the long-term identity keys of both sides in the BIP150 style. Application
//! messages of any size are fragmented into length-delimited packets.
//!
//! The main entry point is [channel::EncryptedChannel]; the building blocks
//! ([protocol::HandshakeEngine], [protocol::SessionCipher], [codec]) can be
//! driven directly as well.

use std::io;
use std::sync::Arc;

pub mod channel;
pub mod cli;
pub mod cmd;
pub mod codec;
pub mod config;
pub mod cookies;
pub mod hash_domains;
pub mod heartbeat;
pub mod identity;
pub mod msgs;
pub mod peers;
pub mod protocol;
pub mod transport;
pub mod verifier;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("malformed wire packet: {0}")]
    SerializationFailed(String),
    #[error("fragment of message {got} arrived while message {expected} was incomplete")]
    UnexpectedFragment { expected: u32, got: u32 },
    #[error("transport error: {0}")]
    UndefinedSocketError(Arc<io::Error>),
    #[error("packet failed authentication")]
    DecryptionFailed,
    #[error("cryptographic primitive failed: {0}")]
    Crypto(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid message type {0}")]
    InvalidMessageType(u8),
    #[error("channel is not ready")]
    NotReady,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("channel is closed")]
    Closed,
    #[error("channel was already opened")]
    AlreadyOpen,
    #[error("no traffic from peer for {0:.1} seconds")]
    HeartbeatTimeout(f64),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::UndefinedSocketError(Arc::new(e))
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::InvalidKey(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
