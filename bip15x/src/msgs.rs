//! Wire packet layout and message types
//!
//! Every packet on the wire is
//!
//! ```text
//! length: u32 LE | body: [u8; length]
//! ```
//!
//! While no session cipher is active the body is the plaintext header
//! followed by the payload:
//!
//! ```text
//! type: u8 | message_id: u32 LE | payload
//! ```
//!
//! Once the cipher is active the body is the AEAD ciphertext of exactly
//! those bytes followed by the 16 byte tag; the four length bytes serve as
//! additional data.

use bip15x_ciphers::aead::TAG_LEN;

use crate::Error;

/// Size of the length prefix
pub const LENGTH_LEN: usize = 4;
/// Size of the plaintext header (type and message id)
pub const HEADER_LEN: usize = 1 + 4;
/// Size of the total length announced in a [MsgType::FragmentHeader]
pub const FRAGMENT_TOTAL_LEN: usize = 4;
/// Message id used by handshake, rekey and heartbeat frames
pub const CONTROL_MSG_ID: u32 = 0;
/// Types at or below this value are application and heartbeat frames,
/// types above it are handshake frames
pub const HANDSHAKE_THRESHOLD: u8 = 10;

/// Smallest accepted body of an encrypted packet
pub const MIN_SEALED_BODY_LEN: usize = HEADER_LEN + TAG_LEN;
/// Largest body accepted for any single packet, whatever the configuration
pub const MAX_PACKET_BODY_LEN: usize = 1 << 20;
/// Largest payload of any handshake frame
pub const MAX_HANDSHAKE_PAYLOAD: usize = 128;

/// Cipher suite announced in ENC_INIT
pub const CIPHER_SUITE_CHACHA20POLY1305: u8 = 0x00;

/// Recognized message types
#[repr(u8)]
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum MsgType {
    Heartbeat = 1,
    FragmentHeader = 2,
    FragmentContinuation = 3,
    FragmentFinal = 4,
    Setup = 11,
    EncInit = 12,
    EncAck = 13,
    Rekey = 14,
    PresentPubkey = 15,
    AuthChallenge = 16,
    AuthReply = 17,
    AuthPropose = 18,
}

impl MsgType {
    /// Handshake frames are consumed by the handshake engine and never fragmented
    pub fn is_handshake(self) -> bool {
        (self as u8) > HANDSHAKE_THRESHOLD
    }

    /// Frames sent before the session cipher is active
    pub fn is_plaintext(self) -> bool {
        matches!(
            self,
            MsgType::Setup | MsgType::EncInit | MsgType::EncAck | MsgType::PresentPubkey
        )
    }

    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            MsgType::FragmentHeader | MsgType::FragmentContinuation | MsgType::FragmentFinal
        )
    }
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MsgType::Heartbeat,
            2 => MsgType::FragmentHeader,
            3 => MsgType::FragmentContinuation,
            4 => MsgType::FragmentFinal,
            11 => MsgType::Setup,
            12 => MsgType::EncInit,
            13 => MsgType::EncAck,
            14 => MsgType::Rekey,
            15 => MsgType::PresentPubkey,
            16 => MsgType::AuthChallenge,
            17 => MsgType::AuthReply,
            18 => MsgType::AuthPropose,
            _ => return Err(Error::InvalidMessageType(value)),
        })
    }
}

/// A decoded handshake frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub msg_type: MsgType,
    pub payload: Vec<u8>,
}

impl HandshakeFrame {
    pub fn new(msg_type: MsgType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }
}
