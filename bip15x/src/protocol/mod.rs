//! The transport protocol proper
//!
//! [SessionCipher] holds the symmetric session negotiated by the key exchange
//! and [HandshakeEngine] drives that exchange and the identity
//! authentication that follows it. Neither does any IO: the engine reads
//! [HandshakeFrame](crate::msgs::HandshakeFrame)s and appends its responses
//! to a transmission buffer, leaving it to the caller to move bytes.
//!
//! # Example
//!
//! Two engines talking to each other through in-memory buffers:
//!
//! ```
//! use std::sync::Arc;
//! use bip15x::codec::{DecodeOutcome, FrameDecoder};
//! use bip15x::peers::PeerKeyStore;
//! use bip15x::protocol::{AuthMode, HandshakeEngine, HandshakeRole, SessionCipher};
//!
//! let client_store = Arc::new(PeerKeyStore::ephemeral());
//! let server_store = Arc::new(PeerKeyStore::ephemeral());
//! // Both sides know each other in advance
//! client_store.remember("server", server_store.own_identity().public_key())?;
//! server_store.remember("client", client_store.own_identity().public_key())?;
//!
//! let mut client = HandshakeEngine::new(HandshakeRole::Initiator, "server", client_store, AuthMode::TwoWay);
//! let mut server = HandshakeEngine::new(HandshakeRole::Responder, "client", server_store, AuthMode::TwoWay);
//! let (mut client_cipher, mut server_cipher) = (SessionCipher::default(), SessionCipher::default());
//! let (mut client_rx, mut server_rx) = (FrameDecoder::new(1024, 1024), FrameDecoder::new(1024, 1024));
//!
//! let mut to_server = Vec::new();
//! client.start(&mut client_cipher, &mut to_server, 0.0)?;
//!
//! while !(client.is_established() && server.is_established()) {
//!     let mut to_client = Vec::new();
//!     let mut input = std::mem::take(&mut to_server);
//!     loop {
//!         match server_rx.decode(&input, Some(&mut server_cipher)) {
//!             DecodeOutcome::HandshakeFrame(f) => {
//!                 server.handle_frame(&f, &mut server_cipher, &mut to_client, 0.0)?;
//!             }
//!             DecodeOutcome::NeedMoreBytes => break,
//!             other => panic!("unexpected {other:?}"),
//!         }
//!         input.clear();
//!     }
//!     loop {
//!         match client_rx.decode(&to_client, Some(&mut client_cipher)) {
//!             DecodeOutcome::HandshakeFrame(f) => {
//!                 client.handle_frame(&f, &mut client_cipher, &mut to_server, 0.0)?;
//!             }
//!             DecodeOutcome::NeedMoreBytes => break,
//!             other => panic!("unexpected {other:?}"),
//!         }
//!         to_client.clear();
//!     }
//! }
//! assert_eq!(client.peer_identity(), Some(server.own_public_key()));
//! assert_eq!(server.peer_identity(), Some(client.own_public_key()));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cipher;
pub mod constants;
mod handshake;
pub mod timing;

pub use cipher::{DirectionalKey, RekeyPolicy, SessionCipher};
pub use handshake::*;
pub use timing::Timing;
