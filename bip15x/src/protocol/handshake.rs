//! The two stage handshake: key exchange, then identity authentication
//!
//! ```text
//! Initiator                                    Responder
//!   SETUP                        ---->
//!                                <----         PRESENT_PUBKEY(R)
//!                                <----         ENC_INIT(eR1, suite)
//!   ENC_ACK(eI1)                 ---->
//!   ENC_INIT(eI2, suite)         ---->
//!                                <----         ENC_ACK(eR2)
//!   ........................ cipher active ........................
//!   AUTH_CHALLENGE(H(sid|i|R))   ---->
//!                                <----         AUTH_REPLY(sig_R(sid|i))
//!   AUTH_PROPOSE(H(sid|p|I))     ---->
//!                                <----         AUTH_CHALLENGE(H(sid|r|I))
//!   AUTH_REPLY(sig_I(sid|r))     ---->
//!   ............. both sides rekey, session established ..........
//! ```
//!
//! An ENC_INIT/ENC_ACK pair keys the direction from the ENC_INIT sender to
//! the ENC_ACK sender. The initiator consults its [PeerKeyStore] once the
//! cipher is active; an unknown responder key pauses the handshake in
//! [HandshakeState::AwaitingPeerPubkeyVerdict] until [HandshakeEngine::verdict]
//! is called.

use std::sync::Arc;

use log::{debug, info, warn};
use rand::thread_rng;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::codec::encode_packet;
use crate::hash_domains;
use crate::identity::{parse_public_key, verify_signature, IdentityKeyPair, SIGNATURE_LEN};
use crate::msgs::{HandshakeFrame, MsgType, CIPHER_SUITE_CHACHA20POLY1305, CONTROL_MSG_ID};
use crate::peers::PeerKeyStore;
use crate::{Error, Result};

use super::cipher::{DirectionalKey, SessionCipher};
use super::timing::Timing;

/// Length of AUTH_CHALLENGE and AUTH_PROPOSE payloads
pub const AUTH_HASH_LEN: usize = 32;

const MARKER_INITIATOR: u8 = b'i';
const MARKER_RESPONDER: u8 = b'r';
const MARKER_PROPOSE: u8 = b'p';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends SETUP and verifies the key the responder presents
    Initiator,
    /// Presents its identity first and matches the initiator's proposal
    Responder,
}

/// Whether a responder insists on knowing the initiator's identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Both sides must be known to each other
    #[default]
    TwoWay,
    /// Unknown initiators are served anonymously
    OneWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    Idle,
    AwaitingEncInit,
    AwaitingEncAck,
    AwaitingPeerPubkeyVerdict,
    AwaitingAuthReply,
    AwaitingAuthChallenge,
    AwaitingAuthPropose,
    Established,
    RekeyPending,
    Closed,
}

/// An unknown responder key waiting for a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyRequest {
    /// Key previously bound to the peer's address
    pub old_key: Option<PublicKey>,
    /// Key the peer presented
    pub new_key: PublicKey,
}

/// The type returned by [HandshakeEngine::handle_frame]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandleFrameResult {
    /// The handshake is paused until [HandshakeEngine::verdict] is called
    pub verify: Option<VerifyRequest>,
    /// This frame completed the handshake
    pub established: bool,
}

/// Ephemeral key sent in our ENC_INIT
struct EphemeralKey {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKey {
    fn generate() -> Self {
        let secret = SecretKey::new(&mut thread_rng());
        let public = PublicKey::from_secret_key_global(&secret);
        Self { secret, public }
    }

    fn enc_init_payload(&self) -> Vec<u8> {
        let mut payload = self.public.serialize().to_vec();
        payload.push(CIPHER_SUITE_CHACHA20POLY1305);
        payload
    }
}

/// Keys derived before the cipher is switched on
#[derive(Default)]
struct KeyExchange {
    own_init: Option<EphemeralKey>,
    outbound: Option<DirectionalKey>,
    inbound: Option<DirectionalKey>,
}

fn ecdh(peer: &PublicKey, own: &SecretKey) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(SharedSecret::new(peer, own).secret_bytes())
}

fn hash_err(e: anyhow::Error) -> Error {
    Error::Crypto(e.to_string())
}

fn auth_hash(sid: &[u8; 32], marker: u8, key: &PublicKey) -> Result<[u8; AUTH_HASH_LEN]> {
    Ok(hash_domains::auth_challenge()
        .and_then(|d| d.mix(sid))
        .and_then(|d| d.mix(&[marker]))
        .and_then(|d| d.mix(&key.serialize()))
        .map_err(hash_err)?
        .into_value())
}

fn reply_digest(sid: &[u8; 32], marker: u8) -> Result<[u8; 32]> {
    Ok(hash_domains::auth_reply()
        .and_then(|d| d.mix(sid))
        .and_then(|d| d.mix(&[marker]))
        .map_err(hash_err)?
        .into_value())
}

fn failed<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::HandshakeFailed(msg.into()))
}

/// Drives one side of the handshake of one channel
pub struct HandshakeEngine {
    role: HandshakeRole,
    state: HandshakeState,
    auth_mode: AuthMode,
    peer_address: String,
    store: Arc<PeerKeyStore>,
    identity: IdentityKeyPair,
    kex: KeyExchange,
    auth_sid: Option<[u8; 32]>,
    presented_key: Option<PublicKey>,
    peer_identity: Option<PublicKey>,
}

impl std::fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_address", &self.peer_address)
            .finish_non_exhaustive()
    }
}

impl HandshakeEngine {
    /// `peer_address` is the label the peer's key is looked up and remembered under
    pub fn new(
        role: HandshakeRole,
        peer_address: impl Into<String>,
        store: Arc<PeerKeyStore>,
        auth_mode: AuthMode,
    ) -> Self {
        let identity = store.own_identity();
        Self {
            role,
            state: HandshakeState::Idle,
            auth_mode,
            peer_address: peer_address.into(),
            store,
            identity,
            kex: KeyExchange::default(),
            auth_sid: None,
            presented_key: None,
            peer_identity: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub fn own_public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandshakeState::Closed
    }

    /// The authenticated identity of the peer
    ///
    /// `None` before the handshake completed and for initiators a
    /// [AuthMode::OneWay] responder served anonymously.
    pub fn peer_identity(&self) -> Option<PublicKey> {
        match self.state {
            HandshakeState::Established | HandshakeState::RekeyPending => self.peer_identity,
            _ => None,
        }
    }

    /// Begin the handshake; only initiators send anything
    pub fn start(
        &mut self,
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
        _now: Timing,
    ) -> Result<()> {
        if self.state != HandshakeState::Idle {
            return self.fail(format!("start called in state {:?}", self.state));
        }
        match self.role {
            HandshakeRole::Initiator => {
                self.send(MsgType::Setup, &[], cipher, tx)?;
                self.transition(HandshakeState::AwaitingEncInit);
            }
            HandshakeRole::Responder => debug!("Responder waits for SETUP from {}", self.peer_address),
        }
        Ok(())
    }

    /// Process one handshake frame, appending any responses to `tx`
    ///
    /// Every error is fatal; the engine is [HandshakeState::Closed] afterwards.
    pub fn handle_frame(
        &mut self,
        frame: &HandshakeFrame,
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
        now: Timing,
    ) -> Result<HandleFrameResult> {
        debug!(
            "Rx {:?} in state {:?} from {}",
            frame.msg_type, self.state, self.peer_address
        );
        let res = match self.role {
            HandshakeRole::Initiator => self.handle_as_initiator(frame, cipher, tx, now),
            HandshakeRole::Responder => self.handle_as_responder(frame, cipher, tx, now),
        };
        if let Err(e) = &res {
            warn!("Handshake with {} failed: {e}", self.peer_address);
            self.close();
        }
        res
    }

    /// Resolve the pending verification of the responder's key
    ///
    /// Accepting binds the key to the peer address and continues with the
    /// authentication; rejecting fails the handshake without storing anything.
    pub fn verdict(
        &mut self,
        accept: bool,
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
    ) -> Result<()> {
        if self.state != HandshakeState::AwaitingPeerPubkeyVerdict {
            return self.fail(format!("verdict given in state {:?}", self.state));
        }
        let Some(key) = self.presented_key else {
            return self.fail("no peer key to decide on");
        };
        if !accept {
            return self.fail(format!("peer key of {} was rejected", self.peer_address));
        }
        if let Err(e) = self.store.remember(&self.peer_address, key) {
            return self.fail(format!("could not remember peer key: {e:#}"));
        }
        info!("Trusting new key of {} from now on", self.peer_address);
        let res = self.send_initiator_challenge(key, cipher, tx);
        if res.is_err() {
            self.close();
        }
        res
    }

    /// Rotate the outbound key, announcing it to the peer with a REKEY frame
    pub fn rekey(&mut self, cipher: &mut SessionCipher, tx: &mut Vec<u8>, now: Timing) -> Result<()> {
        if self.state != HandshakeState::Established {
            return Err(Error::HandshakeFailed(format!(
                "rekey requested in state {:?}",
                self.state
            )));
        }
        self.state = HandshakeState::RekeyPending;
        // The REKEY frame itself is still sealed with the old key
        self.send(MsgType::Rekey, &[], cipher, tx)?;
        cipher.rekey_outbound(now)?;
        self.state = HandshakeState::Established;
        debug!("Rekeyed outbound direction to {}", self.peer_address);
        Ok(())
    }

    /// Stop the handshake and erase any pending key material
    pub fn close(&mut self) {
        self.kex = KeyExchange::default();
        self.auth_sid = None;
        self.state = HandshakeState::Closed;
    }

    fn fail<T>(&mut self, msg: impl Into<String>) -> Result<T> {
        self.close();
        failed(msg)
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(
            "Handshake with {}: {:?} -> {:?}",
            self.peer_address, self.state, next
        );
        self.state = next;
    }

    fn send(
        &mut self,
        msg_type: MsgType,
        payload: &[u8],
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
    ) -> Result<()> {
        let packet = encode_packet(msg_type, CONTROL_MSG_ID, payload, Some(cipher))?;
        tx.extend_from_slice(&packet);
        Ok(())
    }

    fn auth_sid(&self) -> Result<[u8; 32]> {
        self.auth_sid
            .ok_or_else(|| Error::HandshakeFailed("session is not encrypted".into()))
    }

    /// Answer a peer's ENC_INIT with ENC_ACK and derive the inbound direction
    fn ack_enc_init(
        &mut self,
        payload: &[u8],
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
    ) -> Result<()> {
        let Some((&suite, peer_pub)) = payload.split_last() else {
            return failed("empty ENC_INIT");
        };
        if suite != CIPHER_SUITE_CHACHA20POLY1305 {
            return failed(format!("unsupported cipher suite {suite:#04x}"));
        }
        let peer_eph = parse_public_key(peer_pub)?;
        let own = EphemeralKey::generate();
        let shared = ecdh(&peer_eph, &own.secret);
        let own_pub = own.public.serialize();
        self.kex.inbound = Some(DirectionalKey::derive(&*shared, peer_pub, &own_pub)?);
        self.send(MsgType::EncAck, &own_pub, cipher, tx)
    }

    /// Derive the outbound direction from the peer's ENC_ACK
    fn complete_enc_init(&mut self, payload: &[u8]) -> Result<()> {
        let Some(own) = self.kex.own_init.take() else {
            return failed("ENC_ACK without ENC_INIT");
        };
        let peer_eph = parse_public_key(payload)?;
        let shared = ecdh(&peer_eph, &own.secret);
        self.kex.outbound = Some(DirectionalKey::derive(
            &*shared,
            &own.public.serialize(),
            payload,
        )?);
        Ok(())
    }

    /// Switch the cipher on once both directions are known
    fn activate(&mut self, cipher: &mut SessionCipher, now: Timing) -> Result<()> {
        let (Some(outbound), Some(inbound)) = (self.kex.outbound.take(), self.kex.inbound.take())
        else {
            return failed("key exchange incomplete");
        };
        let (to_responder, to_initiator) = match self.role {
            HandshakeRole::Initiator => (outbound.session_id(), inbound.session_id()),
            HandshakeRole::Responder => (inbound.session_id(), outbound.session_id()),
        };
        let sid = hash_domains::channel_id()
            .and_then(|d| d.mix(to_responder))
            .and_then(|d| d.mix(to_initiator))
            .map_err(hash_err)?
            .into_value();
        self.auth_sid = Some(sid);
        cipher.activate(outbound, inbound, now);
        debug!("Encryption with {} active", self.peer_address);
        Ok(())
    }

    fn finish(&mut self, cipher: &mut SessionCipher, now: Timing) -> Result<HandleFrameResult> {
        cipher.rekey_both(now)?;
        self.auth_sid = None;
        self.transition(HandshakeState::Established);
        match self.peer_identity {
            Some(key) => info!(
                "Session with {} established, peer identity {}",
                self.peer_address,
                hex::encode(key.serialize())
            ),
            None => info!(
                "Session with {} established, peer is anonymous",
                self.peer_address
            ),
        }
        Ok(HandleFrameResult {
            verify: None,
            established: true,
        })
    }

    fn handle_rekey(&mut self, frame: &HandshakeFrame, cipher: &mut SessionCipher) -> Result<HandleFrameResult> {
        if !frame.payload.is_empty() {
            return failed("REKEY frame with payload");
        }
        cipher.rekey_inbound()?;
        debug!("Peer {} rekeyed its outbound direction", self.peer_address);
        Ok(HandleFrameResult::default())
    }

    fn send_initiator_challenge(
        &mut self,
        responder_key: PublicKey,
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
    ) -> Result<()> {
        let challenge = auth_hash(&self.auth_sid()?, MARKER_INITIATOR, &responder_key)?;
        self.send(MsgType::AuthChallenge, &challenge, cipher, tx)?;
        self.transition(HandshakeState::AwaitingAuthReply);
        Ok(())
    }

    fn handle_as_initiator(
        &mut self,
        frame: &HandshakeFrame,
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
        now: Timing,
    ) -> Result<HandleFrameResult> {
        use HandshakeState as S;
        use MsgType as M;

        let payload = frame.payload.as_slice();
        match (self.state, frame.msg_type) {
            (S::AwaitingEncInit, M::PresentPubkey) => {
                if self.presented_key.is_some() {
                    return failed("identity presented twice");
                }
                self.presented_key = Some(parse_public_key(payload)?);
            }
            (S::AwaitingEncInit, M::EncInit) => {
                self.ack_enc_init(payload, cipher, tx)?;
                let own = EphemeralKey::generate();
                self.send(M::EncInit, &own.enc_init_payload(), cipher, tx)?;
                self.kex.own_init = Some(own);
                self.transition(S::AwaitingEncAck);
            }
            (S::AwaitingEncAck, M::EncAck) => {
                self.complete_enc_init(payload)?;
                self.activate(cipher, now)?;

                let Some(key) = self.presented_key else {
                    return failed("responder did not present its identity");
                };
                // only the key bound to this address counts, not keys trusted for other peers
                let bound = self.store.lookup(&self.peer_address);
                if bound == Some(key) {
                    self.send_initiator_challenge(key, cipher, tx)?;
                } else {
                    self.transition(S::AwaitingPeerPubkeyVerdict);
                    return Ok(HandleFrameResult {
                        verify: Some(VerifyRequest {
                            old_key: bound,
                            new_key: key,
                        }),
                        established: false,
                    });
                }
            }
            (S::AwaitingAuthReply, M::AuthReply) => {
                let Some(key) = self.presented_key else {
                    return failed("no responder identity");
                };
                let digest = reply_digest(&self.auth_sid()?, MARKER_INITIATOR)?;
                if !verify_signature(&key, &digest, payload) {
                    return failed("responder signature does not verify");
                }
                self.peer_identity = Some(key);
                let propose = auth_hash(&self.auth_sid()?, MARKER_PROPOSE, &self.identity.public_key())?;
                self.send(M::AuthPropose, &propose, cipher, tx)?;
                self.transition(S::AwaitingAuthChallenge);
            }
            (S::AwaitingAuthChallenge, M::AuthChallenge) => {
                let sid = self.auth_sid()?;
                let anonymous = payload.len() == AUTH_HASH_LEN && payload.iter().all(|&b| b == 0);
                let reply = if anonymous {
                    debug!("{} serves us anonymously", self.peer_address);
                    [0u8; SIGNATURE_LEN]
                } else {
                    let expected = auth_hash(&sid, MARKER_RESPONDER, &self.identity.public_key())?;
                    if payload != expected {
                        return failed("responder challenged a different identity");
                    }
                    self.identity.sign(&reply_digest(&sid, MARKER_RESPONDER)?)
                };
                self.send(M::AuthReply, &reply, cipher, tx)?;
                return self.finish(cipher, now);
            }
            (S::Established, M::Rekey) => return self.handle_rekey(frame, cipher),
            (state, msg_type) => {
                return failed(format!("unexpected {msg_type:?} in state {state:?}"));
            }
        }
        Ok(HandleFrameResult::default())
    }

    fn handle_as_responder(
        &mut self,
        frame: &HandshakeFrame,
        cipher: &mut SessionCipher,
        tx: &mut Vec<u8>,
        now: Timing,
    ) -> Result<HandleFrameResult> {
        use HandshakeState as S;
        use MsgType as M;

        let payload = frame.payload.as_slice();
        match (self.state, frame.msg_type) {
            (S::Idle, M::Setup) => {
                if !payload.is_empty() {
                    return failed("SETUP frame with payload");
                }
                let own_pub = self.identity.public_key().serialize();
                self.send(M::PresentPubkey, &own_pub, cipher, tx)?;
                let own = EphemeralKey::generate();
                self.send(M::EncInit, &own.enc_init_payload(), cipher, tx)?;
                self.kex.own_init = Some(own);
                self.transition(S::AwaitingEncAck);
            }
            (S::AwaitingEncAck, M::EncAck) => {
                self.complete_enc_init(payload)?;
                self.transition(S::AwaitingEncInit);
            }
            (S::AwaitingEncInit, M::EncInit) => {
                // The ENC_ACK leaves in plaintext, everything after it is sealed
                self.ack_enc_init(payload, cipher, tx)?;
                self.activate(cipher, now)?;
                self.transition(S::AwaitingAuthChallenge);
            }
            (S::AwaitingAuthChallenge, M::AuthChallenge) => {
                let sid = self.auth_sid()?;
                let expected = auth_hash(&sid, MARKER_INITIATOR, &self.identity.public_key())?;
                if payload != expected {
                    return failed("initiator challenged a different identity");
                }
                let reply = self.identity.sign(&reply_digest(&sid, MARKER_INITIATOR)?);
                self.send(M::AuthReply, &reply, cipher, tx)?;
                self.transition(S::AwaitingAuthPropose);
            }
            (S::AwaitingAuthPropose, M::AuthPropose) => {
                let sid = self.auth_sid()?;
                let mut matched = None;
                for key in self.store.public_keys() {
                    if auth_hash(&sid, MARKER_PROPOSE, &key)? == payload {
                        matched = Some(key);
                        break;
                    }
                }
                let challenge = match (matched, self.auth_mode) {
                    (Some(key), _) => auth_hash(&sid, MARKER_RESPONDER, &key)?,
                    (None, AuthMode::OneWay) => {
                        debug!("Serving unknown initiator {} anonymously", self.peer_address);
                        [0u8; AUTH_HASH_LEN]
                    }
                    (None, AuthMode::TwoWay) => {
                        return failed(format!(
                            "initiator {} proposed an unknown identity",
                            self.peer_address
                        ));
                    }
                };
                self.peer_identity = matched;
                self.send(M::AuthChallenge, &challenge, cipher, tx)?;
                self.transition(S::AwaitingAuthReply);
            }
            (S::AwaitingAuthReply, M::AuthReply) => {
                let sid = self.auth_sid()?;
                let valid = match self.peer_identity {
                    Some(key) => {
                        verify_signature(&key, &reply_digest(&sid, MARKER_RESPONDER)?, payload)
                    }
                    None => payload.len() == SIGNATURE_LEN && payload.iter().all(|&b| b == 0),
                };
                if !valid {
                    return failed("initiator signature does not verify");
                }
                return self.finish(cipher, now);
            }
            (S::Established, M::Rekey) => return self.handle_rekey(frame, cipher),
            (state, msg_type) => {
                return failed(format!("unexpected {msg_type:?} in state {state:?}"));
            }
        }
        Ok(HandleFrameResult::default())
    }
}
