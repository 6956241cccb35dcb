//! The negotiated symmetric session
//!
//! Each direction of a channel has its own ChaCha20-Poly1305 key, a public
//! session id and a packet counter that doubles as the nonce. Both directions
//! are installed together by [SessionCipher::activate]; from then on every
//! packet is sealed. Rekeying replaces a direction's key by a hash of its
//! session id and the old key, so both sides stay in lock-step without any
//! key material on the wire.

use zeroize::Zeroizing;

use bip15x_ciphers::aead::{self, counter_nonce, TAG_LEN};
use bip15x_ciphers::KEY_LEN;

use crate::hash_domains;
use crate::{Error, Result};

use super::constants::{REKEY_AFTER_BYTES, REKEY_AFTER_TIME};
use super::timing::{has_happened, Timing, BCE};

/// Length of a directional session id
pub const SESSION_ID_LEN: usize = 32;

fn crypto_err(e: anyhow::Error) -> Error {
    Error::Crypto(e.to_string())
}

/// When the outbound key has to be rotated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RekeyPolicy {
    pub max_bytes: u64,
    pub max_age: Timing,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_bytes: REKEY_AFTER_BYTES,
            max_age: REKEY_AFTER_TIME,
        }
    }
}

/// Key material of one direction
pub struct DirectionalKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    session_id: [u8; SESSION_ID_LEN],
    counter: u64,
}

impl DirectionalKey {
    /// Derive a direction from the ECDH secret of an ENC_INIT/ENC_ACK pair
    ///
    /// `init_pub` is the ephemeral key carried by ENC_INIT, `ack_pub` the one
    /// carried by ENC_ACK; both sides pass them in this order.
    pub fn derive(shared_secret: &[u8], init_pub: &[u8], ack_pub: &[u8]) -> Result<Self> {
        let key = hash_domains::session_key()
            .and_then(|d| d.mix_secret(shared_secret))
            .and_then(|d| d.mix_many([init_pub, ack_pub]))
            .map_err(crypto_err)?
            .into_secret();
        let sid = hash_domains::session_id()
            .and_then(|d| d.mix_secret(shared_secret))
            .and_then(|d| d.mix_many([init_pub, ack_pub]))
            .map_err(crypto_err)?
            .into_secret();
        Ok(Self {
            key,
            session_id: *sid,
            counter: 0,
        })
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    fn next_nonce(&mut self) -> Result<[u8; aead::NONCE_LEN]> {
        let nonce = counter_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| Error::Crypto("packet counter exhausted".into()))?;
        Ok(nonce)
    }

    fn rekey(&mut self) -> Result<()> {
        let next = hash_domains::rekey()
            .and_then(|d| d.mix(&self.session_id))
            .and_then(|d| d.mix_secret(&self.key[..]))
            .map_err(crypto_err)?
            .into_secret();
        self.key = next;
        self.counter = 0;
        Ok(())
    }
}

impl std::fmt::Debug for DirectionalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionalKey")
            .field("session_id", &hex::encode(self.session_id))
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Both directions plus the rekey accounting
#[derive(Debug)]
pub struct SessionKeys {
    outbound: DirectionalKey,
    inbound: DirectionalKey,
    bytes_since_rekey: u64,
    last_rekey: Timing,
}

#[derive(Debug)]
pub struct SessionCipher {
    keys: Option<SessionKeys>,
    policy: RekeyPolicy,
    outbound_rekeys: u64,
    inbound_rekeys: u64,
}

impl Default for SessionCipher {
    fn default() -> Self {
        Self::new(RekeyPolicy::default())
    }
}

impl SessionCipher {
    /// An inactive cipher; packets pass in plaintext until [Self::activate]
    pub fn new(policy: RekeyPolicy) -> Self {
        Self {
            keys: None,
            policy,
            outbound_rekeys: 0,
            inbound_rekeys: 0,
        }
    }

    /// Install both directions at once
    pub fn activate(&mut self, outbound: DirectionalKey, inbound: DirectionalKey, now: Timing) {
        self.keys = Some(SessionKeys {
            outbound,
            inbound,
            bytes_since_rekey: 0,
            last_rekey: now,
        });
    }

    /// Erase the session keys
    pub fn deactivate(&mut self) {
        self.keys = None;
    }

    pub fn is_active(&self) -> bool {
        self.keys.is_some()
    }

    pub fn policy(&self) -> &RekeyPolicy {
        &self.policy
    }

    /// Session ids of the (outbound, inbound) directions
    pub fn session_ids(&self) -> Option<([u8; SESSION_ID_LEN], [u8; SESSION_ID_LEN])> {
        self.keys
            .as_ref()
            .map(|k| (k.outbound.session_id, k.inbound.session_id))
    }

    fn keys_mut(&mut self) -> Result<&mut SessionKeys> {
        self.keys
            .as_mut()
            .ok_or_else(|| Error::Crypto("session cipher is not active".into()))
    }

    /// Seal `plaintext` for the outbound direction; returns ciphertext and tag
    pub fn encrypt(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys_mut()?;
        let nonce = keys.outbound.next_nonce()?;
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
        aead::encrypt(&mut ciphertext, &keys.outbound.key, &nonce, ad, plaintext)
            .map_err(crypto_err)?;
        keys.bytes_since_rekey = keys
            .bytes_since_rekey
            .saturating_add(plaintext.len() as u64);
        Ok(ciphertext)
    }

    /// Open a packet of the inbound direction
    ///
    /// The packet counter only advances when authentication succeeds.
    pub fn decrypt(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys_mut()?;
        if ciphertext.len() < TAG_LEN {
            return Err(Error::DecryptionFailed);
        }
        let nonce = counter_nonce(keys.inbound.counter);
        let mut plaintext = vec![0u8; ciphertext.len() - TAG_LEN];
        aead::decrypt(&mut plaintext, &keys.inbound.key, &nonce, ad, ciphertext)
            .map_err(|_| Error::DecryptionFailed)?;
        keys.inbound.next_nonce()?;
        Ok(plaintext)
    }

    /// Whether the outbound key must be rotated before sending `next_len` more bytes
    pub fn rekey_needed(&self, next_len: usize, now: Timing) -> bool {
        let Some(keys) = self.keys.as_ref() else {
            return false;
        };
        let bytes = keys.bytes_since_rekey.saturating_add(next_len as u64);
        bytes > self.policy.max_bytes || has_happened(keys.last_rekey + self.policy.max_age, now)
    }

    /// Plaintext bytes sealed since the last outbound rekey
    pub fn bytes_since_rekey(&self) -> u64 {
        self.keys.as_ref().map_or(0, |k| k.bytes_since_rekey)
    }

    /// Time of the last outbound rekey, [BCE] while inactive
    pub fn last_rekey(&self) -> Timing {
        self.keys.as_ref().map_or(BCE, |k| k.last_rekey)
    }

    /// Number of (outbound, inbound) rekeys performed
    pub fn rekey_count(&self) -> (u64, u64) {
        (self.outbound_rekeys, self.inbound_rekeys)
    }

    pub fn rekey_outbound(&mut self, now: Timing) -> Result<()> {
        let keys = self.keys_mut()?;
        keys.outbound.rekey()?;
        keys.bytes_since_rekey = 0;
        keys.last_rekey = now;
        self.outbound_rekeys += 1;
        Ok(())
    }

    pub fn rekey_inbound(&mut self) -> Result<()> {
        self.keys_mut()?.inbound.rekey()?;
        self.inbound_rekeys += 1;
        Ok(())
    }

    pub fn rekey_both(&mut self, now: Timing) -> Result<()> {
        self.rekey_outbound(now)?;
        self.rekey_inbound()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two ciphers facing each other, as after a completed key exchange
    pub(crate) fn cipher_pair(policy: RekeyPolicy) -> Result<(SessionCipher, SessionCipher)> {
        let a_to_b = || DirectionalKey::derive(&[1u8; 32], &[2u8; 33], &[3u8; 33]);
        let b_to_a = || DirectionalKey::derive(&[4u8; 32], &[5u8; 33], &[6u8; 33]);

        let mut a = SessionCipher::new(policy);
        let mut b = SessionCipher::new(policy);
        a.activate(a_to_b()?, b_to_a()?, 0.0);
        b.activate(b_to_a()?, a_to_b()?, 0.0);
        Ok((a, b))
    }

    #[test]
    fn inactive_cipher_refuses_to_work() {
        let mut c = SessionCipher::default();
        assert!(!c.is_active());
        assert!(c.encrypt(&[], b"x").is_err());
        assert!(!c.rekey_needed(usize::MAX, 1e9));
        assert_eq!(c.last_rekey(), BCE);
    }

    #[test]
    fn directions_are_independent() -> Result<()> {
        let (mut a, mut b) = cipher_pair(RekeyPolicy::default())?;
        let ct = a.encrypt(b"ad", b"to b")?;
        assert_eq!(b.decrypt(b"ad", &ct)?, b"to b");

        // a cannot open its own outbound traffic
        let ct = a.encrypt(b"ad", b"again")?;
        assert!(matches!(a.decrypt(b"ad", &ct), Err(Error::DecryptionFailed)));
        assert_eq!(b.decrypt(b"ad", &ct)?, b"again");
        Ok(())
    }

    #[test]
    fn failed_decryption_does_not_advance_counter() -> Result<()> {
        let (mut a, mut b) = cipher_pair(RekeyPolicy::default())?;
        let ct = a.encrypt(&[], b"payload")?;
        let mut bad = ct.clone();
        bad[0] ^= 1;
        assert!(matches!(b.decrypt(&[], &bad), Err(Error::DecryptionFailed)));
        assert_eq!(b.decrypt(&[], &ct)?, b"payload");
        Ok(())
    }

    #[test]
    fn rekey_keeps_sides_in_lock_step() -> Result<()> {
        let (mut a, mut b) = cipher_pair(RekeyPolicy::default())?;
        a.rekey_outbound(1.0)?;
        let ct = a.encrypt(&[], b"fresh key")?;
        assert!(b.decrypt(&[], &ct).is_err());
        b.rekey_inbound()?;
        assert_eq!(b.decrypt(&[], &ct)?, b"fresh key");
        assert_eq!(a.rekey_count(), (1, 0));
        assert_eq!(b.rekey_count(), (0, 1));
        Ok(())
    }

    #[test]
    fn rekey_thresholds() -> Result<()> {
        let policy = RekeyPolicy {
            max_bytes: 100,
            max_age: 10.0,
        };
        let (mut a, _) = cipher_pair(policy)?;
        assert!(!a.rekey_needed(100, 1.0));
        assert!(a.rekey_needed(101, 1.0));
        a.encrypt(&[], &[0u8; 60])?;
        assert_eq!(a.bytes_since_rekey(), 60);
        assert!(a.rekey_needed(41, 1.0));
        assert!(a.rekey_needed(0, 10.0));

        a.rekey_outbound(10.0)?;
        assert_eq!(a.bytes_since_rekey(), 0);
        assert!(!a.rekey_needed(0, 15.0));
        assert!(a.rekey_needed(0, 20.0));
        Ok(())
    }
}
