//! Long-term identity keys
//!
//! Identities are secp256k1 key pairs. Public keys travel as 33-byte
//! compressed points and are displayed as lowercase hex.

use rand::thread_rng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Length of a serialized, compressed public key
pub const PUBLIC_KEY_LEN: usize = 33;
/// Length of a serialized secret key
pub const SECRET_KEY_LEN: usize = 32;
/// Length of a compact ECDSA signature
pub const SIGNATURE_LEN: usize = 64;

/// The local side's long-term identity
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut thread_rng());
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key_global(&secret);
        Self { secret, public }
    }

    pub fn from_secret_hex(hex_sk: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_sk.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?,
        );
        Ok(Self::from_secret(SecretKey::from_slice(&bytes)?))
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn public_hex(&self) -> String {
        public_key_hex(&self.public)
    }

    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret.secret_bytes()))
    }

    /// Sign a 32 byte digest; returns the compact signature
    pub fn sign(&self, digest: &[u8; 32]) -> [u8; SIGNATURE_LEN] {
        let msg = Message::from_digest(*digest);
        SECP256K1.sign_ecdsa(&msg, &self.secret).serialize_compact()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

/// Check a compact signature over a 32 byte digest
pub fn verify_signature(key: &PublicKey, digest: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    SECP256K1
        .verify_ecdsa(&Message::from_digest(*digest), &sig, key)
        .is_ok()
}

pub fn public_key_hex(key: &PublicKey) -> String {
    hex::encode(key.serialize())
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "expected {PUBLIC_KEY_LEN} byte compressed key, got {} bytes",
            bytes.len()
        )));
    }
    Ok(PublicKey::from_slice(bytes)?)
}

pub fn parse_public_key_hex(s: &str) -> Result<PublicKey> {
    let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
    parse_public_key(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let id = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let digest = [9u8; 32];
        let sig = id.sign(&digest);

        assert!(verify_signature(&id.public_key(), &digest, &sig));
        assert!(!verify_signature(&other.public_key(), &digest, &sig));
        assert!(!verify_signature(&id.public_key(), &[8u8; 32], &sig));
        assert!(!verify_signature(&id.public_key(), &digest, &[0u8; 10]));
    }

    #[test]
    fn hex_round_trip() -> Result<()> {
        let id = IdentityKeyPair::generate();
        assert_eq!(IdentityKeyPair::from_secret_hex(&id.secret_hex())?, id);
        assert_eq!(parse_public_key_hex(&id.public_hex())?, id.public_key());
        assert_eq!(id.public_hex().len(), 2 * PUBLIC_KEY_LEN);
        assert!(parse_public_key(&[2u8; 32]).is_err());
        Ok(())
    }
}
