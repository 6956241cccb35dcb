//! Key derivation through chains of keyed hashes
//!
//!```rust
//! # use bip15x_ciphers::hash_domain::{HashDomain, HashDomainNamespace};
//!
//! const PROTOCOL_IDENTIFIER: &str = "MY_PROTOCOL:IDENTIFIER";
//! // create use once hash domain for the protocol identifier
//! let mut hash_domain = HashDomain::zero();
//! hash_domain = hash_domain.mix(PROTOCOL_IDENTIFIER.as_bytes())?;
//! // upgrade to reusable hash domain
//! let hash_domain_namespace: HashDomainNamespace = hash_domain.dup();
//! // derive new key
//! let key_identifier = "my_key_identifier";
//! let key = hash_domain_namespace.mix(key_identifier.as_bytes())?.into_value();
//! // derive a new key based on a secret
//! let secret_hash_domain = hash_domain_namespace.mix_secret(b"my super duper secret")?;
//! let new_key = secret_hash_domain.mix(b"my_new_key_identifier")?.into_secret();
//! assert_ne!(key, *new_key);
//!
//! # Ok::<(), anyhow::Error>(())
//!```
//!

use anyhow::Result;
use zeroize::Zeroizing;

use crate::keyed_hash::hash;
pub use crate::KEY_LEN;

/// A use-once hash domain for a specified key that can be used directly.
/// If the key must remain secret, use [SecretHashDomain] instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashDomain([u8; KEY_LEN]);

/// A reusable hash domain for a namespace identified by the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashDomainNamespace([u8; KEY_LEN]);

/// A use-once hash domain whose key is erased from memory when dropped
#[derive(Clone)]
pub struct SecretHashDomain(Zeroizing<[u8; KEY_LEN]>);

impl HashDomain {
    /// Creates a new [HashDomain] initialized with a all-zeros key.
    pub fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    /// Turns this [HashDomain] into a [HashDomainNamespace], keeping the key.
    pub fn dup(self) -> HashDomainNamespace {
        HashDomainNamespace(self.0)
    }

    /// Creates a new [HashDomain] by hashing `v` under this domain's key and
    /// using the digest as the key of the new domain.
    pub fn mix(self, v: &[u8]) -> Result<Self> {
        let mut new_key = [0u8; KEY_LEN];
        hash(&self.0, v, &mut new_key)?;
        Ok(Self(new_key))
    }

    /// Version of [Self::mix] that accepts an iterator and mixes all values from the iterator into
    /// this hash domain.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bip15x_ciphers::hash_domain::HashDomain;
    ///
    /// let hasher = HashDomain::zero();
    /// assert_eq!(
    ///     hasher.clone().mix(b"Hello")?.mix(b"World")?.into_value(),
    ///     hasher.clone().mix_many([b"Hello", b"World"])?.into_value()
    /// );
    ///
    /// Ok::<(), anyhow::Error>(())
    /// ```
    pub fn mix_many<I, T>(mut self, it: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        for e in it {
            self = self.mix(e.as_ref())?;
        }
        Ok(self)
    }

    /// Creates a new [SecretHashDomain] by mixing in the secret `v`.
    pub fn mix_secret(self, v: &[u8]) -> Result<SecretHashDomain> {
        SecretHashDomain::invoke_primitive(&self.0, v)
    }

    /// Gets the key of this [HashDomain].
    pub fn into_value(self) -> [u8; KEY_LEN] {
        self.0
    }
}

impl HashDomainNamespace {
    /// Creates a new [HashDomain] by mixing in `v`; the namespace itself stays reusable.
    pub fn mix(&self, v: &[u8]) -> Result<HashDomain> {
        let mut new_key = [0u8; KEY_LEN];
        hash(&self.0, v, &mut new_key)?;
        Ok(HashDomain(new_key))
    }

    /// Creates a new [SecretHashDomain] by mixing in the secret `v`.
    pub fn mix_secret(&self, v: &[u8]) -> Result<SecretHashDomain> {
        SecretHashDomain::invoke_primitive(&self.0, v)
    }
}

impl SecretHashDomain {
    /// Hash `d` under the key `k` and keep the digest as a secret key
    pub fn invoke_primitive(k: &[u8; KEY_LEN], d: &[u8]) -> Result<SecretHashDomain> {
        let mut new_secret_key = Zeroizing::new([0u8; KEY_LEN]);
        hash(k, d, &mut new_secret_key)?;
        Ok(SecretHashDomain(new_secret_key))
    }

    /// Creates a new [SecretHashDomain] by mixing in `v`.
    pub fn mix(self, v: &[u8]) -> Result<SecretHashDomain> {
        Self::invoke_primitive(&self.0, v)
    }

    /// Version of [Self::mix] that accepts an iterator
    pub fn mix_many<I, T>(mut self, it: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        for e in it {
            self = self.mix(e.as_ref())?;
        }
        Ok(self)
    }

    /// Get the secret key data from this [SecretHashDomain].
    pub fn into_secret(self) -> Zeroizing<[u8; KEY_LEN]> {
        self.0
    }
}

impl std::fmt::Debug for SecretHashDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHashDomain(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_and_domain_agree() -> Result<()> {
        let ns = HashDomain::zero().mix(b"ns")?.dup();
        let direct = HashDomain::zero().mix(b"ns")?.mix(b"label")?.into_value();
        assert_eq!(ns.mix(b"label")?.into_value(), direct);
        Ok(())
    }

    #[test]
    fn secret_and_public_chains_agree() -> Result<()> {
        let public = HashDomain::zero().mix(b"a")?.mix(b"b")?.into_value();
        let secret = HashDomain::zero().mix_secret(b"a")?.mix(b"b")?.into_secret();
        assert_eq!(public, *secret);
        Ok(())
    }

    #[test]
    fn order_matters() -> Result<()> {
        let ab = HashDomain::zero().mix_many([b"a", b"b"])?.into_value();
        let ba = HashDomain::zero().mix_many([b"b", b"a"])?.into_value();
        assert_ne!(hex::encode(ab), hex::encode(ba));
        Ok(())
    }
}
