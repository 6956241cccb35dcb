//! Pseudo Random Functions (PRFs) with a tree-like label scheme which
//! ensures their uniqueness.
//!
//! Every key, session id and authentication hash of the transport is derived
//! under its own domain below [protocol], so no two purposes can ever produce
//! the same value from the same input.
//!
//! # Tutorial
//!
//! ```
//! use bip15x::{hash_domain, hash_domain_ns};
//! use bip15x::hash_domains::protocol;
//!
//! // Declaring a custom hash domain
//! hash_domain_ns!(protocol, custom_domain, "my custom hash domain label");
//!
//! // Declaring specific domain separators
//! hash_domain!(custom_domain, sep1, "1");
//! hash_domain!(custom_domain, sep2, "2");
//!
//! let v1 = custom_domain()?.mix(&sep1()?)?.mix(b"data")?.into_value();
//! let v2 = custom_domain()?.mix(&sep2()?)?.mix(b"data")?.into_value();
//! assert_ne!(v1, v2);
//!
//! Ok::<(), anyhow::Error>(())
//! ```

use anyhow::Result;
use bip15x_ciphers::hash_domain::HashDomain;

/// Declare a hash function
///
/// See the [module](self) documentation on how to use the hash domains in general
#[macro_export]
macro_rules! hash_domain_ns {
    ($(#[$($attrss:tt)*])* $base:ident, $name:ident, $($lbl:expr),+ ) => {
        $(#[$($attrss)*])*
        pub fn $name() -> ::anyhow::Result<::bip15x_ciphers::hash_domain::HashDomain> {
            let t = $base()?;
            $( let t = t.mix($lbl.as_bytes())?; )*
            Ok(t)
        }
    }
}

/// Declare a concrete hash value
///
/// See the [module](self) documentation on how to use the hash domains in general
#[macro_export]
macro_rules! hash_domain {
    ($(#[$($attrss:tt)*])* $base:ident, $name:ident, $($lbl:expr),+ ) => {
        $(#[$($attrss)*])*
        pub fn $name() -> ::anyhow::Result<[u8; ::bip15x_ciphers::KEY_LEN]> {
            let t = $base()?;
            $( let t = t.mix($lbl.as_bytes())?; )*
            Ok(t.into_value())
        }
    }
}

/// The hash domain containing the protocol string.
///
/// This serves as a global [domain separator](https://en.wikipedia.org/wiki/Domain_separation)
/// for everything derived by the transport.
pub fn protocol() -> Result<HashDomain> {
    HashDomain::zero().mix("bip15x transport v1 secp256k1 ChaChaPoly1305 Blake2b".as_bytes())
}

hash_domain_ns!(
    /// Symmetric key of one direction, derived from the ECDH secret of an
    /// ENC_INIT/ENC_ACK pair
    protocol, session_key, "session key");
hash_domain_ns!(
    /// Public identifier of one direction, derived like [session_key]
    protocol, session_id, "session id");
hash_domain_ns!(
    /// Combines the two directional session ids into the id both identities sign
    protocol, channel_id, "channel id");
hash_domain_ns!(
    /// Key schedule step applied on every rekey
    protocol, rekey, "rekey");
hash_domain_ns!(
    /// AUTH_CHALLENGE and AUTH_PROPOSE hashes
    protocol, auth_challenge, "auth challenge");
hash_domain_ns!(
    /// Message signed in AUTH_REPLY
    protocol, auth_reply, "auth reply");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_are_distinct() -> Result<()> {
        let domains = [
            session_key()?.into_value(),
            session_id()?.into_value(),
            channel_id()?.into_value(),
            rekey()?.into_value(),
            auth_challenge()?.into_value(),
            auth_reply()?.into_value(),
        ];
        for i in 0..domains.len() {
            for j in (i + 1)..domains.len() {
                assert_ne!(domains[i], domains[j]);
            }
        }
        Ok(())
    }
}
