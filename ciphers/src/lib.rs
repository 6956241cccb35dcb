use static_assertions::const_assert;

pub mod hash_domain;
pub mod subtle;

/// All keyed primitives in this crate use 32 byte keys
pub const KEY_LEN: usize = 32;
const_assert!(KEY_LEN == aead::KEY_LEN);
const_assert!(KEY_LEN == keyed_hash::KEY_LEN);
const_assert!(KEY_LEN == keyed_hash::OUT_LEN);

/// Keyed hashing
///
/// This should only be used for implementation details; anything with relevance
/// to the transport protocol should use the facilities in [hash_domain], (though
/// hash domain uses this module internally)
pub mod keyed_hash {
    pub use crate::subtle::blake2b::{hash, KEY_LEN, OUT_LEN};
}

/// Authenticated encryption with associated data
/// Chacha20poly1305 is used.
pub mod aead {
    pub use crate::subtle::chacha20poly1305_ietf::{
        counter_nonce, decrypt, encrypt, KEY_LEN, NONCE_LEN, TAG_LEN,
    };
}
