pub mod blake2b;
pub mod chacha20poly1305_ietf;
