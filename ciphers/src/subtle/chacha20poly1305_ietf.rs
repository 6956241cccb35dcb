use anyhow::{ensure, Context};

use chacha20poly1305::aead::generic_array::typenum::Unsigned;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::ChaCha20Poly1305 as AeadImpl;
use chacha20poly1305::{AeadCore, AeadInPlace, KeyInit, KeySizeUser};

/// The key length is 32 bytes or 256 bits.
pub const KEY_LEN: usize = <<AeadImpl as KeySizeUser>::KeySize as Unsigned>::USIZE;
/// The  MAC tag length is 16 bytes or 128 bits.
pub const TAG_LEN: usize = <<AeadImpl as AeadCore>::TagSize as Unsigned>::USIZE;
/// The nonce length is 12 bytes or 96 bits.
pub const NONCE_LEN: usize = <<AeadImpl as AeadCore>::NonceSize as Unsigned>::USIZE;

/// Build the nonce for the `counter`-th packet of a direction
///
/// The first four bytes are zero, the remaining eight hold the counter in
/// little endian byte order.
pub fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[NONCE_LEN - 8..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypts using ChaCha20Poly1305 as implemented in [RustCrypto](https://github.com/RustCrypto/AEADs/tree/master/chacha20poly1305).
/// `key` MUST be chosen (pseudo-)randomly and `nonce` MUST NOT be reused. The last [TAG_LEN] bytes
/// written in `ciphertext` are the tag guaranteeing integrity. `ciphertext` MUST have a length of
/// `plaintext.len()` + [TAG_LEN].
///
/// # Examples
///```rust
/// use bip15x_ciphers::aead::{counter_nonce, decrypt, encrypt, KEY_LEN, TAG_LEN};
///
/// let key = [7u8; KEY_LEN]; // THIS IS NOT A SECURE KEY
/// let nonce = counter_nonce(0);
/// let plaintext = b"authenticated and encrypted";
/// let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
/// encrypt(&mut ciphertext, &key, &nonce, b"header", plaintext)?;
///
/// let mut recovered = vec![0u8; plaintext.len()];
/// decrypt(&mut recovered, &key, &nonce, b"header", &ciphertext)?;
/// assert_eq!(&recovered[..], &plaintext[..]);
///
/// // Tampering with the associated data is detected
/// assert!(decrypt(&mut recovered, &key, &nonce, b"HEADER", &ciphertext).is_err());
/// # Ok::<(), anyhow::Error>(())
///```
#[inline]
pub fn encrypt(
    ciphertext: &mut [u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
    plaintext: &[u8],
) -> anyhow::Result<()> {
    ensure!(
        ciphertext.len() == plaintext.len() + TAG_LEN,
        "ciphertext buffer of {} bytes can not hold {} plaintext bytes",
        ciphertext.len(),
        plaintext.len()
    );

    let nonce = GenericArray::from_slice(nonce);
    let (ct, mac) = ciphertext.split_at_mut(plaintext.len());
    ct.copy_from_slice(plaintext);

    let encrypter = AeadImpl::new_from_slice(key).context("invalid aead key length")?;
    let mac_value = encrypter
        .encrypt_in_place_detached(nonce, ad, ct)
        .map_err(|_| anyhow::anyhow!("aead encryption failed"))?;
    mac.copy_from_slice(&mac_value[..]);

    Ok(())
}

/// Decrypts a `ciphertext` and verifies the integrity of the `ciphertext` and the additional data
/// `ad`. using ChaCha20Poly1305 as implemented in [RustCrypto](https://github.com/RustCrypto/AEADs/tree/master/chacha20poly1305).
///
/// The plaintext buffer must have a length of `ciphertext.len()` - [TAG_LEN].
#[inline]
pub fn decrypt(
    plaintext: &mut [u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
    ciphertext: &[u8],
) -> anyhow::Result<()> {
    // The comparison looks complicated, but we need to do it this way to prevent
    // over/underflows.
    ensure!(
        ciphertext.len() >= TAG_LEN && ciphertext.len() - TAG_LEN == plaintext.len(),
        "plaintext buffer of {} bytes does not match {} ciphertext bytes",
        plaintext.len(),
        ciphertext.len()
    );

    let nonce = GenericArray::from_slice(nonce);
    let (ct, mac) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
    let tag = GenericArray::from_slice(mac);
    plaintext.copy_from_slice(ct);

    let decrypter = AeadImpl::new_from_slice(key).context("invalid aead key length")?;
    decrypter
        .decrypt_in_place_detached(nonce, ad, plaintext, tag)
        .map_err(|_| anyhow::anyhow!("aead authentication failed"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_nonce_layout() {
        let n = counter_nonce(0x0102);
        assert_eq!(n[..4], [0, 0, 0, 0]);
        assert_eq!(n[4..6], [0x02, 0x01]);
        assert!(n[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn nonces_must_match() -> anyhow::Result<()> {
        let key = [3u8; KEY_LEN];
        let mut ct = [0u8; 5 + TAG_LEN];
        encrypt(&mut ct, &key, &counter_nonce(1), &[], b"hello")?;
        let mut pt = [0u8; 5];
        assert!(decrypt(&mut pt, &key, &counter_nonce(2), &[], &ct).is_err());
        decrypt(&mut pt, &key, &counter_nonce(1), &[], &ct)?;
        assert_eq!(&pt, b"hello");
        Ok(())
    }

    #[test]
    fn rejects_short_ciphertext() {
        let mut pt = [0u8; 0];
        assert!(decrypt(&mut pt, &[0u8; KEY_LEN], &counter_nonce(0), &[], &[0u8; 4]).is_err());
    }
}
