use zeroize::Zeroizing;

use blake2::digest::crypto_common::generic_array::GenericArray;
use blake2::digest::crypto_common::typenum::U32;
use blake2::digest::{FixedOutput, Mac};
use blake2::Blake2bMac;

/// Specify that the used implementation of BLAKE2b is the MAC version of BLAKE2b
/// with output and key length of 32 bytes (see [Blake2bMac]).
type Impl = Blake2bMac<U32>;

/// The key length for BLAKE2b supported by this API. Currently 32 Bytes.
pub const KEY_LEN: usize = 32;
/// The output length for BLAKE2b supported by this API. Currently 32 Bytes.
pub const OUT_LEN: usize = 32;

/// Hashes the given `data` with the [Blake2bMac] hash function under the given `key`
/// and writes the digest to `out`.
///
/// # Examples
///
/// ```rust
/// use bip15x_ciphers::keyed_hash::{hash, KEY_LEN, OUT_LEN};
///
/// let mut a = [0u8; OUT_LEN];
/// let mut b = [0u8; OUT_LEN];
/// hash(&[0u8; KEY_LEN], b"data", &mut a)?;
/// hash(&[1u8; KEY_LEN], b"data", &mut b)?;
/// assert_ne!(a, b);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn hash(key: &[u8; KEY_LEN], data: &[u8], out: &mut [u8; OUT_LEN]) -> anyhow::Result<()> {
    let mut h = Impl::new_from_slice(key)?;
    h.update(data);

    // Finalize into a zeroizing scratch buffer; the digest is usually key material.
    let mut tmp = Zeroizing::new([0u8; OUT_LEN]);
    h.finalize_into(GenericArray::from_mut_slice(tmp.as_mut()));
    out.copy_from_slice(tmp.as_ref());
    Ok(())
}
