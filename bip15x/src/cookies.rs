//! Identity cookies for processes on the same machine
//!
//! A cookie file holds exactly one 33 byte compressed public key. A process
//! that wants to be trusted by a co-located peer writes its identity to a
//! cookie; the peer reads it once when it connects and binds the key to the
//! connection address without asking the user. Channels only use cookies
//! when explicitly configured to.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, warn};
use secp256k1::PublicKey;

use bip15x_util::file::{fopen_r, fopen_w, ReadExactToEnd, Visibility};

use crate::identity::{parse_public_key, PUBLIC_KEY_LEN};

/// Read the public key stored in the cookie file at `path`
pub fn read_cookie<P: AsRef<Path>>(path: P) -> anyhow::Result<PublicKey> {
    let path = path.as_ref();
    let mut buf = [0u8; PUBLIC_KEY_LEN];
    fopen_r(path)
        .with_context(|| format!("opening cookie {path:?}"))?
        .read_exact_to_end(&mut buf)
        .with_context(|| format!("cookie {path:?} does not hold a single public key"))?;
    Ok(parse_public_key(&buf)?)
}

/// Write `key` into the cookie file at `path`, replacing previous contents
pub fn write_cookie<P: AsRef<Path>>(path: P, key: &PublicKey) -> anyhow::Result<()> {
    let path = path.as_ref();
    fopen_w(path, Visibility::Secret)
        .with_context(|| format!("creating cookie {path:?}"))?
        .write_all(&key.serialize())?;
    Ok(())
}

/// Cookie written on creation and deleted when dropped
#[derive(Debug)]
pub struct CookieGuard {
    path: PathBuf,
}

impl CookieGuard {
    pub fn create<P: AsRef<Path>>(path: P, key: &PublicKey) -> anyhow::Result<Self> {
        let path = path.as_ref().to_owned();
        write_cookie(&path, key)?;
        debug!("Wrote identity cookie {path:?}");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CookieGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove identity cookie {:?}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;

    #[test]
    fn cookie_round_trip_and_cleanup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("client.cookie");
        let id = IdentityKeyPair::generate();

        {
            let guard = CookieGuard::create(&path, &id.public_key())?;
            assert_eq!(std::fs::metadata(guard.path())?.len(), PUBLIC_KEY_LEN as u64);
            assert_eq!(read_cookie(&path)?, id.public_key());
        }
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn rejects_malformed_cookies() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.cookie");

        std::fs::write(&path, [2u8; 10])?;
        assert!(read_cookie(&path).is_err());

        let mut long = IdentityKeyPair::generate().public_key().serialize().to_vec();
        long.push(0);
        std::fs::write(&path, &long)?;
        assert!(read_cookie(&path).is_err());

        assert!(read_cookie(dir.path().join("missing")).is_err());
        Ok(())
    }
}
