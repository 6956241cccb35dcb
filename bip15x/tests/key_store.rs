use std::os::unix::fs::PermissionsExt;

use bip15x::cookies::{read_cookie, write_cookie};
use bip15x::identity::IdentityKeyPair;
use bip15x::peers::PeerKeyStore;

#[test]
fn durable_store_survives_reopening() -> anyhow::Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("peers.toml");
    let peer = IdentityKeyPair::generate().public_key();
    let other = IdentityKeyPair::generate().public_key();

    let store = PeerKeyStore::durable(&path)?;
    assert!(store.is_durable());
    let identity = store.own_identity().public_key();
    store.remember("10.0.0.1:7000", peer)?;
    store.remember("backup", peer)?;
    store.add_trusted(&format!("signer:{}", hex::encode(other.serialize())))?;
    drop(store);

    // holds the identity secret
    let mode = std::fs::metadata(&path)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let store = PeerKeyStore::durable(&path)?;
    assert_eq!(store.own_identity().public_key(), identity);
    assert_eq!(store.lookup("10.0.0.1:7000"), Some(peer));
    assert_eq!(store.lookup("signer"), Some(other));
    assert_eq!(store.labels_of(&peer).len(), 2);

    assert!(store.forget("10.0.0.1:7000")?);
    assert!(!store.forget("10.0.0.1:7000")?);
    drop(store);

    let store = PeerKeyStore::durable(&path)?;
    assert_eq!(store.lookup("10.0.0.1:7000"), None);
    assert!(store.contains_key(&peer));
    assert_eq!(store.public_keys().len(), 2);
    Ok(())
}

#[test]
fn corrupt_store_is_an_error() -> anyhow::Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("peers.toml");
    std::fs::write(&path, "identity = 5")?;
    assert!(PeerKeyStore::durable(&path).is_err());
    Ok(())
}

#[test]
fn cookies_hold_the_identity() -> anyhow::Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("client.cookie");
    let store = PeerKeyStore::ephemeral();
    write_cookie(&path, &store.own_identity().public_key())?;
    assert_eq!(std::fs::metadata(&path)?.len(), 33);
    assert_eq!(read_cookie(&path)?, store.own_identity().public_key());
    Ok(())
}
