//! Registry of known peer identity keys
//!
//! Peers are identified by labels; the label used by channels is the
//! transport-level address (`host:port`) of the peer. A label belongs to at
//! most one key at any time, binding a label to a new key removes it from the
//! old one first.
//!
//! The store is either ephemeral (memory only) or durable, in which case
//! every change is written to a TOML file readable only by the owner. One
//! store may be shared by many channels through an [Arc](std::sync::Arc).

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use log::{debug, info};
use parking_lot::Mutex;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use bip15x_util::file::{fopen_w, LoadValue, StoreValue, Visibility};

use crate::identity::{parse_public_key_hex, public_key_hex, IdentityKeyPair};

/// A known peer key together with every label bound to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub public_key: PublicKey,
    pub labels: BTreeSet<String>,
}

#[derive(Debug)]
enum Backing {
    Ephemeral,
    Durable(PathBuf),
}

#[derive(Debug)]
struct Inner {
    identity: IdentityKeyPair,
    peers: Vec<PeerIdentity>,
}

#[derive(Debug)]
pub struct PeerKeyStore {
    inner: Mutex<Inner>,
    backing: Backing,
}

impl PeerKeyStore {
    /// In-memory store with a freshly generated identity
    pub fn ephemeral() -> Self {
        Self::with_identity(IdentityKeyPair::generate())
    }

    /// In-memory store with the given identity
    pub fn with_identity(identity: IdentityKeyPair) -> Self {
        Self {
            inner: Mutex::new(Inner {
                identity,
                peers: Vec::new(),
            }),
            backing: Backing::Ephemeral,
        }
    }

    /// Open the store file at `path`, creating it with a new identity if it does not exist
    pub fn durable<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_owned();
        let inner = if path.exists() {
            let file = StoreFile::load(&path)?;
            debug!(
                "Loaded key store {path:?} with {} peers",
                file.peers.len()
            );
            file.into_inner()?
        } else {
            let inner = Inner {
                identity: IdentityKeyPair::generate(),
                peers: Vec::new(),
            };
            StoreFile::from_inner(&inner).store(&path)?;
            info!(
                "Created key store {path:?} with identity {}",
                inner.identity.public_hex()
            );
            inner
        };
        Ok(Self {
            inner: Mutex::new(inner),
            backing: Backing::Durable(path),
        })
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backing, Backing::Durable(_))
    }

    /// The key bound to `label`, if any
    pub fn lookup(&self, label: &str) -> Option<PublicKey> {
        self.inner
            .lock()
            .peers
            .iter()
            .find(|p| p.labels.contains(label))
            .map(|p| p.public_key)
    }

    /// Bind `label` to `key`, removing any previous binding of `label`
    pub fn remember(&self, label: &str, key: PublicKey) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        erase_label(&mut inner.peers, label);
        match inner.peers.iter_mut().find(|p| p.public_key == key) {
            Some(peer) => {
                peer.labels.insert(label.to_owned());
            }
            None => inner.peers.push(PeerIdentity {
                public_key: key,
                labels: BTreeSet::from([label.to_owned()]),
            }),
        }
        debug!("Bound {label} to peer key {}", public_key_hex(&key));
        self.flush(&inner)
    }

    /// Remove `label`; returns whether it was bound
    pub fn forget(&self, label: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        let found = erase_label(&mut inner.peers, label);
        if found {
            self.flush(&inner)?;
        }
        Ok(found)
    }

    /// Add a peer given in the `name:hexkey` format of trusted peer lists
    pub fn add_trusted(&self, entry: &str) -> anyhow::Result<()> {
        let Some((name, key)) = entry.rsplit_once(':') else {
            bail!("trusted peer {entry:?} is not in the name:hexkey format");
        };
        if name.is_empty() {
            bail!("trusted peer {entry:?} has an empty name");
        }
        let key = parse_public_key_hex(key).with_context(|| format!("trusted peer {name}"))?;
        self.remember(name, key)
    }

    /// The local identity key pair; stable for the lifetime of the store
    pub fn own_identity(&self) -> IdentityKeyPair {
        self.inner.lock().identity
    }

    /// Every known peer key
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.inner
            .lock()
            .peers
            .iter()
            .map(|p| p.public_key)
            .collect()
    }

    pub fn contains_key(&self, key: &PublicKey) -> bool {
        self.inner.lock().peers.iter().any(|p| p.public_key == *key)
    }

    pub fn labels_of(&self, key: &PublicKey) -> BTreeSet<String> {
        self.inner
            .lock()
            .peers
            .iter()
            .find(|p| p.public_key == *key)
            .map(|p| p.labels.clone())
            .unwrap_or_default()
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.inner.lock().peers.clone()
    }

    fn flush(&self, inner: &Inner) -> anyhow::Result<()> {
        match &self.backing {
            Backing::Ephemeral => Ok(()),
            Backing::Durable(path) => StoreFile::from_inner(inner).store(path),
        }
    }
}

/// Removes `label` from every peer and drops peers left without labels
fn erase_label(peers: &mut Vec<PeerIdentity>, label: &str) -> bool {
    let mut found = false;
    for peer in peers.iter_mut() {
        found |= peer.labels.remove(label);
    }
    peers.retain(|p| !p.labels.is_empty());
    found
}

/// On-disk representation of a durable store
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    /// hex encoded identity secret key
    identity: String,
    #[serde(default)]
    peers: Vec<StoredPeer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPeer {
    public_key: String,
    labels: Vec<String>,
}

impl StoreFile {
    fn from_inner(inner: &Inner) -> Self {
        Self {
            identity: inner.identity.secret_hex().to_string(),
            peers: inner
                .peers
                .iter()
                .map(|p| StoredPeer {
                    public_key: public_key_hex(&p.public_key),
                    labels: p.labels.iter().cloned().collect(),
                })
                .collect(),
        }
    }

    fn into_inner(self) -> anyhow::Result<Inner> {
        let identity = IdentityKeyPair::from_secret_hex(&self.identity)
            .context("key store holds an invalid identity key")?;
        let mut peers: Vec<PeerIdentity> = Vec::with_capacity(self.peers.len());
        for p in self.peers {
            let public_key = parse_public_key_hex(&p.public_key)?;
            for label in p.labels {
                erase_label(&mut peers, &label);
                match peers.iter_mut().find(|q| q.public_key == public_key) {
                    Some(q) => {
                        q.labels.insert(label);
                    }
                    None => peers.push(PeerIdentity {
                        public_key,
                        labels: BTreeSet::from([label]),
                    }),
                }
            }
        }
        Ok(Inner { identity, peers })
    }
}

impl LoadValue for StoreFile {
    type Error = anyhow::Error;

    fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading key store {path:?}"))?;
        toml::from_str(&text).with_context(|| format!("parsing key store {path:?}"))
    }
}

impl StoreValue for StoreFile {
    type Error = anyhow::Error;

    fn store<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let mut f = fopen_w(path, Visibility::Secret)?;
        f.write_all(toml::to_string_pretty(self)?.as_bytes())?;
        Ok(())
    }
}
