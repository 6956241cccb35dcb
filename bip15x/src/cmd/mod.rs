//! Implementations of the subcommands in [crate::cli]

use std::path::Path;

use anyhow::ensure;

use crate::config::ChannelConfig;
use crate::peers::PeerKeyStore;

pub mod connect;
pub mod identity;
pub mod listen;

pub trait Command {
    fn run(self, config: &ChannelConfig) -> anyhow::Result<()>;
}

/// Open a key store that must already exist
fn open_store(path: &Path) -> anyhow::Result<PeerKeyStore> {
    ensure!(
        path.exists(),
        "key store {path:?} does not exist; create it with gen-identity"
    );
    PeerKeyStore::durable(path)
}
