//! Key store management: identities, trusted peers and cookies

use std::fs;

use anyhow::{bail, Context, Result};

use super::{open_store, Command};
use crate::cli;
use crate::config::ChannelConfig;
use crate::cookies::write_cookie;
use crate::peers::PeerKeyStore;

impl Command for cli::GenIdentity {
    fn run(self, _: &ChannelConfig) -> Result<()> {
        if self.store.exists() {
            if !self.force {
                bail!("key store {:?} exists, refusing to overwrite it", self.store);
            }
            fs::remove_file(&self.store)
                .with_context(|| format!("removing old key store {:?}", self.store))?;
        }

        eprintln!("Generating identity in {:?}", self.store);
        let store = PeerKeyStore::durable(&self.store)?;
        println!("{}", store.own_identity().public_hex());
        Ok(())
    }
}

impl Command for cli::ShowIdentity {
    fn run(self, _: &ChannelConfig) -> Result<()> {
        let store = open_store(&self.store)?;
        println!("{}", store.own_identity().public_hex());
        Ok(())
    }
}

impl Command for cli::Trust {
    fn run(self, _: &ChannelConfig) -> Result<()> {
        open_store(&self.store)?.add_trusted(&self.peer)
    }
}

impl Command for cli::Forget {
    fn run(self, _: &ChannelConfig) -> Result<()> {
        if !open_store(&self.store)?.forget(&self.label)? {
            eprintln!("{:?} did not know {}", self.store, self.label);
        }
        Ok(())
    }
}

impl Command for cli::WriteCookie {
    fn run(self, _: &ChannelConfig) -> Result<()> {
        let store = open_store(&self.store)?;
        write_cookie(&self.cookie, &store.own_identity().public_key())
    }
}
