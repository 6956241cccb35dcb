//! Command line parameters of the bip15x binary
//!
//! Parsing happens here; every subcommand is an [Args] struct whose
//! [Command](crate::cmd::Command) implementation lives in [crate::cmd].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ChannelConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about, arg_required_else_help = true)]
pub struct Cli {
    /// Lowest log level to show
    #[arg(long = "log-level", value_name = "LOG_LEVEL", group = "log-level")]
    log_level: Option<log::LevelFilter>,

    /// Show verbose log output – sets log level to "debug"
    #[arg(short, long, group = "log-level")]
    verbose: bool,

    /// Show no log output – sets log level to "error"
    #[arg(short, long, group = "log-level")]
    quiet: bool,

    /// Channel configuration file; built-in defaults are used otherwise
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The log level filter set on the command line, if any
    ///
    /// clap's argument groups make sure at most one of the options is given.
    pub fn get_log_level(&self) -> Option<log::LevelFilter> {
        if self.verbose {
            return Some(log::LevelFilter::Debug);
        }
        if self.quiet {
            return Some(log::LevelFilter::Error);
        }
        self.log_level
    }

    /// Load and validate the configuration named by `--config`
    pub fn channel_config(&self) -> anyhow::Result<ChannelConfig> {
        let config = match &self.config {
            Some(path) => ChannelConfig::load(path)?,
            None => ChannelConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    GenIdentity(GenIdentity),
    ShowIdentity(ShowIdentity),
    Trust(Trust),
    Forget(Forget),
    WriteCookie(WriteCookie),
    Connect(Connect),
    Listen(Listen),
}

/// Create a key store with a fresh identity and print its public key
#[derive(Args, Debug)]
pub struct GenIdentity {
    pub store: PathBuf,

    /// Replace an existing key store
    #[arg(short, long)]
    pub force: bool,
}

/// Print the identity public key of a key store
#[derive(Args, Debug)]
pub struct ShowIdentity {
    pub store: PathBuf,
}

/// Trust a peer key given as `name:hexkey`
///
/// `connect` only trusts a key bound to the address it connects to, so use
/// `host:port` as name there.
#[derive(Args, Debug)]
pub struct Trust {
    pub store: PathBuf,

    #[arg(value_name = "NAME:HEXKEY")]
    pub peer: String,
}

/// Remove a peer from a key store
#[derive(Args, Debug)]
pub struct Forget {
    pub store: PathBuf,

    /// Address or name the peer is known under
    pub label: String,
}

/// Write the identity public key of a key store into a cookie file
#[derive(Args, Debug)]
pub struct WriteCookie {
    pub store: PathBuf,
    pub cookie: PathBuf,
}

/// Connect to a peer, send lines from stdin and print what comes back
///
/// Keys the store does not know yet are confirmed on the terminal.
#[derive(Args, Debug)]
pub struct Connect {
    pub store: PathBuf,

    #[arg(value_name = "HOST:PORT")]
    pub address: String,

    /// Trust unknown peer keys without asking
    #[arg(short = 'y', long)]
    pub accept_unknown: bool,
}

/// Accept channels and echo every message back
#[derive(Args, Debug)]
pub struct Listen {
    pub store: PathBuf,

    #[arg(value_name = "HOST:PORT")]
    pub address: String,

    /// Stop after serving this many channels
    #[arg(long)]
    pub max_channels: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn log_level_flags() {
        let cli = Cli::parse_from(["bip15x", "-v", "show-identity", "store.toml"]);
        assert_eq!(cli.get_log_level(), Some(log::LevelFilter::Debug));

        let cli = Cli::parse_from(["bip15x", "--log-level", "warn", "show-identity", "s"]);
        assert_eq!(cli.get_log_level(), Some(log::LevelFilter::Warn));

        assert!(Cli::try_parse_from(["bip15x", "-v", "-q", "show-identity", "s"]).is_err());
    }

    #[test]
    fn subcommand_arguments() {
        let cli = Cli::parse_from([
            "bip15x",
            "connect",
            "client.toml",
            "127.0.0.1:7000",
            "--config",
            "channel.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("channel.toml")));
        match cli.command {
            Some(Commands::Connect(c)) => {
                assert_eq!(c.address, "127.0.0.1:7000");
                assert!(!c.accept_unknown);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
