use clap::Parser;
use log::error;

use bip15x::cli::{Cli, Commands};
use bip15x::cmd::Command;

pub fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_builder = env_logger::Builder::from_default_env();
    if let Some(level) = cli.get_log_level() {
        log_builder.filter_level(level);
    }
    log_builder.init();

    let config = match cli.channel_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            return Err(e);
        }
    };

    match cli.command {
        Some(Commands::GenIdentity(cmd)) => cmd.run(&config),
        Some(Commands::ShowIdentity(cmd)) => cmd.run(&config),
        Some(Commands::Trust(cmd)) => cmd.run(&config),
        Some(Commands::Forget(cmd)) => cmd.run(&config),
        Some(Commands::WriteCookie(cmd)) => cmd.run(&config),
        Some(Commands::Connect(cmd)) => cmd.run(&config),
        Some(Commands::Listen(cmd)) => cmd.run(&config),
        None => Ok(()), // clap prints the help if no command is given
    }
}
