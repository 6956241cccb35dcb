use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use log::{debug, info};

use super::{open_store, Command};
use crate::channel::{ChannelEvent, EncryptedChannel};
use crate::cli;
use crate::config::ChannelConfig;
use crate::verifier::{AcceptAll, KeyVerifier, PendingVerification};

/// Ask on the terminal whether an unknown server key may be trusted
///
/// stdin is only read for messages once the channel is ready, so the
/// question cannot race with message input.
fn confirm_on_terminal(old_key_hex: Option<&str>, new_key_hex: &str, resolve: PendingVerification) {
    let mut stderr = io::stderr().lock();
    let _ = match old_key_hex {
        Some(old) => writeln!(
            stderr,
            "WARNING: the server key changed from {old} to {new_key_hex}"
        ),
        None => writeln!(stderr, "The server presented the unknown key {new_key_hex}"),
    };
    let _ = write!(stderr, "Trust it? [y/N] ");
    let _ = stderr.flush();

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) if answer.trim().eq_ignore_ascii_case("y") => resolve.accept(),
        _ => resolve.reject(),
    }
}

impl Command for cli::Connect {
    fn run(self, config: &ChannelConfig) -> Result<()> {
        let store = Arc::new(open_store(&self.store)?);
        let verifier: Arc<dyn KeyVerifier> = if self.accept_unknown {
            Arc::new(AcceptAll)
        } else {
            Arc::new(confirm_on_terminal)
        };

        let (channel, events) = EncryptedChannel::new(config.clone(), store, verifier);
        let channel = Arc::new(channel);
        channel.open(&self.address)?;

        let mut stdout = io::stdout();
        for event in events {
            match event {
                ChannelEvent::Connected => {
                    info!("Channel to {} is ready", self.address);
                    let channel = channel.clone();
                    thread::Builder::new()
                        .name("bip15x-stdin".into())
                        .spawn(move || send_lines(&channel))?;
                }
                ChannelEvent::Message(msg) => {
                    stdout.write_all(&msg)?;
                    if !msg.ends_with(b"\n") {
                        stdout.write_all(b"\n")?;
                    }
                    stdout.flush()?;
                }
                ChannelEvent::Error(e) => return Err(e.into()),
                ChannelEvent::Disconnected => break,
            }
        }

        channel.close();
        Ok(())
    }
}

/// Send every line of stdin; closes the channel at end of input
fn send_lines(channel: &EncryptedChannel) {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if let Err(e) = channel.send(line) {
            debug!("Stopped sending: {e}");
            return;
        }
    }
    channel.close();
}
