use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{info, warn};

use super::{open_store, Command};
use crate::channel::{ChannelEvent, EncryptedChannel};
use crate::cli;
use crate::config::ChannelConfig;
use crate::transport::from_accepted;
use crate::verifier::RejectAll;

impl Command for cli::Listen {
    fn run(self, config: &ChannelConfig) -> Result<()> {
        let store = Arc::new(open_store(&self.store)?);
        let listener = TcpListener::bind(&self.address)
            .with_context(|| format!("listening on {}", self.address))?;
        info!(
            "Listening on {} as {}",
            listener.local_addr()?,
            store.own_identity().public_hex()
        );

        let limit = self.max_channels.unwrap_or(usize::MAX);
        let mut served = Vec::new();
        for stream in listener.incoming().take(limit) {
            reap_finished(&mut served);
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!("Accepting a connection failed: {e}");
                    continue;
                }
            };
            let peer = stream.peer_addr()?.to_string();
            let stream = from_accepted(stream)?;
            let (channel, events) =
                EncryptedChannel::new(config.clone(), store.clone(), Arc::new(RejectAll));
            if let Err(e) = channel.accept(stream, &peer) {
                warn!("Could not serve {peer}: {e}");
                continue;
            }
            served.push(
                thread::Builder::new()
                    .name(format!("bip15x-echo-{peer}"))
                    .spawn(move || echo(channel, events, &peer))?,
            );
        }

        for handle in served {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// Join the echo threads whose channel already ended
fn reap_finished(served: &mut Vec<JoinHandle<()>>) {
    served.retain(|h| !h.is_finished());
}

fn echo(
    channel: EncryptedChannel,
    events: std::sync::mpsc::Receiver<ChannelEvent>,
    peer: &str,
) {
    for event in events {
        match event {
            ChannelEvent::Connected => info!(
                "{peer} connected{}",
                match channel.peer_public_key() {
                    Some(_) => " and authenticated",
                    None => " anonymously",
                }
            ),
            ChannelEvent::Message(msg) => {
                if let Err(e) = channel.send(msg) {
                    warn!("Echo to {peer} failed: {e}");
                    break;
                }
            }
            ChannelEvent::Error(e) => warn!("Channel with {peer} failed: {e}"),
            ChannelEvent::Disconnected => break,
        }
    }
    info!("{peer} disconnected");
}
