//! Two channels talking to each other over a unix stream pair
use std::io::{Read, Write};
use std::mem::take;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Result};
use mio::net::UnixStream;
use serial_test::serial;

use bip15x::channel::{ChannelEvent, ChannelStatus, EncryptedChannel};
use bip15x::codec::{encode_packet, DecodeOutcome, FrameDecoder};
use bip15x::config::{ChannelConfig, CookieConfig};
use bip15x::msgs::MsgType;
use bip15x::peers::PeerKeyStore;
use bip15x::protocol::{AuthMode, HandshakeEngine, HandshakeRole, SessionCipher};
use bip15x::verifier::{AcceptAll, KeyVerifier, PendingVerification, RejectAll};
use bip15x::Error;

const SERVER: &str = "server.test:7000";
const CLIENT: &str = "client.test:51000";
const PATIENCE: Duration = Duration::from_secs(20);

fn setup_logging() {
    let mut log_builder = env_logger::Builder::from_default_env();
    log_builder.filter_level(log::LevelFilter::Info);
    log_builder.is_test(true);
    let _ = log_builder.try_init();
}

struct End {
    channel: EncryptedChannel,
    events: Receiver<ChannelEvent>,
    store: Arc<PeerKeyStore>,
}

impl End {
    fn new(config: ChannelConfig, verifier: Arc<dyn KeyVerifier>) -> Self {
        let store = Arc::new(PeerKeyStore::ephemeral());
        let (channel, events) = EncryptedChannel::new(config, store.clone(), verifier);
        Self {
            channel,
            events,
            store,
        }
    }

    fn key(&self) -> secp256k1::PublicKey {
        self.store.own_identity().public_key()
    }

    fn next_event(&self) -> Result<ChannelEvent> {
        Ok(self.events.recv_timeout(PATIENCE)?)
    }

    fn expect_connected(&self) -> Result<()> {
        match self.next_event()? {
            ChannelEvent::Connected => Ok(()),
            other => bail!("expected Connected, got {other:?}"),
        }
    }

    fn expect_message(&self) -> Result<Vec<u8>> {
        match self.next_event()? {
            ChannelEvent::Message(msg) => Ok(msg),
            other => bail!("expected a message, got {other:?}"),
        }
    }

    /// Skip everything up to the final Disconnected, returning the error seen on the way
    fn until_disconnected(&self) -> Result<Option<Error>> {
        let mut error = None;
        loop {
            match self.next_event()? {
                ChannelEvent::Disconnected => return Ok(error),
                ChannelEvent::Error(e) => error = Some(e),
                _ => {}
            }
        }
    }
}

/// Connect client and server; the client initiates
fn connect(client: &End, server: &End) -> Result<()> {
    let (a, b) = UnixStream::pair()?;
    server.channel.accept(b, CLIENT)?;
    client.channel.open_stream(a, SERVER)?;
    Ok(())
}

/// Client and server that already trust each other
fn known_pair(config: ChannelConfig) -> Result<(End, End)> {
    let client = End::new(config.clone(), Arc::new(RejectAll));
    let server = End::new(config, Arc::new(RejectAll));
    client.store.remember(SERVER, server.key())?;
    server.store.remember(CLIENT, client.key())?;
    Ok((client, server))
}

#[test]
#[serial]
fn messages_flow_both_ways() -> Result<()> {
    setup_logging();
    let (client, server) = known_pair(ChannelConfig::default())?;
    assert_eq!(client.channel.status(), ChannelStatus::Disconnected);

    // queued until the handshake is done
    client.channel.send("ping")?;
    connect(&client, &server)?;

    client.expect_connected()?;
    server.expect_connected()?;
    assert_eq!(client.channel.status(), ChannelStatus::Ready);
    assert_eq!(client.channel.peer_public_key(), Some(server.key()));
    assert_eq!(server.channel.peer_public_key(), Some(client.key()));

    assert_eq!(server.expect_message()?, b"ping");
    server.channel.send(b"pong".to_vec())?;
    assert_eq!(client.expect_message()?, b"pong");

    // spans many packets
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    client.channel.send(big.clone())?;
    assert_eq!(server.expect_message()?, big);

    client.channel.close();
    client.channel.close();
    assert_eq!(client.channel.status(), ChannelStatus::Disconnected);
    assert!(matches!(client.channel.send("late"), Err(Error::Closed)));
    assert!(client.until_disconnected()?.is_none());
    // the peer hanging up after the handshake is a clean end
    assert!(server.until_disconnected()?.is_none());
    assert_eq!(server.channel.status(), ChannelStatus::Disconnected);
    Ok(())
}

#[test]
#[serial]
fn rejected_server_key_fails_the_handshake() -> Result<()> {
    setup_logging();
    let client = End::new(ChannelConfig::default(), Arc::new(RejectAll));
    let server = End::new(ChannelConfig::default(), Arc::new(RejectAll));
    server.store.remember(CLIENT, client.key())?;
    connect(&client, &server)?;

    match client.until_disconnected()? {
        Some(Error::HandshakeFailed(_)) => {}
        other => bail!("expected a failed handshake, got {other:?}"),
    }
    assert_eq!(client.store.lookup(SERVER), None);
    assert_eq!(client.channel.peer_public_key(), None);
    assert!(server.until_disconnected()?.is_some());
    Ok(())
}

#[test]
#[serial]
fn accepted_server_key_is_remembered() -> Result<()> {
    setup_logging();
    let (asked_tx, asked) = mpsc::channel();
    let verifier = move |old: Option<&str>, new: &str, resolve: PendingVerification| {
        let _ = asked_tx.send((old.map(str::to_owned), new.to_owned()));
        resolve.accept();
    };
    let client = End::new(ChannelConfig::default(), Arc::new(verifier));
    let server = End::new(ChannelConfig::default(), Arc::new(AcceptAll));
    server.store.remember(CLIENT, client.key())?;
    connect(&client, &server)?;

    client.expect_connected()?;
    server.expect_connected()?;
    let (old, new) = asked.recv_timeout(PATIENCE)?;
    assert_eq!(old, None);
    assert_eq!(new, hex::encode(server.key().serialize()));
    assert_eq!(client.store.lookup(SERVER), Some(server.key()));
    // asked once per handshake
    assert!(asked.try_recv().is_err());
    Ok(())
}

#[test]
#[serial]
fn unanswered_verification_times_out() -> Result<()> {
    setup_logging();
    let (held_tx, held) = mpsc::channel();
    let verifier = move |_: Option<&str>, _: &str, resolve: PendingVerification| {
        // keep the question open without ever answering it
        let _ = held_tx.send(resolve);
    };
    let config = ChannelConfig {
        verify_timeout_secs: 0.5,
        ..ChannelConfig::default()
    };
    let client = End::new(config, Arc::new(verifier));
    let server = End::new(ChannelConfig::default(), Arc::new(AcceptAll));
    server.store.remember(CLIENT, client.key())?;

    let started = Instant::now();
    connect(&client, &server)?;
    let pending: PendingVerification = held.recv_timeout(PATIENCE)?;

    match client.until_disconnected()? {
        Some(Error::HandshakeFailed(_)) => {}
        other => bail!("expected a failed handshake, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(client.channel.status(), ChannelStatus::Disconnected);

    // a verdict after the deadline changes nothing
    pending.accept();
    assert_eq!(client.store.lookup(SERVER), None);
    assert!(client.events.recv_timeout(Duration::from_millis(200)).is_err());
    Ok(())
}

#[test]
#[serial]
fn one_way_servers_accept_anonymous_clients() -> Result<()> {
    setup_logging();
    let config = ChannelConfig {
        auth_mode: AuthMode::OneWay,
        ..ChannelConfig::default()
    };
    let client = End::new(config.clone(), Arc::new(RejectAll));
    let server = End::new(config, Arc::new(RejectAll));
    client.store.remember(SERVER, server.key())?;
    connect(&client, &server)?;

    client.expect_connected()?;
    server.expect_connected()?;
    assert_eq!(client.channel.peer_public_key(), Some(server.key()));
    assert_eq!(server.channel.peer_public_key(), None);

    client.channel.send("who am i")?;
    assert_eq!(server.expect_message()?, b"who am i");
    Ok(())
}

#[test]
#[serial]
fn frequent_rekeys_keep_the_stream_intact() -> Result<()> {
    setup_logging();
    let config = ChannelConfig {
        max_packet_payload: 256,
        rekey_bytes: 1000,
        ..ChannelConfig::default()
    };
    let (client, server) = known_pair(config)?;
    connect(&client, &server)?;
    client.expect_connected()?;
    server.expect_connected()?;

    let msgs: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 300 + 97 * i as usize]).collect();
    for m in &msgs {
        client.channel.send(m.clone())?;
    }
    for m in &msgs {
        assert_eq!(&server.expect_message()?, m);
    }
    Ok(())
}

#[test]
#[serial]
fn sending_before_ready_can_be_refused() -> Result<()> {
    setup_logging();
    let config = ChannelConfig {
        queue_before_ready: false,
        ..ChannelConfig::default()
    };
    let (client, server) = known_pair(config)?;
    assert!(matches!(client.channel.send("early"), Err(Error::NotReady)));

    connect(&client, &server)?;
    let (extra, _) = UnixStream::pair()?;
    assert!(matches!(
        client.channel.open_stream(extra, SERVER),
        Err(Error::AlreadyOpen)
    ));

    client.expect_connected()?;
    client.channel.send("on time")?;
    server.expect_connected()?;
    assert_eq!(server.expect_message()?, b"on time");
    Ok(())
}

#[test]
#[serial]
fn full_queue_is_reported() -> Result<()> {
    setup_logging();
    let config = ChannelConfig {
        pending_queue_limit: 2,
        ..ChannelConfig::default()
    };
    let (client, _server) = known_pair(config)?;
    client.channel.send("one")?;
    client.channel.send("two")?;
    assert!(matches!(client.channel.send("three"), Err(Error::QueueFull)));
    Ok(())
}

#[test]
#[serial]
fn silent_peers_time_out() -> Result<()> {
    setup_logging();
    let quiet = ChannelConfig {
        heartbeat_interval_secs: 3600.0,
        ..ChannelConfig::default()
    };
    let watchful = ChannelConfig {
        heartbeat_interval_secs: 0.2,
        heartbeat_tick_secs: 0.05,
        peer_timeout_secs: Some(0.5),
        ..ChannelConfig::default()
    };
    let client = End::new(quiet, Arc::new(RejectAll));
    let server = End::new(watchful, Arc::new(RejectAll));
    client.store.remember(SERVER, server.key())?;
    server.store.remember(CLIENT, client.key())?;
    connect(&client, &server)?;
    client.expect_connected()?;
    server.expect_connected()?;

    match server.until_disconnected()? {
        Some(Error::HeartbeatTimeout(silence)) => assert!(silence >= 0.4),
        other => bail!("expected a heartbeat timeout, got {other:?}"),
    }
    assert!(client.until_disconnected()?.is_none());
    Ok(())
}

#[test]
#[serial]
fn heartbeats_keep_idle_channels_alive() -> Result<()> {
    setup_logging();
    let config = ChannelConfig {
        heartbeat_interval_secs: 0.1,
        heartbeat_tick_secs: 0.02,
        peer_timeout_secs: Some(1.0),
        ..ChannelConfig::default()
    };
    let (client, server) = known_pair(config)?;
    connect(&client, &server)?;
    client.expect_connected()?;
    server.expect_connected()?;

    std::thread::sleep(Duration::from_secs(2));
    assert!(client.events.try_recv().is_err());
    assert!(server.events.try_recv().is_err());

    client.channel.send("still here")?;
    assert_eq!(server.expect_message()?, b"still here");
    Ok(())
}

#[test]
#[serial]
fn cookies_establish_trust_without_asking() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let cookie = dir.path().join("server.cookie");
    let cookies = |own, peer| {
        Some(CookieConfig {
            own_cookie: own,
            peer_cookie: peer,
        })
    };
    let client = End::new(
        ChannelConfig {
            cookies: cookies(None, Some(cookie.clone())),
            ..ChannelConfig::default()
        },
        Arc::new(RejectAll),
    );
    let server = End::new(
        ChannelConfig {
            cookies: cookies(Some(cookie.clone()), None),
            ..ChannelConfig::default()
        },
        Arc::new(RejectAll),
    );
    server.store.remember(CLIENT, client.key())?;

    // the server writes its cookie when it starts serving
    connect(&client, &server)?;
    assert!(cookie.exists());
    client.expect_connected()?;
    server.expect_connected()?;
    assert_eq!(client.store.lookup(SERVER), Some(server.key()));

    server.channel.close();
    assert!(!cookie.exists());
    Ok(())
}

#[test]
#[serial]
fn interleaved_messages_close_the_channel() -> Result<()> {
    setup_logging();
    let server = End::new(ChannelConfig::default(), Arc::new(RejectAll));
    let client_store = Arc::new(PeerKeyStore::ephemeral());
    client_store.remember(SERVER, server.key())?;
    server
        .store
        .remember(CLIENT, client_store.own_identity().public_key())?;

    let (mut raw, served) = StdUnixStream::pair()?;
    served.set_nonblocking(true)?;
    server
        .channel
        .accept(UnixStream::from_std(served), CLIENT)?;
    raw.set_read_timeout(Some(PATIENCE))?;

    // drive the client side of the handshake by hand
    let mut engine =
        HandshakeEngine::new(HandshakeRole::Initiator, SERVER, client_store, AuthMode::TwoWay);
    let mut cipher = SessionCipher::default();
    let mut decoder = FrameDecoder::new(1024, 1 << 20);
    let mut tx = Vec::new();
    let mut buf = [0u8; 4096];
    engine.start(&mut cipher, &mut tx, 0.0)?;
    while !engine.is_established() {
        raw.write_all(&take(&mut tx))?;
        let n = raw.read(&mut buf)?;
        ensure!(n > 0, "server hung up during the handshake");
        let mut input = &buf[..n];
        loop {
            match decoder.decode(input, Some(&mut cipher)) {
                DecodeOutcome::NeedMoreBytes => break,
                DecodeOutcome::HandshakeFrame(frame) => {
                    engine.handle_frame(&frame, &mut cipher, &mut tx, 0.0)?;
                }
                other => bail!("unexpected {other:?} during the handshake"),
            }
            input = &[];
        }
    }
    raw.write_all(&take(&mut tx))?;
    server.expect_connected()?;

    // message 2 starts while message 1 is still incomplete
    let mut header = 100u32.to_le_bytes().to_vec();
    header.extend_from_slice(&[7u8; 10]);
    raw.write_all(&encode_packet(MsgType::FragmentHeader, 1, &header, Some(&mut cipher))?)?;
    raw.write_all(&encode_packet(MsgType::FragmentHeader, 2, &header, Some(&mut cipher))?)?;

    match server.until_disconnected()? {
        Some(Error::UnexpectedFragment { expected: 1, got: 2 }) => {}
        other => bail!("expected an unexpected fragment, got {other:?}"),
    }
    assert_eq!(server.channel.status(), ChannelStatus::Disconnected);
    assert!(matches!(server.channel.send("too late"), Err(Error::Closed)));
    Ok(())
}
