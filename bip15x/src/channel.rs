//! The encrypted channel façade
//!
//! An [EncryptedChannel] owns one connection. A dedicated IO thread moves
//! bytes between the socket and the protocol: it runs the handshake, seals
//! queued application messages, opens inbound packets and reports what
//! happened as [ChannelEvent]s. A heartbeat thread asks it to send keep-alive
//! frames. Key verification runs on threads of its own, so a slow
//! [KeyVerifier] never stalls the IO thread.
//!
//! Every method takes `&self`; a channel can be shared between threads
//! through an [Arc].

use std::collections::VecDeque;
use std::io;
use std::mem::take;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use secp256k1::PublicKey;

use bip15x_util::io::{ReadNonblockingExt, WriteNonblockingExt};
use bip15x_util::time::Timebase;

use crate::codec::{encode_packet, DecodeOutcome, FrameDecoder, FrameEncoder};
use crate::config::ChannelConfig;
use crate::cookies::{read_cookie, CookieGuard};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor, HeartbeatThread};
use crate::identity::public_key_hex;
use crate::msgs::HEADER_LEN;
use crate::peers::PeerKeyStore;
use crate::protocol::constants::IO_POLL_INTERVAL;
use crate::protocol::timing::has_happened;
use crate::protocol::{
    HandshakeEngine, HandshakeRole, SessionCipher, Timing, VerifyRequest,
};
use crate::transport::{connect_tcp, Transport};
use crate::verifier::{spawn_verification, KeyVerifier, PendingVerification};
use crate::{Error, Result};

const STREAM: Token = Token(0);
const WAKER: Token = Token(1);

/// Size of a single read from the transport
const READ_CHUNK: usize = 64 * 1024;

/// Stop sealing queued messages while this many bytes wait to be written
const WRITE_HIGH_WATER: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    HandshakeInProgress,
    Ready,
}

/// Notifications delivered on the receiver returned by [EncryptedChannel::new]
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The handshake completed; messages flow from now on
    Connected,
    /// A reassembled, decrypted application message
    Message(Vec<u8>),
    /// The connection ended; always the last event of a connection
    Disconnected,
    /// The fatal error that ended the connection, followed by [ChannelEvent::Disconnected]
    Error(Error),
}

enum IoCommand {
    Verdict(bool),
    Heartbeat,
    PeerTimeout(Timing),
    Close,
}

/// State shared between the façade and the IO thread
#[derive(Debug)]
struct Shared {
    status: Mutex<ChannelStatus>,
    peer_key: Mutex<Option<PublicKey>>,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
}

impl Shared {
    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock() = status;
    }
}

struct Worker {
    commands: mpsc::Sender<IoCommand>,
    waker: Arc<Waker>,
    io: JoinHandle<()>,
    heartbeat: HeartbeatThread,
}

fn wake(commands: &mpsc::Sender<IoCommand>, waker: &Waker, cmd: IoCommand) -> bool {
    commands.send(cmd).is_ok() && waker.wake().is_ok()
}

fn other_io_error(e: anyhow::Error) -> Error {
    io::Error::new(io::ErrorKind::Other, format!("{e:#}")).into()
}

pub struct EncryptedChannel {
    config: ChannelConfig,
    store: Arc<PeerKeyStore>,
    verifier: Arc<dyn KeyVerifier>,
    timebase: Timebase,
    shared: Arc<Shared>,
    events: mpsc::Sender<ChannelEvent>,
    worker: Mutex<Option<Worker>>,
    cookie: Mutex<Option<CookieGuard>>,
}

impl std::fmt::Debug for EncryptedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl EncryptedChannel {
    /// A disconnected channel and the receiver its events are delivered to
    pub fn new(
        config: ChannelConfig,
        store: Arc<PeerKeyStore>,
        verifier: Arc<dyn KeyVerifier>,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::channel();
        let channel = Self {
            config,
            store,
            verifier,
            timebase: Timebase::default(),
            shared: Arc::new(Shared {
                status: Mutex::new(ChannelStatus::Disconnected),
                peer_key: Mutex::new(None),
                outbound: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
            events,
            worker: Mutex::new(None),
            cookie: Mutex::new(None),
        };
        (channel, events_rx)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.lock()
    }

    /// The authenticated identity of the peer once the channel is ready
    ///
    /// `None` for initiators a one-way responder accepted anonymously.
    pub fn peer_public_key(&self) -> Option<PublicKey> {
        match self.status() {
            ChannelStatus::Ready => *self.shared.peer_key.lock(),
            _ => None,
        }
    }

    /// Connect to `address` (`host:port`) and start the handshake as initiator
    pub fn open(&self, address: &str) -> Result<()> {
        self.ensure_unopened()?;
        self.shared.set_status(ChannelStatus::Connecting);

        let res = self.trust_peer_cookie(address).and_then(|()| {
            connect_tcp(address, self.config.connect_timeout()).map_err(Error::from)
        });
        match res {
            Ok(stream) => self.start(stream, address, HandshakeRole::Initiator),
            Err(e) => {
                warn!("Could not open channel to {address}: {e}");
                self.shared.set_status(ChannelStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Start the handshake as initiator over an already connected stream
    pub fn open_stream<T: Transport>(&self, stream: T, peer_address: &str) -> Result<()> {
        self.ensure_unopened()?;
        self.shared.set_status(ChannelStatus::Connecting);
        if let Err(e) = self.trust_peer_cookie(peer_address) {
            self.shared.set_status(ChannelStatus::Disconnected);
            return Err(e);
        }
        self.start(stream, peer_address, HandshakeRole::Initiator)
    }

    /// Serve the handshake as responder over an accepted stream
    pub fn accept<T: Transport>(&self, stream: T, peer_address: &str) -> Result<()> {
        self.ensure_unopened()?;
        self.shared.set_status(ChannelStatus::Connecting);
        self.start(stream, peer_address, HandshakeRole::Responder)
    }

    /// Queue `payload` for delivery
    ///
    /// Before the channel is ready messages are queued, or refused with
    /// [Error::NotReady] if `queue_before_ready` is off.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.status() != ChannelStatus::Ready && !self.config.queue_before_ready {
            return Err(Error::NotReady);
        }
        let payload = payload.into();
        if payload.len() > self.config.max_message_len {
            return Err(Error::SerializationFailed(format!(
                "message of {} bytes exceeds the limit of {}",
                payload.len(),
                self.config.max_message_len
            )));
        }
        {
            let mut queue = self.shared.outbound.lock();
            if queue.len() >= self.config.pending_queue_limit {
                return Err(Error::QueueFull);
            }
            queue.push_back(payload);
        }
        if let Some(w) = self.worker.lock().as_ref() {
            let _ = w.waker.wake();
        }
        Ok(())
    }

    /// Tear the connection down; calling it again has no effect
    pub fn close(&self) {
        let first = !self.shared.closed.swap(true, Ordering::AcqRel);
        let worker = self.worker.lock().take();
        if let Some(mut w) = worker {
            wake(&w.commands, &w.waker, IoCommand::Close);
            w.heartbeat.stop();
            if w.io.join().is_err() {
                error!("Channel IO thread panicked");
            }
        }
        drop(self.cookie.lock().take());
        self.shared.outbound.lock().clear();
        self.shared.set_status(ChannelStatus::Disconnected);
        if first {
            debug!("Channel closed");
        }
    }

    fn ensure_unopened(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.worker.lock().is_some() || self.status() != ChannelStatus::Disconnected {
            return Err(Error::AlreadyOpen);
        }
        Ok(())
    }

    fn trust_peer_cookie(&self, address: &str) -> Result<()> {
        let Some(path) = self.config.cookies.as_ref().and_then(|c| c.peer_cookie.as_ref()) else {
            return Ok(());
        };
        let key = read_cookie(path).map_err(|e| Error::InvalidKey(format!("{e:#}")))?;
        self.store
            .remember(address, key)
            .map_err(other_io_error)?;
        info!(
            "Trusting {} for {address} from cookie {path:?}",
            public_key_hex(&key)
        );
        Ok(())
    }

    fn start<T: Transport>(&self, stream: T, peer_address: &str, role: HandshakeRole) -> Result<()> {
        let res = self.spawn_worker(stream, peer_address, role);
        if let Err(e) = &res {
            warn!("Could not start channel with {peer_address}: {e}");
            drop(self.cookie.lock().take());
            self.shared.set_status(ChannelStatus::Disconnected);
        }
        res
    }

    fn spawn_worker<T: Transport>(
        &self,
        mut stream: T,
        peer_address: &str,
        role: HandshakeRole,
    ) -> Result<()> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)?;

        if let Some(path) = self.config.cookies.as_ref().and_then(|c| c.own_cookie.as_ref()) {
            let own = self.store.own_identity().public_key();
            let guard = CookieGuard::create(path, &own).map_err(other_io_error)?;
            *self.cookie.lock() = Some(guard);
        }

        let now = self.timebase.now();
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(
            self.config.heartbeat_interval_secs,
            self.config.peer_timeout_secs,
            now,
        )));
        let (commands, commands_rx) = mpsc::channel();

        let io = IoLoop {
            stream,
            poll,
            mio_events: Events::with_capacity(8),
            engine: HandshakeEngine::new(
                role,
                peer_address,
                self.store.clone(),
                self.config.auth_mode,
            ),
            cipher: SessionCipher::new(self.config.rekey_policy()),
            encoder: FrameEncoder::new(self.config.max_packet_payload),
            decoder: FrameDecoder::new(
                self.config.max_packet_payload,
                self.config.max_message_len,
            ),
            read_buf: vec![0u8; READ_CHUNK],
            write_buf: Vec::new(),
            commands: commands_rx,
            command_tx: commands.clone(),
            waker: waker.clone(),
            shared: self.shared.clone(),
            notify: self.events.clone(),
            monitor: monitor.clone(),
            timebase: self.timebase.clone(),
            verifier: self.verifier.clone(),
            verify_timeout: self.config.verify_timeout_secs,
            verify_deadline: None,
        };

        self.shared.set_status(ChannelStatus::HandshakeInProgress);
        let io = thread::Builder::new()
            .name("bip15x-io".into())
            .spawn(move || io.run())?;

        let hb_commands = commands.clone();
        let hb_waker = waker.clone();
        let heartbeat = HeartbeatThread::spawn(
            monitor,
            self.timebase.clone(),
            self.config.heartbeat_tick(),
            move |action| match action {
                HeartbeatAction::SendHeartbeat => {
                    wake(&hb_commands, &hb_waker, IoCommand::Heartbeat)
                }
                HeartbeatAction::PeerTimedOut(silence) => {
                    wake(&hb_commands, &hb_waker, IoCommand::PeerTimeout(silence));
                    false
                }
                HeartbeatAction::Idle => true,
            },
        )?;

        *self.worker.lock() = Some(Worker {
            commands,
            waker,
            io,
            heartbeat,
        });
        Ok(())
    }
}

impl Drop for EncryptedChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why the event loop ended without an error
enum Exit {
    Closed,
    PeerClosed,
}

/// Everything owned by the IO thread
struct IoLoop<T: Transport> {
    stream: T,
    poll: Poll,
    mio_events: Events,
    engine: HandshakeEngine,
    cipher: SessionCipher,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    commands: mpsc::Receiver<IoCommand>,
    command_tx: mpsc::Sender<IoCommand>,
    waker: Arc<Waker>,
    shared: Arc<Shared>,
    notify: mpsc::Sender<ChannelEvent>,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    timebase: Timebase,
    verifier: Arc<dyn KeyVerifier>,
    verify_timeout: Timing,
    verify_deadline: Option<Timing>,
}

impl<T: Transport> IoLoop<T> {
    fn run(mut self) {
        let peer = self.engine.peer_address().to_owned();
        let res = self.event_loop();
        let err = match res {
            Ok(Exit::Closed) => {
                debug!("Channel with {peer} closed locally");
                None
            }
            Ok(Exit::PeerClosed) => {
                info!("{peer} closed the channel");
                None
            }
            Err(e) => {
                warn!("Channel with {peer} failed: {e}");
                Some(e)
            }
        };
        self.teardown(err);
    }

    fn teardown(&mut self, err: Option<Error>) {
        self.engine.close();
        self.cipher.deactivate();
        self.decoder.reset();
        self.monitor.lock().set_established(false, self.timebase.now());
        let _ = self.poll.registry().deregister(&mut self.stream);
        let _ = self.stream.shutdown();

        self.shared.closed.store(true, Ordering::Release);
        *self.shared.peer_key.lock() = None;
        self.shared.set_status(ChannelStatus::Disconnected);
        if let Some(e) = err {
            let _ = self.notify.send(ChannelEvent::Error(e));
        }
        let _ = self.notify.send(ChannelEvent::Disconnected);
    }

    fn event_loop(&mut self) -> Result<Exit> {
        let now = self.timebase.now();
        self.engine
            .start(&mut self.cipher, &mut self.write_buf, now)?;

        loop {
            let now = self.timebase.now();
            if let Some(exit) = self.handle_commands(now)? {
                return Ok(exit);
            }
            self.check_timers(now)?;
            if let Some(exit) = self.read_available(now)? {
                return Ok(exit);
            }
            self.drain_outbound(now)?;
            self.flush()?;

            let timeout = self.timebase.dur(IO_POLL_INTERVAL);
            match self.poll.poll(&mut self.mio_events, Some(timeout)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                r => r?,
            }
        }
    }

    fn handle_commands(&mut self, now: Timing) -> Result<Option<Exit>> {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                IoCommand::Close => {
                    // best effort; whatever does not fit the socket buffer is dropped
                    self.drain_outbound(now)?;
                    self.flush()?;
                    return Ok(Some(Exit::Closed));
                }
                IoCommand::Verdict(accept) => {
                    self.verify_deadline = None;
                    self.engine
                        .verdict(accept, &mut self.cipher, &mut self.write_buf)?;
                }
                IoCommand::Heartbeat => self.send_heartbeat(now)?,
                IoCommand::PeerTimeout(silence) => return Err(Error::HeartbeatTimeout(silence)),
            }
        }
        Ok(None)
    }

    fn check_timers(&mut self, now: Timing) -> Result<()> {
        if let Some(deadline) = self.verify_deadline {
            if has_happened(deadline, now) {
                warn!(
                    "No verdict on the key of {} within {:.0} seconds",
                    self.engine.peer_address(),
                    self.verify_timeout
                );
                self.verify_deadline = None;
                self.engine
                    .verdict(false, &mut self.cipher, &mut self.write_buf)?;
            }
        }
        if self.engine.is_established() && self.cipher.rekey_needed(0, now) {
            self.rekey(now)?;
        }
        Ok(())
    }

    fn rekey(&mut self, now: Timing) -> Result<()> {
        self.engine
            .rekey(&mut self.cipher, &mut self.write_buf, now)?;
        let (outbound, _) = self.cipher.rekey_count();
        info!(
            "Rekeyed channel to {} ({outbound} outbound rekeys)",
            self.engine.peer_address()
        );
        Ok(())
    }

    fn send_heartbeat(&mut self, now: Timing) -> Result<()> {
        if !self.engine.is_established() {
            return Ok(());
        }
        if self.cipher.rekey_needed(HEADER_LEN, now) {
            self.rekey(now)?;
        }
        let packet = self.encoder.encode_heartbeat(Some(&mut self.cipher))?;
        self.write_buf.extend_from_slice(&packet);
        self.monitor.lock().record_send(now);
        Ok(())
    }

    /// Seal queued application messages, rekeying whenever a packet would cross a threshold
    fn drain_outbound(&mut self, now: Timing) -> Result<()> {
        if !self.engine.is_established() {
            return Ok(());
        }
        let mut sent = false;
        while self.write_buf.len() < WRITE_HIGH_WATER {
            let Some(msg) = self.shared.outbound.lock().pop_front() else {
                break;
            };
            for frag in self.encoder.fragments(&msg)? {
                if self.cipher.rekey_needed(HEADER_LEN + frag.payload.len(), now) {
                    self.rekey(now)?;
                }
                let packet =
                    encode_packet(frag.msg_type, frag.msg_id, &frag.payload, Some(&mut self.cipher))?;
                self.write_buf.extend_from_slice(&packet);
            }
            sent = true;
        }
        if sent {
            self.monitor.lock().record_send(now);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let n = self.stream.write_nonblocking(&self.write_buf)?;
        self.write_buf.drain(..n);
        Ok(())
    }

    fn read_available(&mut self, now: Timing) -> Result<Option<Exit>> {
        let mut buf = take(&mut self.read_buf);
        let res = self.read_into(&mut buf, now);
        self.read_buf = buf;
        res
    }

    fn read_into(&mut self, buf: &mut [u8], now: Timing) -> Result<Option<Exit>> {
        loop {
            match self.stream.read_nonblocking(buf)? {
                None => return Ok(None),
                Some(0) if self.engine.is_established() => return Ok(Some(Exit::PeerClosed)),
                Some(0) => {
                    return Err(Error::HandshakeFailed(
                        "peer closed the connection during the handshake".into(),
                    ))
                }
                Some(n) => self.process_input(&buf[..n], now)?,
            }
        }
    }

    fn process_input(&mut self, bytes: &[u8], now: Timing) -> Result<()> {
        let mut input = bytes;
        loop {
            let outcome = self.decoder.decode(input, Some(&mut self.cipher));
            input = &[];
            match outcome {
                DecodeOutcome::NeedMoreBytes => return Ok(()),
                DecodeOutcome::Error(e) => return Err(e.into()),
                DecodeOutcome::Heartbeat => self.monitor.lock().record_receive(now),
                DecodeOutcome::CompleteMessage(msg) => {
                    if !self.engine.is_established() {
                        return Err(Error::HandshakeFailed(
                            "application data before the handshake completed".into(),
                        ));
                    }
                    self.monitor.lock().record_receive(now);
                    let _ = self.notify.send(ChannelEvent::Message(msg));
                }
                DecodeOutcome::HandshakeFrame(frame) => {
                    self.monitor.lock().record_receive(now);
                    let res = self.engine.handle_frame(
                        &frame,
                        &mut self.cipher,
                        &mut self.write_buf,
                        now,
                    )?;
                    if let Some(req) = res.verify {
                        self.request_verification(req, now)?;
                    }
                    if res.established {
                        self.on_established(now);
                    }
                }
            }
        }
    }

    fn request_verification(&mut self, req: VerifyRequest, now: Timing) -> Result<()> {
        let commands = self.command_tx.clone();
        let waker = self.waker.clone();
        let pending = PendingVerification::new(move |accept| {
            wake(&commands, &waker, IoCommand::Verdict(accept));
        });
        debug!(
            "Asking for a verdict on key {} of {}",
            public_key_hex(&req.new_key),
            self.engine.peer_address()
        );
        spawn_verification(
            self.verifier.clone(),
            req.old_key.as_ref().map(public_key_hex),
            public_key_hex(&req.new_key),
            pending,
        )?;
        self.verify_deadline = Some(now + self.verify_timeout);
        Ok(())
    }

    fn on_established(&mut self, now: Timing) {
        self.monitor.lock().set_established(true, now);
        *self.shared.peer_key.lock() = self.engine.peer_identity();
        self.shared.set_status(ChannelStatus::Ready);
        let _ = self.notify.send(ChannelEvent::Connected);
    }
}
