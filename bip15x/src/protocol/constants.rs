//! Constants and default configuration values of the transport

use super::timing::Timing;

/// Outbound bytes after which the session key is rotated
///
/// Counted as plaintext bytes encrypted since the last rekey, including
/// heartbeats and control frames.
pub const REKEY_AFTER_BYTES: u64 = 64 * 1024 * 1024;

/// Time after which the session key is rotated even without traffic
pub const REKEY_AFTER_TIME: Timing = 60.0;

/// Idle time after which a heartbeat is sent
pub const HEARTBEAT_INTERVAL: Timing = 30.0;

/// How often the heartbeat thread wakes up to check the idle time
pub const HEARTBEAT_TICK: Timing = 1.0;

/// Time a peer key verification may stay unanswered before it is rejected
pub const VERIFY_TIMEOUT: Timing = 60.0;

/// Largest plaintext body of a single wire packet
pub const MAX_PACKET_PAYLOAD: usize = 16 * 1024;

/// Largest application message accepted after reassembly
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Number of messages `send` may queue while the channel is not ready
pub const PENDING_QUEUE_LIMIT: usize = 1024;

/// Longest the I/O thread sleeps before it checks timers
pub const IO_POLL_INTERVAL: Timing = 0.1;

/// This is the maximum delay that can separate two events for us to consider the events to have
/// happened at the same time.
pub const EVENT_GRACE: Timing = 0.0025;
