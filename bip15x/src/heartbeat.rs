//! Keep-alive and dead peer detection
//!
//! [HeartbeatMonitor] is the pure bookkeeping: it remembers when data was
//! last sent and received and decides on every [HeartbeatMonitor::tick]
//! whether a heartbeat is due or the peer went silent. [HeartbeatThread]
//! calls `tick` at a fixed short interval on a thread of its own and hands
//! the resulting actions to the channel; it never touches the socket.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use bip15x_util::time::Timebase;

use crate::protocol::timing::{has_happened, Timing};

/// What the channel has to do after a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartbeatAction {
    Idle,
    /// Nothing was sent for the heartbeat interval
    SendHeartbeat,
    /// Nothing was received for longer than the peer timeout; carries the silence
    PeerTimedOut(Timing),
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Timing,
    peer_timeout: Option<Timing>,
    established: bool,
    last_send: Timing,
    last_receive: Timing,
}

impl HeartbeatMonitor {
    pub fn new(interval: Timing, peer_timeout: Option<Timing>, now: Timing) -> Self {
        Self {
            interval,
            peer_timeout,
            established: false,
            last_send: now,
            last_receive: now,
        }
    }

    /// Heartbeats are only sent over established sessions; the idle timers restart here
    pub fn set_established(&mut self, established: bool, now: Timing) {
        self.established = established;
        self.last_send = now;
        self.last_receive = now;
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn record_send(&mut self, now: Timing) {
        self.last_send = self.last_send.max(now);
    }

    pub fn record_receive(&mut self, now: Timing) {
        self.last_receive = self.last_receive.max(now);
    }

    pub fn time_since_last_send(&self, now: Timing) -> Timing {
        now - self.last_send
    }

    pub fn time_since_last_receive(&self, now: Timing) -> Timing {
        now - self.last_receive
    }

    /// Decide what is due at `now`
    ///
    /// Returning [HeartbeatAction::SendHeartbeat] counts as a send, so the
    /// next heartbeat is due one interval later.
    pub fn tick(&mut self, now: Timing) -> HeartbeatAction {
        if !self.established {
            return HeartbeatAction::Idle;
        }
        if let Some(timeout) = self.peer_timeout {
            if has_happened(self.last_receive + timeout, now) {
                return HeartbeatAction::PeerTimedOut(self.time_since_last_receive(now));
            }
        }
        if has_happened(self.last_send + self.interval, now) {
            self.last_send = now;
            return HeartbeatAction::SendHeartbeat;
        }
        HeartbeatAction::Idle
    }
}

/// Ticks a shared [HeartbeatMonitor] until stopped
///
/// Dropping the handle stops and joins the thread.
#[derive(Debug)]
pub struct HeartbeatThread {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatThread {
    /// Start ticking every `tick`
    ///
    /// `on_action` receives every action other than [HeartbeatAction::Idle];
    /// when it returns `false` the thread ends.
    pub fn spawn<F>(
        monitor: Arc<Mutex<HeartbeatMonitor>>,
        timebase: Timebase,
        tick: Duration,
        mut on_action: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(HeartbeatAction) -> bool + Send + 'static,
    {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("bip15x-heartbeat".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let action = monitor.lock().tick(timebase.now());
                if action != HeartbeatAction::Idle && !on_action(action) {
                    debug!("Heartbeat thread stops after {action:?}");
                    break;
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Signal the thread to end and wait for it
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HeartbeatThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_after_idle_interval() {
        let mut m = HeartbeatMonitor::new(30.0, None, 0.0);
        // not before the session is up
        assert_eq!(m.tick(100.0), HeartbeatAction::Idle);

        m.set_established(true, 100.0);
        assert_eq!(m.tick(110.0), HeartbeatAction::Idle);
        m.record_send(120.0);
        assert_eq!(m.tick(140.0), HeartbeatAction::Idle);
        assert_eq!(m.tick(150.0), HeartbeatAction::SendHeartbeat);
        // exactly one heartbeat per idle interval
        assert_eq!(m.tick(151.0), HeartbeatAction::Idle);
        assert_eq!(m.time_since_last_send(151.0), 1.0);
        assert_eq!(m.tick(180.0), HeartbeatAction::SendHeartbeat);
    }

    #[test]
    fn silent_peer_times_out() {
        let mut m = HeartbeatMonitor::new(30.0, Some(90.0), 0.0);
        m.set_established(true, 0.0);
        m.record_receive(50.0);
        assert_ne!(m.tick(100.0), HeartbeatAction::PeerTimedOut(50.0));
        assert_eq!(m.tick(140.0), HeartbeatAction::PeerTimedOut(90.0));
    }

    #[test]
    fn thread_reports_and_stops() {
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(0.0, None, 0.0)));
        monitor.lock().set_established(true, 0.0);

        let (tx, rx) = mpsc::channel();
        let mut thread = HeartbeatThread::spawn(
            monitor.clone(),
            Timebase::default(),
            Duration::from_millis(5),
            move |action| tx.send(action).is_ok(),
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok(HeartbeatAction::SendHeartbeat)
        );
        thread.stop();
        assert!(!thread.is_running());
        // a second stop is harmless
        thread.stop();
    }
}
