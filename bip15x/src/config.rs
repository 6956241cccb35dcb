//! Configuration readable from a config file.
//!
//! Channels are configured through [ChannelConfig], which can be read from a
//! TOML file. Every field has a default, so an empty file (or no file at all)
//! is a valid configuration:
//!
//! ```toml
//! max_packet_payload = 16384
//! rekey_interval_secs = 60.0
//! auth_mode = "one-way"
//!
//! [cookies]
//! own_cookie = "~/.bip15x/client.cookie"
//! peer_cookie = "~/.bip15x/server.cookie"
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use bip15x_util::file::{fopen_w, Visibility};

use crate::msgs::{FRAGMENT_TOTAL_LEN, HEADER_LEN, MAX_PACKET_BODY_LEN};
use crate::protocol::constants::{
    HEARTBEAT_INTERVAL, HEARTBEAT_TICK, MAX_MESSAGE_LEN, MAX_PACKET_PAYLOAD, PENDING_QUEUE_LIMIT,
    REKEY_AFTER_BYTES, REKEY_AFTER_TIME, VERIFY_TIMEOUT,
};
use crate::protocol::{AuthMode, RekeyPolicy, Timing};

/// Largest packet payload that still fits [MAX_PACKET_BODY_LEN] once sealed
pub const MAX_CONFIGURABLE_PACKET_PAYLOAD: usize =
    MAX_PACKET_BODY_LEN - HEADER_LEN - bip15x_ciphers::aead::TAG_LEN;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// largest plaintext payload of one wire packet; longer messages are fragmented
    pub max_packet_payload: usize,

    /// largest message accepted after reassembly
    pub max_message_len: usize,

    /// outbound bytes after which the session key is rotated
    pub rekey_bytes: u64,

    /// seconds after which the session key is rotated
    pub rekey_interval_secs: Timing,

    /// idle seconds after which a heartbeat is sent
    pub heartbeat_interval_secs: Timing,

    /// how often the heartbeat thread checks the idle time
    pub heartbeat_tick_secs: Timing,

    /// close the channel when nothing was received for this long
    pub peer_timeout_secs: Option<Timing>,

    /// reject an unknown peer key if the verifier did not answer in time
    pub verify_timeout_secs: Timing,

    /// seconds to wait for a TCP connection
    pub connect_timeout_secs: Timing,

    /// queue messages sent before the channel is ready instead of failing
    pub queue_before_ready: bool,

    /// maximum number of queued outbound messages
    pub pending_queue_limit: usize,

    pub auth_mode: AuthMode,

    pub cookies: Option<CookieConfig>,
}

/// Trust-on-first-use through identity files on the local machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    /// written with our identity key when a channel starts, removed when it ends
    pub own_cookie: Option<PathBuf>,

    /// read once at connect time; its key is trusted for the peer address
    pub peer_cookie: Option<PathBuf>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_packet_payload: MAX_PACKET_PAYLOAD,
            max_message_len: MAX_MESSAGE_LEN,
            rekey_bytes: REKEY_AFTER_BYTES,
            rekey_interval_secs: REKEY_AFTER_TIME,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL,
            heartbeat_tick_secs: HEARTBEAT_TICK,
            peer_timeout_secs: None,
            verify_timeout_secs: VERIFY_TIMEOUT,
            connect_timeout_secs: 10.0,
            queue_before_ready: true,
            pending_queue_limit: PENDING_QUEUE_LIMIT,
            auth_mode: AuthMode::default(),
            cookies: None,
        }
    }
}

impl ChannelConfig {
    /// load configuration from a TOML file
    ///
    /// NOTE: no validation is conducted; call [Self::validate] before use.
    pub fn load<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let p = p.as_ref();
        let text = fs::read_to_string(p).with_context(|| format!("reading config {p:?}"))?;
        let mut config: Self =
            toml::from_str(&text).with_context(|| format!("parsing config {p:?}"))?;

        if let Some(cookies) = config.cookies.as_mut() {
            use util::resolve_path_with_tilde;
            if let Some(path) = cookies.own_cookie.as_mut() {
                resolve_path_with_tilde(path);
            }
            if let Some(path) = cookies.peer_cookie.as_mut() {
                resolve_path_with_tilde(path);
            }
        }

        Ok(config)
    }

    /// Write a config to a file
    pub fn store<P: AsRef<Path>>(&self, p: P) -> anyhow::Result<()> {
        let mut f = fopen_w(p, Visibility::Public)?;
        f.write_all(toml::to_string_pretty(&self)?.as_bytes())?;
        Ok(())
    }

    /// Validate a configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.max_packet_payload > FRAGMENT_TOTAL_LEN,
            "max_packet_payload must be larger than {FRAGMENT_TOTAL_LEN} bytes"
        );
        ensure!(
            self.max_packet_payload <= MAX_CONFIGURABLE_PACKET_PAYLOAD,
            "max_packet_payload {} exceeds the limit of {MAX_CONFIGURABLE_PACKET_PAYLOAD}",
            self.max_packet_payload
        );
        ensure!(
            self.max_message_len >= self.max_packet_payload,
            "max_message_len {} is smaller than one packet ({})",
            self.max_message_len,
            self.max_packet_payload
        );
        ensure!(self.rekey_bytes > 0, "rekey_bytes must be positive");

        for (name, value) in [
            ("rekey_interval_secs", self.rekey_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("heartbeat_tick_secs", self.heartbeat_tick_secs),
            ("verify_timeout_secs", self.verify_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            ensure!(
                value.is_finite() && value > 0.0,
                "{name} must be a positive number of seconds, got {value}"
            );
        }
        ensure!(
            self.heartbeat_interval_secs >= self.heartbeat_tick_secs,
            "heartbeat_interval_secs ({}) is shorter than heartbeat_tick_secs ({})",
            self.heartbeat_interval_secs,
            self.heartbeat_tick_secs
        );
        if let Some(timeout) = self.peer_timeout_secs {
            ensure!(
                timeout.is_finite() && timeout > self.heartbeat_interval_secs,
                "peer_timeout_secs ({timeout}) must exceed heartbeat_interval_secs ({})",
                self.heartbeat_interval_secs
            );
        }
        ensure!(
            self.pending_queue_limit > 0,
            "pending_queue_limit must be positive"
        );

        Ok(())
    }

    pub fn rekey_policy(&self) -> RekeyPolicy {
        RekeyPolicy {
            max_bytes: self.rekey_bytes,
            max_age: self.rekey_interval_secs,
        }
    }

    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_tick_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }
}

pub mod util {
    use std::path::PathBuf;

    /// takes a path that can potentially start with a `~` and resolves that `~` to the user's home directory
    ///
    /// Paths are left alone if the home directory is unknown.
    ///
    /// ## Example
    /// ```
    /// use bip15x::config::util::resolve_path_with_tilde;
    /// std::env::set_var("HOME","/home/dummy");
    /// let mut path = std::path::PathBuf::from("~/client.cookie");
    /// resolve_path_with_tilde(&mut path);
    /// assert!(path == std::path::PathBuf::from("/home/dummy/client.cookie"));
    /// ```
    pub fn resolve_path_with_tilde(path: &mut PathBuf) {
        let Some(first_segment) = path.iter().next() else {
            return;
        };
        if path.has_root() || first_segment != "~" {
            return;
        }
        let Some(home_dir) = home::home_dir() else {
            log::warn!("path {path:?} contains \"~\" but the home directory is unknown");
            return;
        };
        let orig_path = path.clone();
        path.clear();
        path.push(home_dir);
        for segment in orig_path.iter().skip(1) {
            path.push(segment);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ChannelConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_file_gives_defaults() -> anyhow::Result<()> {
        let config: ChannelConfig = toml::from_str("")?;
        assert_eq!(config, ChannelConfig::default());
        Ok(())
    }

    #[test]
    fn partial_file_overrides_fields() -> anyhow::Result<()> {
        let config: ChannelConfig = toml::from_str(
            r#"
            max_packet_payload = 1024
            auth_mode = "one-way"
            peer_timeout_secs = 120.0

            [cookies]
            peer_cookie = "/run/server.cookie"
            "#,
        )?;
        assert_eq!(config.max_packet_payload, 1024);
        assert_eq!(config.auth_mode, AuthMode::OneWay);
        assert_eq!(config.peer_timeout_secs, Some(120.0));
        assert_eq!(
            config.cookies,
            Some(CookieConfig {
                own_cookie: None,
                peer_cookie: Some("/run/server.cookie".into()),
            })
        );
        assert_eq!(config.rekey_interval_secs, REKEY_AFTER_TIME);
        config.validate()
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<ChannelConfig>("rekey_after = 5").is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        let check = |f: fn(&mut ChannelConfig)| {
            let mut c = ChannelConfig::default();
            f(&mut c);
            c.validate().is_err()
        };
        assert!(check(|c| c.max_packet_payload = 0));
        assert!(check(|c| c.max_packet_payload = MAX_PACKET_BODY_LEN));
        assert!(check(|c| c.max_message_len = 16));
        assert!(check(|c| c.rekey_interval_secs = 0.0));
        assert!(check(|c| c.heartbeat_tick_secs = f64::NAN));
        assert!(check(|c| c.heartbeat_interval_secs = 0.5));
        assert!(check(|c| c.peer_timeout_secs = Some(10.0)));
        assert!(check(|c| c.pending_queue_limit = 0));
        assert!(!check(|c| c.peer_timeout_secs = Some(90.0)));
    }
}
