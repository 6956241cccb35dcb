//! Approval of unknown peer identity keys
//!
//! When a peer presents an identity key the local [PeerKeyStore](crate::peers::PeerKeyStore)
//! does not know, the channel asks a [KeyVerifier]. The verifier runs on its
//! own thread and may take as long as a human needs; it answers by resolving
//! the [PendingVerification] it was handed. The channel's I/O thread keeps
//! running meanwhile and rejects the key if no answer arrives in time.

use std::sync::{mpsc, Arc};
use std::thread;

use log::{debug, warn};

type Resolver = Box<dyn FnOnce(bool) + Send + 'static>;

/// Decides whether an unknown peer key may be trusted
pub trait KeyVerifier: Send + Sync + 'static {
    /// `old_key_hex` is the key previously bound to the peer's address, if any.
    ///
    /// Implementations must eventually call [PendingVerification::accept] or
    /// [PendingVerification::reject]; dropping `resolve` counts as a rejection.
    fn verify(&self, old_key_hex: Option<&str>, new_key_hex: &str, resolve: PendingVerification);
}

impl<F> KeyVerifier for F
where
    F: Fn(Option<&str>, &str, PendingVerification) + Send + Sync + 'static,
{
    fn verify(&self, old_key_hex: Option<&str>, new_key_hex: &str, resolve: PendingVerification) {
        self(old_key_hex, new_key_hex, resolve)
    }
}

/// Accepts every key
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl KeyVerifier for AcceptAll {
    fn verify(&self, _: Option<&str>, new_key_hex: &str, resolve: PendingVerification) {
        debug!("Accepting peer key {new_key_hex} without verification");
        resolve.accept();
    }
}

/// Rejects every key; only keys already in the store are trusted
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl KeyVerifier for RejectAll {
    fn verify(&self, _: Option<&str>, new_key_hex: &str, resolve: PendingVerification) {
        debug!("Rejecting unknown peer key {new_key_hex}");
        resolve.reject();
    }
}

/// The open question "may this key be trusted?"
///
/// Resolved exactly once: by [Self::accept], [Self::reject], or by being
/// dropped, which rejects.
pub struct PendingVerification {
    resolver: Option<Resolver>,
}

impl PendingVerification {
    pub fn new<F: FnOnce(bool) + Send + 'static>(resolver: F) -> Self {
        Self {
            resolver: Some(Box::new(resolver)),
        }
    }

    /// A verification whose verdict arrives on the returned receiver
    pub fn channel() -> (Self, mpsc::Receiver<bool>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let pending = Self::new(move |verdict| {
            let _ = tx.send(verdict);
        });
        (pending, rx)
    }

    pub fn accept(mut self) {
        self.resolve(true)
    }

    pub fn reject(mut self) {
        self.resolve(false)
    }

    fn resolve(&mut self, verdict: bool) {
        if let Some(resolver) = self.resolver.take() {
            resolver(verdict);
        }
    }
}

impl Drop for PendingVerification {
    fn drop(&mut self) {
        if self.resolver.is_some() {
            warn!("Key verification dropped without a verdict; rejecting the key");
            self.resolve(false);
        }
    }
}

impl std::fmt::Debug for PendingVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingVerification")
            .field("resolved", &self.resolver.is_none())
            .finish()
    }
}

/// Run `verifier` on a thread of its own
pub fn spawn_verification(
    verifier: Arc<dyn KeyVerifier>,
    old_key_hex: Option<String>,
    new_key_hex: String,
    resolve: PendingVerification,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("bip15x-verify".into())
        .spawn(move || verifier.verify(old_key_hex.as_deref(), &new_key_hex, resolve))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resolves_exactly_once() {
        let (pending, rx) = PendingVerification::channel();
        pending.accept();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_rejects() {
        let (pending, rx) = PendingVerification::channel();
        drop(pending);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(false));
    }

    #[test]
    fn closures_are_verifiers() {
        let verifier: Arc<dyn KeyVerifier> =
            Arc::new(|old: Option<&str>, new: &str, resolve: PendingVerification| {
                if old.is_none() && new.starts_with("02") {
                    resolve.accept()
                } else {
                    resolve.reject()
                }
            });

        let (pending, rx) = PendingVerification::channel();
        spawn_verification(verifier.clone(), None, "02ab".into(), pending).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));

        let (pending, rx) = PendingVerification::channel();
        spawn_verification(verifier, Some("02ab".into()), "03cd".into(), pending).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }
}
