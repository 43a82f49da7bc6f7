//! Trust-on-first-use host-key policy.
//!
//! Consulted once per SSH handshake. An unknown host is learned and
//! accepted, a known host must present the key on file, and a known host
//! presenting anything else is refused without touching the ledger.

use bastion_types::PublicHostKey;

use crate::host::{fingerprint, normalize};
use crate::{Ledger, LedgerError, LedgerOutcome};

/// Why a host key was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// First contact; the key is now in the ledger.
    Learned,
    /// The key matches the ledger entry.
    Trusted,
}

/// TOFU verifier backed by a [`Ledger`].
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    ledger: Ledger,
}

impl HostKeyVerifier {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Verify the key presented by `host:port`.
    ///
    /// Returns `LedgerError::HostKeyMismatch` when the ledger holds a
    /// different key for the host; the ledger is left untouched.
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        presented: &PublicHostKey,
    ) -> Result<Verification, LedgerError> {
        let pattern = normalize(host, port);

        match self.ledger.check_or_learn(&pattern, presented)? {
            LedgerOutcome::Learned => {
                tracing::warn!(
                    "Permanently added '{}' ({} {}) to the host-key ledger {}",
                    pattern,
                    presented.key_type,
                    fingerprint(presented),
                    self.ledger.path().display()
                );
                Ok(Verification::Learned)
            }
            LedgerOutcome::Matched => {
                tracing::debug!("Host key for {pattern} matches the ledger");
                Ok(Verification::Trusted)
            }
            LedgerOutcome::Mismatched(record) => {
                let expected = format!("{} {}", record.key_type, fingerprint(&record.host_key()));
                let presented = format!("{} {}", presented.key_type, fingerprint(presented));
                tracing::error!(
                    "@@@ REMOTE HOST IDENTIFICATION HAS CHANGED for {pattern} @@@ \
                     ledger {} has {expected}, server presented {presented}",
                    self.ledger.path().display()
                );
                Err(LedgerError::HostKeyMismatch {
                    host: pattern,
                    expected,
                    presented,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicHostKey {
        PublicHostKey::new("ssh-ed25519", vec![byte; 51])
    }

    fn setup() -> (HostKeyVerifier, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("known_hosts"));
        (HostKeyVerifier::new(ledger), dir)
    }

    #[test]
    fn test_unknown_host_is_learned() {
        let (verifier, _dir) = setup();

        let outcome = verifier.verify("bastion.example.com", 22, &key(1)).unwrap();
        assert_eq!(outcome, Verification::Learned);

        let records = verifier.ledger().load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host_pattern, "bastion.example.com");
        assert!(records[0].matches(&key(1)));
    }

    #[test]
    fn test_known_match_leaves_ledger_unchanged() {
        let (verifier, _dir) = setup();
        verifier.verify("10.0.0.7", 2222, &key(1)).unwrap();
        let before = std::fs::read(verifier.ledger().path()).unwrap();

        let outcome = verifier.verify("10.0.0.7", 2222, &key(1)).unwrap();
        assert_eq!(outcome, Verification::Trusted);

        let after = std::fs::read(verifier.ledger().path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_known_mismatch_is_rejected() {
        let (verifier, _dir) = setup();
        verifier.verify("10.0.0.7", 2222, &key(1)).unwrap();
        let before = std::fs::read(verifier.ledger().path()).unwrap();

        let err = verifier.verify("10.0.0.7", 2222, &key(2)).unwrap_err();
        match err {
            LedgerError::HostKeyMismatch { host, expected, presented } => {
                assert_eq!(host, "[10.0.0.7]:2222");
                assert_ne!(expected, presented);
            }
            other => panic!("expected HostKeyMismatch, got {other:?}"),
        }

        let after = std::fs::read(verifier.ledger().path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_key_type_change_is_a_mismatch() {
        let (verifier, _dir) = setup();
        verifier.verify("bastion", 22, &key(1)).unwrap();

        let rsa = PublicHostKey::new("ssh-rsa", vec![1; 51]);
        assert!(matches!(
            verifier.verify("bastion", 22, &rsa),
            Err(LedgerError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_same_host_different_port_is_separate_identity() {
        let (verifier, _dir) = setup();
        verifier.verify("bastion", 22, &key(1)).unwrap();

        let outcome = verifier.verify("bastion", 2222, &key(2)).unwrap();
        assert_eq!(outcome, Verification::Learned);
        assert_eq!(verifier.ledger().load().unwrap().len(), 2);
    }
}
