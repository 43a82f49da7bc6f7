//! Integration test: TOFU lifecycle across ledger handles.
//!
//! Tests: absent ledger -> learn -> re-verify from a fresh handle
//!        -> mismatch leaves file intact -> concurrent learners
//!        -> hashed, wildcard and multi-key OpenSSH entries

use bastion_ledger::{HostKeyVerifier, Ledger, LedgerError, Verification};
use bastion_types::PublicHostKey;
use std::sync::Arc;
use tempfile::TempDir;

fn key(byte: u8) -> PublicHostKey {
    PublicHostKey::new("ssh-ed25519", vec![byte; 51])
}

#[test]
fn test_tofu_lifecycle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".ssh").join("known_hosts");

    // ── 1. Ledger does not exist yet ────────────────────────
    let ledger = Ledger::new(&path);
    assert!(!ledger.exists());
    assert!(ledger.load().unwrap().is_empty());
    assert!(ledger.lookup("bastion").unwrap().is_none());

    // ── 2. First contact is learned ─────────────────────────
    let verifier = HostKeyVerifier::new(ledger.clone());
    assert_eq!(
        verifier.verify("bastion", 22, &key(7)).unwrap(),
        Verification::Learned
    );
    assert!(ledger.exists());
    let found = ledger.lookup("bastion").unwrap().unwrap();
    assert!(found.matches(&key(7)));

    // ── 3. A new process (fresh handle) trusts the same key ─
    let snapshot = std::fs::read(&path).unwrap();
    let verifier2 = HostKeyVerifier::new(Ledger::new(&path));
    assert_eq!(
        verifier2.verify("BASTION", 22, &key(7)).unwrap(),
        Verification::Trusted
    );
    assert_eq!(std::fs::read(&path).unwrap(), snapshot);

    // ── 4. A different key is refused and nothing is written ─
    let err = verifier2.verify("bastion", 22, &key(8)).unwrap_err();
    assert!(matches!(err, LedgerError::HostKeyMismatch { .. }));
    assert!(err.to_string().contains("HOST KEY MISMATCH"));
    assert_eq!(std::fs::read(&path).unwrap(), snapshot);
    assert_eq!(ledger.load().unwrap().len(), 1);
}

#[test]
fn test_existing_entries_survive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_hosts");
    let existing = "github.com,140.82.112.3 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl\n";
    std::fs::write(&path, existing).unwrap();

    let verifier = HostKeyVerifier::new(Ledger::new(&path));
    verifier.verify("bastion", 2222, &key(1)).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with(existing));
    assert!(Ledger::new(&path).lookup("140.82.112.3").unwrap().is_some());
    assert_eq!(Ledger::new(&path).load().unwrap().len(), 2);
}

#[test]
fn test_concurrent_learners_do_not_corrupt() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::new(dir.path().join("known_hosts")));

    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let verifier = HostKeyVerifier::new((*ledger).clone());
                // every host is verified twice; the second call must match
                verifier.verify(&format!("db-{i}"), 22, &key(i)).unwrap();
                verifier.verify(&format!("db-{i}"), 22, &key(i)).unwrap()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), Verification::Trusted);
    }

    let records = ledger.load().unwrap();
    assert_eq!(records.len(), 16);
    for i in 0..16u8 {
        let rec = ledger.lookup(&format!("db-{i}")).unwrap().unwrap();
        assert!(rec.matches(&key(i)));
    }
}

/// base64 of `key(1)`'s blob (51 bytes of 0x01).
const KEY1_B64: &str = "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";

fn seeded(contents: &str) -> (TempDir, std::path::PathBuf, HostKeyVerifier) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_hosts");
    std::fs::write(&path, contents).unwrap();
    let verifier = HostKeyVerifier::new(Ledger::new(&path));
    (dir, path, verifier)
}

#[test]
fn test_hashed_entry_is_enforced() {
    // `ssh-keygen -H` style entry for "bastion"
    let line = format!(
        "|1|AQIDBAUGBwgJCgsMDQ4PEBESExQ=|5M2EcqVipHc15iLYNqxcQNAMJZQ= ssh-ed25519 {KEY1_B64}\n"
    );
    let (_dir, path, verifier) = seeded(&line);

    let err = verifier.verify("bastion", 22, &key(2)).unwrap_err();
    assert!(matches!(err, LedgerError::HostKeyMismatch { .. }));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), line);

    assert_eq!(verifier.verify("bastion", 22, &key(1)).unwrap(), Verification::Trusted);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), line);
}

#[test]
fn test_wildcard_entry_is_enforced() {
    let contents = format!("*.corp.example,!vault.corp.example ssh-ed25519 {KEY1_B64}\n");
    let (_dir, path, verifier) = seeded(&contents);

    let err = verifier.verify("jump.corp.example", 22, &key(2)).unwrap_err();
    assert!(matches!(err, LedgerError::HostKeyMismatch { .. }));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);

    assert_eq!(
        verifier.verify("jump.corp.example", 22, &key(1)).unwrap(),
        Verification::Trusted
    );

    // the negated host is not covered by the wildcard line
    assert_eq!(
        verifier.verify("vault.corp.example", 22, &key(2)).unwrap(),
        Verification::Learned
    );
}

#[test]
fn test_any_key_on_file_for_the_host_is_trusted() {
    let rsa_b64 = "CQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJ";
    let contents = format!("bastion ssh-rsa {rsa_b64}\nbastion ssh-ed25519 {KEY1_B64}\n");
    let (_dir, path, verifier) = seeded(&contents);

    assert_eq!(verifier.verify("bastion", 22, &key(1)).unwrap(), Verification::Trusted);
    assert_eq!(Ledger::new(&path).lookup_all("bastion").unwrap().len(), 2);

    // none of the host's keys match: refused, reported against the same key type
    match verifier.verify("bastion", 22, &key(2)).unwrap_err() {
        LedgerError::HostKeyMismatch { expected, .. } => {
            assert!(expected.starts_with("ssh-ed25519 SHA256:"))
        }
        other => panic!("expected HostKeyMismatch, got {other:?}"),
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);
}
