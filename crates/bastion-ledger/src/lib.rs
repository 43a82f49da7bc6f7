pub mod host;
pub mod storage;
pub mod verifier;

pub use verifier::{HostKeyVerifier, Verification};

use bastion_types::{HostKeyRecord, PublicHostKey};
use fd_lock::RwLock;
use std::path::{Path, PathBuf};

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error(
        "HOST KEY MISMATCH for {host}: the ledger trusts {expected} but the server presented {presented}. \
         Someone could be impersonating the host, or its key was rotated. Refusing to connect."
    )]
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },
}

// ── Ledger (file-backed handle) ──────────────────────────────────

/// Result of a locked lookup-or-append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// No entry existed; the presented key was appended.
    Learned,
    /// One of the host's entries holds the presented key.
    Matched,
    /// The host has entries but none holds the presented key. Nothing was
    /// written.
    Mismatched(HostKeyRecord),
}

/// Handle to a known_hosts-style ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger at the default path (~/.ssh/known_hosts).
    pub fn with_defaults() -> Self {
        Self::new(storage::default_ledger_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// All parseable records, in file order.
    pub fn load(&self) -> Result<Vec<HostKeyRecord>, LedgerError> {
        storage::load_records(&self.path)
    }

    /// First record whose host field names `host_pattern`.
    pub fn lookup(&self, host_pattern: &str) -> Result<Option<HostKeyRecord>, LedgerError> {
        Ok(self.lookup_all(host_pattern)?.into_iter().next())
    }

    /// Every record for `host_pattern`, in file order. A host may carry one
    /// line per key type.
    pub fn lookup_all(&self, host_pattern: &str) -> Result<Vec<HostKeyRecord>, LedgerError> {
        Ok(records_for(self.load()?, host_pattern))
    }

    /// Append a record. Does not check for an existing entry.
    pub fn append(&self, record: &HostKeyRecord) -> Result<(), LedgerError> {
        storage::append_record(&self.path, record)
    }

    /// Look up `host_pattern` and append `presented` if it is unknown, all
    /// under one exclusive lock so no reader sees a half-written line and no
    /// two learners race to append.
    pub fn check_or_learn(
        &self,
        host_pattern: &str,
        presented: &PublicHostKey,
    ) -> Result<LedgerOutcome, LedgerError> {
        let file = storage::open_for_append(&self.path)?;
        let mut lock = RwLock::new(file);
        let mut guard = lock
            .write()
            .map_err(|e| LedgerError::Io(format!("failed to acquire write lock: {e}")))?;

        let known = records_for(storage::read_locked(&mut guard)?, host_pattern);
        if known.iter().any(|r| r.matches(presented)) {
            return Ok(LedgerOutcome::Matched);
        }

        // Report the entry of the presented key's type when there is one
        let expected = known
            .iter()
            .position(|r| r.key_type == presented.key_type)
            .unwrap_or(0);
        match known.into_iter().nth(expected) {
            Some(record) => Ok(LedgerOutcome::Mismatched(record)),
            None => {
                storage::append_locked(&mut guard, &HostKeyRecord::new(host_pattern, presented))?;
                Ok(LedgerOutcome::Learned)
            }
        }
    }
}

fn records_for(records: Vec<HostKeyRecord>, host_pattern: &str) -> Vec<HostKeyRecord> {
    records
        .into_iter()
        .filter(|r| storage::pattern_matches(&r.host_pattern, host_pattern))
        .collect()
}
