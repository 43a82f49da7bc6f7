pub mod dial;
pub mod forward;
pub mod registry;
pub mod session;
pub mod sql;
pub mod tunnel;

pub use dial::{Connection, Dialer, MySqlDialer, PgDialer};
pub use registry::DialRegistry;
pub use session::SshSession;
pub use tunnel::Tunnel;

use bastion_ledger::LedgerError;
use bastion_types::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

// ── Errors ───────────────────────────────────────────────────────

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    KeyParse,
    Network,
    Authentication,
    HostKeyMismatch,
    Ledger,
    Channel,
    Database,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid database URL '{0}'")]
    InvalidUrl(String),

    #[error("no dial adapter registered under '{0}'")]
    NotRegistered(String),

    #[error("failed to load private key {}: {message}", path.display())]
    KeyParse { path: PathBuf, message: String },

    #[error("failed to connect to {addr}: {source}")]
    Network {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("ssh authentication rejected for user '{user}' ({method})")]
    Authentication { user: String, method: &'static str },

    #[error(
        "HOST KEY MISMATCH for {host}: the ledger trusts {expected} but the server presented {presented}. \
         Refusing to connect; remove the stale entry by hand only if the key change is expected."
    )]
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },

    #[error("host-key ledger error: {0}")]
    Ledger(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("ssh session closed")]
    SessionClosed,

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::InvalidUrl(_) | Self::NotRegistered(_) => {
                ErrorKind::Configuration
            }
            Self::KeyParse { .. } => ErrorKind::KeyParse,
            Self::Network { .. } | Self::Timeout { .. } | Self::Ssh(_) => ErrorKind::Network,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::HostKeyMismatch { .. } => ErrorKind::HostKeyMismatch,
            Self::Ledger(_) => ErrorKind::Ledger,
            Self::Channel(_) | Self::SessionClosed => ErrorKind::Channel,
            Self::Sql(_) => ErrorKind::Database,
        }
    }

    /// True only for host-key mismatches, which must never be ignored.
    pub fn is_security_critical(&self) -> bool {
        self.kind() == ErrorKind::HostKeyMismatch
    }
}

impl From<LedgerError> for TunnelError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::HostKeyMismatch {
                host,
                expected,
                presented,
            } => Self::HostKeyMismatch {
                host,
                expected,
                presented,
            },
            LedgerError::Io(msg) => Self::Ledger(msg),
        }
    }
}

/// Install sqlx any-pool drivers. Safe to call more than once.
pub fn install_sql_drivers() {
    sqlx::any::install_default_drivers();
}
