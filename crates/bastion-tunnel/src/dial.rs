//! Dial adapters: "connect to host:port" routed through an SSH session.
//!
//! Adapters hold a weak reference to their session. They never keep it
//! alive, and a dial after the session is closed or dropped fails with
//! `SessionClosed`.

use bastion_types::DbEngine;
use std::sync::Weak;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::session::{SessionInner, SshSession};
use crate::TunnelError;

/// Byte stream returned by a dial.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// One tunneled connection (one SSH channel).
pub type Connection = Box<dyn TunnelIo>;

/// The dial contract wire-protocol drivers consume.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection to `address` (`host:port` or `[v6]:port`).
    async fn dial(&self, address: &str) -> Result<Connection, TunnelError>;

    /// Engine whose wire protocol this adapter serves.
    fn engine(&self) -> DbEngine;
}

/// Split `host:port` / `[v6]:port`.
pub fn parse_address(address: &str) -> Result<(String, u16), TunnelError> {
    let invalid = || TunnelError::Channel(format!("invalid dial address '{address}'"));

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

async fn dial_through(
    session: &Weak<SessionInner>,
    address: &str,
) -> Result<Connection, TunnelError> {
    let (host, port) = parse_address(address)?;
    let inner = session.upgrade().ok_or(TunnelError::SessionClosed)?;
    inner.open_direct(&host, port).await
}

// ── Postgres-style ───────────────────────────────────────────────

/// Dial adapter for the Postgres wire protocol: `dial` plus `dial_timeout`.
#[derive(Clone)]
pub struct PgDialer {
    session: Weak<SessionInner>,
}

impl PgDialer {
    pub fn new(session: &SshSession) -> Self {
        Self {
            session: session.downgrade(),
        }
    }

    /// Like `dial`, but gives up on channel establishment after `timeout`.
    /// The deadline does not apply to I/O on the returned connection.
    pub async fn dial_timeout(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Connection, TunnelError> {
        tokio::time::timeout(timeout, dial_through(&self.session, address))
            .await
            .map_err(|_| TunnelError::Timeout {
                what: format!("dial {address}"),
                after: timeout,
            })?
    }
}

#[async_trait::async_trait]
impl Dialer for PgDialer {
    async fn dial(&self, address: &str) -> Result<Connection, TunnelError> {
        dial_through(&self.session, address).await
    }

    fn engine(&self) -> DbEngine {
        DbEngine::Postgres
    }
}

// ── MySQL-style ──────────────────────────────────────────────────

/// Dial adapter for the MySQL wire protocol (single-argument dial).
#[derive(Clone)]
pub struct MySqlDialer {
    session: Weak<SessionInner>,
}

impl MySqlDialer {
    pub fn new(session: &SshSession) -> Self {
        Self {
            session: session.downgrade(),
        }
    }
}

#[async_trait::async_trait]
impl Dialer for MySqlDialer {
    async fn dial(&self, address: &str) -> Result<Connection, TunnelError> {
        dial_through(&self.session, address).await
    }

    fn engine(&self) -> DbEngine {
        DbEngine::Mysql
    }
}
