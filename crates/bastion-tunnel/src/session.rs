use bastion_ledger::{HostKeyVerifier, Ledger, LedgerError};
use bastion_types::{AuthMethod, ConfigError, PublicHostKey, TunnelConfig};
use russh::client::Handle;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::dial::Connection;
use crate::TunnelError;

// ── Handshake handler ────────────────────────────────────────────

pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    /// Verification failure, kept so it can be reported even when the
    /// handshake task only surfaces a generic disconnect.
    rejection: Arc<Mutex<Option<LedgerError>>>,
}

#[async_trait::async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = PublicHostKey::new(
            server_public_key.name(),
            server_public_key.public_key_bytes(),
        );

        // The ledger takes a blocking file lock; keep it off the runtime workers
        let verifier = self.verifier.clone();
        let (host, port) = (self.host.clone(), self.port);
        let verified = tokio::task::spawn_blocking(move || verifier.verify(&host, port, &presented))
            .await
            .map_err(|e| TunnelError::Ledger(format!("host-key verification task failed: {e}")))?;

        match verified {
            Ok(_) => Ok(true),
            Err(e) => {
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(e.clone());
                }
                Err(e.into())
            }
        }
    }
}

enum Credential {
    Password(SecretString),
    Key(Arc<KeyPair>),
}

/// Read and decode the configured credential. Key files are parsed before
/// any network I/O so a bad key or passphrase fails fast.
fn load_credential(auth: AuthMethod) -> Result<Credential, TunnelError> {
    match auth {
        AuthMethod::Password(password) => Ok(Credential::Password(password)),
        AuthMethod::PrivateKey { path, passphrase } => {
            let passphrase = passphrase.as_ref().map(|p| p.expose_secret().as_str());
            let key_pair = russh_keys::load_secret_key(&path, passphrase).map_err(|e| {
                TunnelError::KeyParse {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?;
            Ok(Credential::Key(Arc::new(key_pair)))
        }
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    credential: Credential,
) -> Result<(), TunnelError> {
    let (accepted, method) = match credential {
        Credential::Password(password) => (
            handle
                .authenticate_password(user, password.expose_secret())
                .await?,
            "password",
        ),
        Credential::Key(key_pair) => (
            handle.authenticate_publickey(user, key_pair).await?,
            "publickey",
        ),
    };

    if !accepted {
        return Err(TunnelError::Authentication {
            user: user.to_string(),
            method,
        });
    }
    Ok(())
}

async fn with_timeout<T>(
    secs: u64,
    what: impl FnOnce() -> String,
    fut: impl Future<Output = T>,
) -> Result<T, TunnelError> {
    if secs == 0 {
        return Ok(fut.await);
    }
    let after = Duration::from_secs(secs);
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TunnelError::Timeout {
            what: what(),
            after,
        })
}

// ── Session ──────────────────────────────────────────────────────

/// One authenticated SSH transport to a bastion host.
///
/// Channels opened through the session live no longer than it does. Once
/// closed a session stays closed.
pub struct SshSession {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    handle: Handle<ClientHandler>,
    closed: watch::Sender<bool>,
    remote: String,
}

impl SshSession {
    /// Authenticate and open a session from `config`.
    ///
    /// Configuration and key problems are reported before any socket is
    /// opened. The host key is checked against the ledger during the
    /// handshake.
    pub async fn establish(config: &TunnelConfig) -> Result<Self, TunnelError> {
        if config.ssh_user.trim().is_empty() {
            return Err(ConfigError::MissingField("ssh_user").into());
        }
        if config.ssh_host.trim().is_empty() {
            return Err(ConfigError::MissingField("ssh_host").into());
        }
        let auth = config.auth_method()?;

        let ledger = config
            .ledger_path
            .clone()
            .map(Ledger::new)
            .unwrap_or_else(Ledger::with_defaults);
        let verifier = HostKeyVerifier::new(ledger);

        let credential = load_credential(auth)?;

        let remote = config.ssh_address();
        let stream = with_timeout(
            config.connect_timeout_secs,
            || format!("tcp connect to {remote}"),
            TcpStream::connect((config.ssh_host.as_str(), config.ssh_port)),
        )
        .await?
        .map_err(|e| TunnelError::Network {
            addr: remote.clone(),
            source: e,
        })?;

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: config.ssh_host.clone(),
            port: config.ssh_port,
            verifier,
            rejection: Arc::clone(&rejection),
        };

        let ssh_config = Arc::new(russh::client::Config {
            keepalive_interval: (config.keepalive_secs > 0)
                .then(|| Duration::from_secs(config.keepalive_secs)),
            ..Default::default()
        });

        let handshake = async {
            let mut handle = russh::client::connect_stream(ssh_config, stream, handler).await?;
            authenticate(&mut handle, &config.ssh_user, credential).await?;
            Ok::<_, TunnelError>(handle)
        };

        let handle = match handshake.await {
            Ok(handle) => handle,
            Err(e) => {
                let rejected = rejection.lock().ok().and_then(|mut slot| slot.take());
                return Err(rejected.map(TunnelError::from).unwrap_or(e));
            }
        };

        tracing::info!("SSH session established to {remote} as {}", config.ssh_user);

        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SessionInner {
                handle,
                closed,
                remote,
            }),
        })
    }

    /// `host:port` of the bastion.
    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Open a `direct-tcpip` channel to `host:port` as seen from the bastion.
    pub async fn open_channel(&self, host: &str, port: u16) -> Result<Connection, TunnelError> {
        self.inner.open_direct(host, port).await
    }

    /// Disconnect. Every channel opened through the session ends with it and
    /// dials still waiting for a channel fail with `SessionClosed`.
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        tracing::info!("Closing SSH session to {}", self.inner.remote);
        if let Err(e) = self
            .inner
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("SSH disconnect from {} failed: {e}", self.inner.remote);
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.handle.is_closed()
    }

    pub(crate) async fn open_direct(&self, host: &str, port: u16) -> Result<Connection, TunnelError> {
        let mut closed = self.closed.subscribe();
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        tokio::select! {
            opened = self.handle.channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0) => {
                match opened {
                    Ok(channel) => {
                        tracing::debug!("Opened channel to {host}:{port} via {}", self.remote);
                        Ok(Box::new(channel.into_stream()) as Connection)
                    }
                    Err(_) if self.is_closed() => Err(TunnelError::SessionClosed),
                    Err(e) => Err(TunnelError::Channel(format!(
                        "failed to open channel to {host}:{port} via {}: {e}",
                        self.remote
                    ))),
                }
            }
            _ = closed.wait_for(|c| *c) => Err(TunnelError::SessionClosed),
        }
    }
}
