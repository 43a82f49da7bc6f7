use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Database Engine ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbEngine {
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    Mysql,
}

impl DbEngine {
    /// Identifier under which the engine's dial adapter is registered.
    pub fn tunnel_identifier(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres+ssh",
            Self::Mysql => "mysql+tcp",
        }
    }

    /// Plain URL scheme understood by the engine's wire-protocol driver.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
        }
    }

    /// Map a URL scheme (plain or tunnel identifier) to an engine.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "postgres+ssh" => Some(Self::Postgres),
            "mysql" | "mariadb" | "mysql+tcp" => Some(Self::Mysql),
            _ => None,
        }
    }
}

impl std::fmt::Display for DbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Mysql => write!(f, "mysql"),
        }
    }
}

/// Extract the scheme of a `scheme://...` URL.
pub fn url_scheme(url: &str) -> Option<&str> {
    url.split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|s| !s.is_empty())
}

// ── Auth Method ──────────────────────────────────────────────────

/// The single credential used to authenticate against the bastion.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password(SecretString),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

// ── Configuration Errors ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no SSH authentication method configured (set a password or a private key path)")]
    NoAuthMethod,

    #[error("ambiguous SSH authentication: both a password and a private key path are set")]
    AmbiguousAuthMethod,

    #[error("a key passphrase was given without a private key path")]
    PassphraseWithoutKey,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("cannot determine database engine from URL '{0}'")]
    UnknownEngine(String),
}

// ── Tunnel Configuration ─────────────────────────────────────────
//
// Password and key path arrive as independent optional fields (that is
// how a config file spells them). `auth_method()` resolves them into the
// tagged `AuthMethod` and rejects anything but exactly one.

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub ssh_user: String,
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<SecretString>,
    /// Explicit engine. Takes precedence over the scheme of `db_url`.
    #[serde(default)]
    pub db_engine: Option<DbEngine>,
    pub db_url: String,
    /// Host-key ledger. Defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// SSH keepalive interval; 0 disables keepalives.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_secs() -> u64 {
    30
}

impl TunnelConfig {
    /// A config with no credential set; add one with `with_password` or
    /// `with_private_key`.
    pub fn new(
        ssh_user: impl Into<String>,
        ssh_host: impl Into<String>,
        db_url: impl Into<String>,
    ) -> Self {
        Self {
            ssh_user: ssh_user.into(),
            ssh_host: ssh_host.into(),
            ssh_port: default_ssh_port(),
            password: None,
            private_key_path: None,
            passphrase: None,
            db_engine: None,
            db_url: db_url.into(),
            ledger_path: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>, passphrase: Option<&str>) -> Self {
        self.private_key_path = Some(path.into());
        self.passphrase = passphrase.map(|p| SecretString::new(p.to_string()));
        self
    }

    pub fn with_engine(mut self, engine: DbEngine) -> Self {
        self.db_engine = Some(engine);
        self
    }

    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// `host:port` of the bastion.
    pub fn ssh_address(&self) -> String {
        if self.ssh_host.contains(':') {
            format!("[{}]:{}", self.ssh_host, self.ssh_port)
        } else {
            format!("{}:{}", self.ssh_host, self.ssh_port)
        }
    }

    /// Resolve the configured credential. Exactly one of password and
    /// private key must be present.
    pub fn auth_method(&self) -> Result<AuthMethod, ConfigError> {
        match (&self.password, &self.private_key_path) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousAuthMethod),
            (None, None) if self.passphrase.is_some() => Err(ConfigError::PassphraseWithoutKey),
            (None, None) => Err(ConfigError::NoAuthMethod),
            (Some(_), None) if self.passphrase.is_some() => Err(ConfigError::PassphraseWithoutKey),
            (Some(password), None) => Ok(AuthMethod::Password(password.clone())),
            (None, Some(path)) => Ok(AuthMethod::PrivateKey {
                path: path.clone(),
                passphrase: self.passphrase.clone(),
            }),
        }
    }

    /// Resolve the database engine: the explicit `db_engine` wins, otherwise
    /// the scheme of `db_url` decides.
    pub fn resolve_engine(&self) -> Result<DbEngine, ConfigError> {
        if let Some(engine) = self.db_engine {
            return Ok(engine);
        }
        url_scheme(&self.db_url)
            .and_then(DbEngine::from_scheme)
            .ok_or_else(|| ConfigError::UnknownEngine(self.db_url.clone()))
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(AuthMethod, DbEngine), ConfigError> {
        if self.ssh_user.trim().is_empty() {
            return Err(ConfigError::MissingField("ssh_user"));
        }
        if self.ssh_host.trim().is_empty() {
            return Err(ConfigError::MissingField("ssh_host"));
        }
        let auth = self.auth_method()?;
        let engine = self.resolve_engine()?;
        Ok((auth, engine))
    }
}

// ── Host Keys ────────────────────────────────────────────────────

/// A public host key as presented by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHostKey {
    /// Algorithm token, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// SSH wire-format public key blob.
    pub public_key: Vec<u8>,
}

impl PublicHostKey {
    pub fn new(key_type: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            key_type: key_type.into(),
            public_key,
        }
    }
}

/// One trusted entry of the host-key ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyRecord {
    /// Normalized host pattern (`host` or `[host]:port`).
    pub host_pattern: String,
    pub key_type: String,
    pub public_key: Vec<u8>,
}

impl HostKeyRecord {
    pub fn new(host_pattern: impl Into<String>, key: &PublicHostKey) -> Self {
        Self {
            host_pattern: host_pattern.into(),
            key_type: key.key_type.clone(),
            public_key: key.public_key.clone(),
        }
    }

    /// True if the record holds exactly this key.
    pub fn matches(&self, key: &PublicHostKey) -> bool {
        self.key_type == key.key_type && self.public_key == key.public_key
    }

    pub fn host_key(&self) -> PublicHostKey {
        PublicHostKey::new(self.key_type.clone(), self.public_key.clone())
    }
}
