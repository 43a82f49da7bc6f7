use bastion_types::{DbEngine, TunnelConfig};
use std::sync::Arc;

use crate::dial::Dialer;
use crate::registry::{self, DialRegistry};
use crate::session::SshSession;
use crate::TunnelError;

/// An established session plus its registered dial adapter.
pub struct Tunnel {
    session: SshSession,
    engine: DbEngine,
    identifier: &'static str,
    adapter: Arc<dyn Dialer>,
    registry: DialRegistry,
}

impl Tunnel {
    /// Validate `config`, open the SSH session, then register the engine's
    /// dial adapter in `registry`.
    pub async fn open(config: &TunnelConfig, registry: &DialRegistry) -> Result<Self, TunnelError> {
        let (_, engine) = config.validate()?;
        let session = SshSession::establish(config).await?;
        let (identifier, adapter) = registry::bind(registry, &session, engine);

        Ok(Self {
            session,
            engine,
            identifier,
            adapter,
            registry: registry.clone(),
        })
    }

    pub fn session(&self) -> &SshSession {
        &self.session
    }

    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    /// Identifier the adapter is registered under.
    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::clone(&self.adapter)
    }

    /// Drop the registry binding (unless a newer tunnel owns it) and close
    /// the session.
    pub async fn close(&self) {
        self.registry.unregister_if(self.identifier, &self.adapter);
        self.session.close().await;
    }
}
