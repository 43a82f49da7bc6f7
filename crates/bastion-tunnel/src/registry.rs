use bastion_types::DbEngine;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::dial::{Dialer, MySqlDialer, PgDialer};
use crate::session::SshSession;

/// Maps driver-visible identifiers (`postgres+ssh`, `mysql+tcp`) to dial
/// adapters.
///
/// Owned by the application and handed to whatever opens connections.
/// Registering an identifier that is already bound replaces the binding:
/// the most recent tunnel wins.
#[derive(Clone, Default)]
pub struct DialRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Dialer>>>>,
}

impl DialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identifier` to `dialer`, returning the adapter it replaced.
    pub fn register(
        &self,
        identifier: impl Into<String>,
        dialer: Arc<dyn Dialer>,
    ) -> Option<Arc<dyn Dialer>> {
        let identifier = identifier.into();
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let previous = map.insert(identifier.clone(), dialer);
        if previous.is_some() {
            tracing::debug!("Replaced dial adapter registered as {identifier}");
        }
        previous
    }

    pub fn resolve(&self, identifier: &str) -> Option<Arc<dyn Dialer>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(identifier).cloned()
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.resolve(identifier).is_some()
    }

    pub fn unregister(&self, identifier: &str) -> Option<Arc<dyn Dialer>> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(identifier)
    }

    /// Remove the binding only if it is still `dialer` (a later tunnel may
    /// have replaced it).
    pub fn unregister_if(&self, identifier: &str, dialer: &Arc<dyn Dialer>) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match map.get(identifier) {
            Some(current) if same_adapter(current, dialer) => {
                map.remove(identifier);
                true
            }
            _ => false,
        }
    }

    /// Registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn same_adapter(a: &Arc<dyn Dialer>, b: &Arc<dyn Dialer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Adapter serving `engine`'s wire protocol over `session`.
pub fn adapter_for(engine: DbEngine, session: &SshSession) -> Arc<dyn Dialer> {
    match engine {
        DbEngine::Postgres => Arc::new(PgDialer::new(session)),
        DbEngine::Mysql => Arc::new(MySqlDialer::new(session)),
    }
}

/// Register the adapter for `engine` over an established `session`.
/// Returns the identifier and the registered adapter.
pub fn bind(
    registry: &DialRegistry,
    session: &SshSession,
    engine: DbEngine,
) -> (&'static str, Arc<dyn Dialer>) {
    let identifier = engine.tunnel_identifier();
    let adapter = adapter_for(engine, session);
    registry.register(identifier, Arc::clone(&adapter));
    tracing::info!(
        "Registered {engine} dial adapter as {identifier} via {}",
        session.remote()
    );
    (identifier, adapter)
}
