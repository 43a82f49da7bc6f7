use bastion_types::{url_scheme, DbEngine};
use serde::Serialize;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use std::net::SocketAddr;

use crate::forward::LocalForward;
use crate::registry::DialRegistry;
use crate::TunnelError;

#[derive(Debug, Serialize)]
pub struct SqlQueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Pieces of a `scheme://[userinfo@]host[:port][/rest]` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbUrl {
    pub scheme: String,
    pub userinfo: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Path and query, including the leading `/` or `?`.
    pub rest: String,
}

impl DbUrl {
    pub fn parse(url: &str) -> Result<Self, TunnelError> {
        let invalid = || TunnelError::InvalidUrl(redact(url));

        let scheme = url_scheme(url).ok_or_else(invalid)?;
        let remainder = &url[scheme.len() + 3..];

        let authority_end = remainder.find(['/', '?']).unwrap_or(remainder.len());
        let (authority, rest) = remainder.split_at(authority_end);

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, authority),
        };

        let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
            let (host, after) = v6.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| invalid())?),
                None if after.is_empty() => None,
                None => return Err(invalid()),
            };
            (host.to_string(), port)
        } else {
            match hostport.split_once(':') {
                Some((host, p)) => (host.to_string(), Some(p.parse::<u16>().map_err(|_| invalid())?)),
                None => (hostport.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            userinfo,
            host,
            port,
            rest: rest.to_string(),
        })
    }

    /// `host:port` to dial from the bastion.
    pub fn target(&self, engine: DbEngine) -> String {
        let port = self.port.unwrap_or(engine.default_port());
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }

    /// Same URL with the engine's plain scheme, pointed at `local`.
    pub fn rewrite(&self, engine: DbEngine, local: SocketAddr) -> String {
        let userinfo = self
            .userinfo
            .as_deref()
            .map(|u| format!("{u}@"))
            .unwrap_or_default();
        format!("{}://{userinfo}{local}{}", engine.url_scheme(), self.rest)
    }
}

/// Strip credentials from a URL before it goes into an error or a log line.
fn redact(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{scheme}://***{}", &url[at..]),
        _ => url.to_string(),
    }
}

/// A pool whose connections are tunneled through a registered adapter.
pub struct TunneledPool {
    pub pool: AnyPool,
    pub engine: DbEngine,
    forward: LocalForward,
}

impl TunneledPool {
    /// Loopback address the driver actually connects to.
    pub fn local_addr(&self) -> SocketAddr {
        self.forward.local_addr()
    }

    pub async fn close(self) {
        self.pool.close().await;
        self.forward.shutdown();
    }
}

/// Open a pool for `url`, whose scheme must be a registered tunnel
/// identifier (e.g. `postgres+ssh://app:pw@db.internal:5432/app`).
pub async fn connect(registry: &DialRegistry, url: &str) -> Result<TunneledPool, TunnelError> {
    let parsed = DbUrl::parse(url)?;
    let dialer = registry
        .resolve(&parsed.scheme)
        .ok_or_else(|| TunnelError::NotRegistered(parsed.scheme.clone()))?;
    let engine = dialer.engine();

    let target = parsed.target(engine);
    let forward = LocalForward::start(dialer, target.clone()).await?;
    let local_url = parsed.rewrite(engine, forward.local_addr());

    crate::install_sql_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&local_url)
        .await?;

    tracing::info!("Connected {engine} pool to {target} through {}", parsed.scheme);

    Ok(TunneledPool {
        pool,
        engine,
        forward,
    })
}

/// Decode column `idx` as the first JSON-representable type it accepts.
/// SQL NULL and anything undecodable become `null`.
fn column_json(row: &AnyRow, idx: usize) -> Value {
    fn decoded<'r, T>(row: &'r AnyRow, idx: usize) -> Option<Option<T>>
    where
        T: sqlx::Decode<'r, sqlx::Any> + sqlx::Type<sqlx::Any>,
    {
        row.try_get::<Option<T>, _>(idx).ok()
    }

    if let Some(v) = decoded::<bool>(row, idx) {
        return v.map_or(Value::Null, Value::Bool);
    }
    if let Some(v) = decoded::<i64>(row, idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Some(v) = decoded::<i32>(row, idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Some(v) = decoded::<f64>(row, idx) {
        return v.map_or(Value::Null, Value::from);
    }
    decoded::<String>(row, idx)
        .flatten()
        .map_or(Value::Null, Value::String)
}

/// Run one query and collect every row.
pub async fn query(pool: &AnyPool, sql: &str) -> Result<SqlQueryOutput, TunnelError> {
    let rows: Vec<AnyRow> = sqlx::query(sql).fetch_all(pool).await?;

    let columns: Vec<String> = if let Some(first) = rows.first() {
        first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    } else {
        vec![]
    };

    let rows = rows
        .iter()
        .map(|row| (0..columns.len()).map(|i| column_json(row, i)).collect())
        .collect();

    Ok(SqlQueryOutput { columns, rows })
}
