//! Loopback listener that splices plain TCP sockets onto tunneled dials.
//!
//! Drivers that only know how to open a socket to `host:port` are pointed
//! at the listener; every connection they open becomes one SSH channel.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::dial::Dialer;
use crate::TunnelError;

pub struct LocalForward {
    local_addr: SocketAddr,
    target: String,
    task: JoinHandle<()>,
}

impl LocalForward {
    /// Bind `127.0.0.1:0` and forward each accepted socket to `target`
    /// through `dialer`.
    pub async fn start(
        dialer: Arc<dyn Dialer>,
        target: impl Into<String>,
    ) -> Result<Self, TunnelError> {
        let target = target.into();
        let bind = "127.0.0.1:0";
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TunnelError::Network {
                addr: bind.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| TunnelError::Network {
            addr: bind.to_string(),
            source: e,
        })?;

        tracing::debug!("Forwarding {local_addr} -> {target}");
        let task = tokio::spawn(accept_loop(listener, dialer, target.clone()));

        Ok(Self {
            local_addr,
            target,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stop accepting. Connections already forwarded run until either side
    /// closes.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, dialer: Arc<dyn Dialer>, target: String) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Local forward accept failed: {e}");
                continue;
            }
        };

        tokio::spawn(forward_one(socket, peer, Arc::clone(&dialer), target.clone()));
    }
}

async fn forward_one(mut socket: TcpStream, peer: SocketAddr, dialer: Arc<dyn Dialer>, target: String) {
    let mut remote = match dialer.dial(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("Dropping forwarded connection from {peer} to {target}: {e}");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut socket, &mut remote).await {
        Ok((up, down)) => {
            tracing::debug!("Forward {peer} -> {target} done ({up} bytes up, {down} bytes down)")
        }
        Err(e) => tracing::debug!("Forward {peer} -> {target} ended: {e}"),
    }
}
