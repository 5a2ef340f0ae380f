//! HTTP server service: binds the Axum app and runs it in a background task.
//!
//! [start](Service::start) binds and spawns the server, [stop](Service::stop)
//! triggers graceful shutdown and waits for in-flight requests and for
//! sweeps started over HTTP to finish.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::{AppState, build_app};
use crate::services::manager::{Service, ServiceHealth};

pub struct HttpServerService {
    state: AppState,
    /// Address actually bound; differs from the configured one when port 0 is used
    local_addr: RwLock<Option<SocketAddr>>,
    /// Set in start(), taken in stop()
    join_handle: RwLock<Option<JoinHandle<()>>>,
    shutdown: RwLock<Option<CancellationToken>>,
}

impl HttpServerService {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            local_addr: RwLock::new(None),
            join_handle: RwLock::new(None),
            shutdown: RwLock::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.state.config.host, self.state.config.port)
    }
}

#[async_trait]
impl Service for HttpServerService {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> Result<()> {
        if self.join_handle.read().is_some() {
            return Ok(());
        }

        let addr = self.bind_addr();
        let listener = tokio::net::TcpListener::bind(addr.as_str())
            .await
            .with_context(|| format!("HTTP server: bind {addr} failed"))?;
        let local_addr = listener.local_addr().context("HTTP server: no local address")?;

        self.state.sweeps.reopen();
        let app = build_app(self.state.clone());
        // Child of the process token so Ctrl-C also drains the server
        let shutdown = self.state.shutdown.child_token();
        let signal = shutdown.clone();
        let join = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(service = "http", error = %e, "HTTP server exited with error");
            }
        });

        *self.local_addr.write() = Some(local_addr);
        *self.join_handle.write() = Some(join);
        *self.shutdown.write() = Some(shutdown);

        info!(service = "http", "Listening on http://{}", local_addr);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let token = self.shutdown.write().take();
        let handle = self.join_handle.write().take();
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(h) = handle {
            h.await.context("HTTP server task panicked")?;
        }

        // Sweeps started over HTTP finish their in-flight upstream call first
        let sweeps = &self.state.sweeps;
        sweeps.close();
        if !sweeps.is_empty() {
            info!(service = "http", sweeps = sweeps.len(), "Waiting for manual sweeps to finish");
        }
        sweeps.wait().await;
        *self.local_addr.write() = None;
        info!(service = "http", "HTTP server stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        match self.join_handle.read().as_ref() {
            Some(h) if !h.is_finished() => Ok(ServiceHealth::healthy()),
            Some(_) => Ok(ServiceHealth::unhealthy("server task exited")),
            None => Ok(ServiceHealth::unhealthy("server task not running")),
        }
    }
}
