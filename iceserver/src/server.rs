//! High-level builder over an Axum router: named routes, shared state, and
//! graceful shutdown on Ctrl+C.

use crate::logs::{init_logging, log_dump, log_sse, LogState, LoggingOptions};
use axum::handler::Handler;
use axum::routing::get;
use axum::Router;
use iceconfig::get_config;
use iceutils::{find_process_using_port, list_all_ips, TransportProtocol};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{signal, sync::RwLock, task::JoinHandle};
use tracing::{error, info};

#[derive(Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

pub struct Server {
    name: String,
    base_url: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
    log_state: Option<LogState>,
}

impl Server {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
            log_state: None,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self::new("icebroadcastd", config.get_base_url(), config.get_http_port())
    }

    /// Merges `route` into the app router: an absolute `path` merges at root,
    /// anything else nests under it.
    pub async fn add_router(&mut self, path: &str, route: Router) {
        let mut r = self.router.write().await;
        let current = std::mem::take(&mut *r);

        *r = if path.starts_with('/') {
            tracing::debug!(path, "merging router at root");
            current.merge(route)
        } else {
            let normalized = format!("/{}", path.trim_start_matches('/'));
            tracing::debug!(path = %normalized, "nesting router");
            current.nest(&normalized, route)
        };
    }

    pub async fn add_handler<H, T>(&mut self, path: &str, handler: H)
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let route = Router::new().route("/", get(handler));
        let mut r = self.router.write().await;
        *r = std::mem::take(&mut *r).nest(path, route);
    }

    pub async fn add_handler_with_state<H, T, S>(&mut self, path: &str, handler: H, state: S)
    where
        H: Handler<T, S>,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        let route = Router::new().route("/", get(handler)).with_state(state);
        let mut r = self.router.write().await;
        *r = std::mem::take(&mut *r).nest(path, route);
    }

    /// Sets up tracing (env filter + optional console + SSE tail) and wires
    /// `/admin/logs` and `/admin/logs/dump`.
    pub async fn init_logging(&mut self, options: LoggingOptions) {
        let log_state = init_logging(options);
        self.add_handler_with_state("/admin/logs", log_sse, log_state.clone())
            .await;
        self.add_handler_with_state("/admin/logs/dump", log_dump, log_state.clone())
            .await;
        self.log_state = Some(log_state);
    }

    pub async fn start(&mut self) {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        info!(name = %self.name, base_url = %self.base_url, port = self.http_port, "starting server");
        for (iface, addrs) in list_all_ips() {
            info!(interface = %iface, addresses = ?addrs, "listener will be reachable on this interface");
        }

        let router = self.router.clone();
        let port = self.http_port;
        let server_task = tokio::spawn(async move {
            let r = router.read().await.clone();
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    if let Some(owner) = find_process_using_port(port, TransportProtocol::Tcp) {
                        error!(
                            port,
                            pid = owner.pid,
                            process = %owner.process_name,
                            user = %owner.owner,
                            "failed to bind http port, already held by another process"
                        );
                    }
                    panic!("bind the configured http port {port}: {e}");
                }
            };
            axum::serve(listener, r.into_make_service())
                .await
                .expect("axum server loop");
        });

        let shutdown_task = tokio::spawn(async move {
            signal::ctrl_c().await.expect("listen for ctrl_c");
            info!("ctrl-c received, shutting down");
        });

        self.join_handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = server_task => {},
                _ = shutdown_task => {},
            }
        }));
    }

    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            http_port: self.http_port,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }
}

pub struct ServerBuilder {
    name: String,
    base_url: String,
    http_port: u16,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self {
            name: "icebroadcastd".to_string(),
            base_url: config.get_base_url(),
            http_port: config.get_http_port(),
        }
    }

    pub fn build(self) -> Server {
        Server::new(self.name, self.base_url, self.http_port)
    }
}
