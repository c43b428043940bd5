//! Axum HTTP front door for an Icecast-family broadcaster.
//!
//! [`server::Server`]/[`server::ServerBuilder`] give a thin, ergonomic
//! layer over `axum::Router` (named routes, shared state, graceful
//! shutdown). [`mounts`] owns the per-mount ingest/fan-out state and the
//! listener GET / source PUT routes built on top of it. [`admin`] exposes
//! the mount-list and now-playing admin surface. [`logs`] wires structured
//! logging into an SSE-tailable ring buffer.

pub mod admin;
pub mod logs;
pub mod mounts;
pub mod server;

pub use admin::AdminState;
pub use logs::{LogState, LoggingOptions, SseLayer};
pub use mounts::{MountConfig, MountHandle, MountRegistry, MountSnapshot};
pub use server::{Server, ServerBuilder, ServerInfo};

use axum::routing::get;
use axum::Router;
use icerelay::RedirectRegistry;
use std::sync::Arc;

/// Builds the router mounting every listener/source/admin route this
/// process serves, given a populated [`MountRegistry`].
pub fn build_router(mounts: MountRegistry, redirects: Arc<RedirectRegistry>) -> Router {
    let admin_state = AdminState {
        mounts: mounts.clone(),
        redirects,
    };

    let mount_routes = Router::new()
        .route(
            "/{*mount}",
            get(mounts::listener_get).put(mounts::source_ingest),
        )
        .with_state(mounts);

    let admin_routes = Router::new()
        .route("/admin/streams", get(admin::streams))
        .route("/admin/metadata", get(admin::metadata))
        .with_state(admin_state);

    Router::new().merge(admin_routes).merge(mount_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::MountConfig;

    #[tokio::test]
    async fn build_router_serves_admin_streams() {
        let mounts = MountRegistry::new();
        mounts.declare("/live", &MountConfig::default()).await;
        let router = build_router(mounts, Arc::new(RedirectRegistry::new()));

        let response = tower::ServiceExt::oneshot(
            router,
            axum::http::Request::builder()
                .uri("/admin/streams")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
