//! Admin HTTP surface: the mount-list producer a peer's `MasterPoller`
//! consumes, a JSON now-playing snapshot for dashboards, and the redirect
//! peer touch that rides along with the mount list request.

use crate::mounts::MountRegistry;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use icerelay::RedirectRegistry;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    pub mounts: MountRegistry,
    pub redirects: Arc<RedirectRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct StreamsQuery {
    rserver: Option<String>,
    rport: Option<u16>,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    30
}

/// `GET /admin/streams[?rserver=&rport=&interval=]` -- the line-oriented
/// mount list a `MasterPoller` on another server polls. A caller supplying
/// `rserver`/`rport` is upserted into the redirect registry first, so it
/// starts receiving redirects for mounts this server doesn't carry.
pub async fn streams(
    State(state): State<AdminState>,
    Query(q): Query<StreamsQuery>,
) -> impl IntoResponse {
    if let (Some(server), Some(port)) = (q.rserver, q.rport) {
        state.redirects.touch(server, port, q.interval).await;
    }

    let mut names = state.mounts.mount_names().await;
    names.sort();
    names.join("\n")
}

#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    mount: String,
}

/// `GET /admin/metadata?mount=/x` -- current now-playing snapshot as JSON.
pub async fn metadata(
    State(state): State<AdminState>,
    Query(q): Query<MetadataQuery>,
) -> impl IntoResponse {
    let mount = if q.mount.starts_with('/') {
        q.mount
    } else {
        format!("/{}", q.mount)
    };

    match state.mounts.get(&mount).await {
        Some(handle) => Json(handle.now_playing().await).into_response(),
        None => (axum::http::StatusCode::NOT_FOUND, "unknown mount").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::MountConfig;

    #[tokio::test]
    async fn streams_lists_sorted_mount_names() {
        let mounts = MountRegistry::new();
        mounts.declare("/b", &MountConfig::default()).await;
        mounts.declare("/a", &MountConfig::default()).await;
        let state = AdminState {
            mounts,
            redirects: Arc::new(RedirectRegistry::new()),
        };

        let body = streams(
            State(state),
            Query(StreamsQuery {
                rserver: None,
                rport: None,
                interval: 30,
            }),
        )
        .await
        .into_response();
        let bytes = axum::body::to_bytes(body.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"/a\n/b");
    }

    #[tokio::test]
    async fn streams_with_rserver_touches_the_redirect_registry() {
        let mounts = MountRegistry::new();
        let redirects = Arc::new(RedirectRegistry::new());
        let state = AdminState {
            mounts,
            redirects: redirects.clone(),
        };

        streams(
            State(state),
            Query(StreamsQuery {
                rserver: Some("peer.example".into()),
                rport: Some(9001),
                interval: 30,
            }),
        )
        .await;

        assert_eq!(redirects.len().await, 1);
    }

    #[tokio::test]
    async fn metadata_for_an_unknown_mount_is_404() {
        let state = AdminState {
            mounts: MountRegistry::new(),
            redirects: Arc::new(RedirectRegistry::new()),
        };
        let resp = metadata(State(state), Query(MetadataQuery { mount: "/x".into() }))
            .await
            .into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
