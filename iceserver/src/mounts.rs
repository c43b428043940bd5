//! Per-mount registry plus the listener GET / source PUT routes that sit on
//! top of it.
//!
//! One [`MountHandle`] lives per configured mount point: it owns the
//! `icecore::ring` fan-out channel listeners subscribe to and the
//! [`Mp3State`] that the single active source (or relay) ingests through.
//! The HTTP layer here only moves bytes -- framing, metadata insertion and
//! frame-sync validation are all `icecore`'s job.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use icecore::{
    ring::{self, RecvError},
    Codec, Framing, IceError, ListenerSender, Mp3State, UpdateMetadata,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Per-mount tunables, sourced from mount configuration at registry
/// construction time.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub codec: Codec,
    pub inline_metadata_interval: usize,
    pub icy_interval: usize,
    pub max_unsynced_bytes: usize,
    pub ring_capacity: usize,
    /// Charset this mount's inline ICY metadata arrives in. Defaults to
    /// [`UpdateMetadata::ConvertFromCharset`] (legacy ISO8859-1 sources);
    /// set to [`UpdateMetadata::AlreadyUtf8`] for sources known to send
    /// UTF-8 tags already.
    pub source_charset: UpdateMetadata,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Mp3,
            inline_metadata_interval: 0,
            icy_interval: 16000,
            max_unsynced_bytes: icecore::MAX_UNSYNCED_BYTES,
            ring_capacity: 64,
            source_charset: UpdateMetadata::ConvertFromCharset,
        }
    }
}

pub struct MountHandle {
    pub name: String,
    sender: ring::Sender,
    ingest: RwLock<Mp3State>,
    icy_interval: usize,
    source_connected: AtomicBool,
    listener_count: AtomicUsize,
}

impl MountHandle {
    fn new(name: String, config: &MountConfig) -> Self {
        let (sender, _rx) = ring::channel(config.ring_capacity);
        Self {
            name,
            sender,
            ingest: RwLock::new(
                Mp3State::new(config.codec, config.inline_metadata_interval, config.icy_interval)
                    .with_max_unsynced_bytes(config.max_unsynced_bytes)
                    .with_source_charset(config.source_charset),
            ),
            icy_interval: config.icy_interval,
            source_connected: AtomicBool::new(false),
            listener_count: AtomicUsize::new(0),
        }
    }

    pub async fn now_playing(&self) -> MountSnapshot {
        let ingest = self.ingest.read().await;
        MountSnapshot {
            mount: self.name.clone(),
            title: ingest.url_title.clone(),
            artist: ingest.url_artist.clone(),
            url: ingest.url.clone(),
            listeners: self.listener_count.load(Ordering::Relaxed),
            source_connected: self.source_connected.load(Ordering::Relaxed),
        }
    }

    fn claim_source(&self) -> bool {
        self.source_connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn release_source(&self) {
        self.source_connected.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MountSnapshot {
    pub mount: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub url: Option<String>,
    pub listeners: usize,
    pub source_connected: bool,
}

/// Registry of every mount this process carries, shared as Axum state.
#[derive(Clone)]
pub struct MountRegistry {
    mounts: Arc<RwLock<HashMap<String, Arc<MountHandle>>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Declares a mount ahead of any source connecting to it. Idempotent --
    /// re-declaring an existing mount is a no-op.
    pub async fn declare(&self, name: &str, config: &MountConfig) -> Arc<MountHandle> {
        let mut mounts = self.mounts.write().await;
        mounts
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MountHandle::new(name.to_string(), config)))
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<MountHandle>> {
        self.mounts.read().await.get(name).cloned()
    }

    /// Mount names this server currently carries, for `/admin/streams`.
    pub async fn mount_names(&self) -> Vec<String> {
        self.mounts.read().await.keys().cloned().collect()
    }

    pub async fn snapshots(&self) -> Vec<MountSnapshot> {
        let mounts = self.mounts.read().await.clone();
        let mut out = Vec::with_capacity(mounts.len());
        for handle in mounts.values() {
            out.push(handle.now_playing().await);
        }
        out
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `PUT`/`SOURCE /{mount}` -- ingests an upstream byte stream and fans
/// decoded payload blocks out to every subscribed listener.
pub async fn source_ingest(
    State(registry): State<MountRegistry>,
    Path(mount): Path<String>,
    body: Body,
) -> Response {
    let mount = normalize_mount(&mount);
    let Some(handle) = registry.get(&mount).await else {
        return (StatusCode::NOT_FOUND, "unknown mount").into_response();
    };

    if !handle.claim_source() {
        return (StatusCode::FORBIDDEN, "mount already has an active source").into_response();
    }

    info!(mount = %handle.name, "source connected");
    let mut stream = body.into_data_stream();
    let result = ingest_loop(&handle, &mut stream).await;
    handle.release_source();

    match result {
        Ok(()) => {
            info!(mount = %handle.name, "source disconnected");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            warn!(mount = %handle.name, error = %e, "source ingest failed");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

/// Feeds a relay's upstream response body into this mount exactly like a
/// pushed source would, enforcing the same single-active-source rule.
/// Used by the relay driver in `icebroadcastd`, which owns the upstream
/// connection itself.
impl MountHandle {
    pub async fn ingest_relay_stream<S, E>(&self, mut stream: S) -> Result<(), IceError>
    where
        S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        if !self.claim_source() {
            return Err(IceError::ResourceExhaustion(format!(
                "mount {} already has an active source",
                self.name
            )));
        }
        let result = ingest_loop(self, &mut stream).await;
        self.release_source();
        result
    }
}

async fn ingest_loop<S, E>(
    handle: &MountHandle,
    stream: &mut S,
) -> Result<(), IceError>
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| IceError::Transient(e.to_string()))?;
        let blocks = {
            let mut ingest = handle.ingest.write().await;
            ingest.ingest(&chunk)?
        };
        for block in blocks {
            handle.sender.send(block).await;
        }
    }
    Ok(())
}

/// `GET /{mount}` -- subscribes a listener and streams framed payload
/// blocks until the source disconnects or the listener goes away.
pub async fn listener_get(
    State(registry): State<MountRegistry>,
    Path(mount): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mount = normalize_mount(&mount);
    let Some(handle) = registry.get(&mount).await else {
        return (StatusCode::NOT_FOUND, "unknown mount").into_response();
    };

    let wants_iceblocks = headers.contains_key("iceblocks");
    // A zero interval has no well-formed ICY framing, so a misconfigured
    // mount (icy_interval: 0) falls back to raw rather than advertising a
    // metaint it cannot actually honor.
    let wants_icy = handle.icy_interval > 0
        && headers
            .get("icy-metadata")
            .map(|v| v == "1")
            .unwrap_or(false);

    let mut extra_headers: Vec<(header::HeaderName, HeaderValue)> = vec![
        (
            header::EXPIRES,
            HeaderValue::from_static("Mon, 26 Jul 1997 05:00:00 GMT"),
        ),
        (header::PRAGMA, HeaderValue::from_static("no-cache")),
    ];
    if is_flash_or_msie(&headers) {
        extra_headers.push((
            header::CONTENT_LENGTH,
            HeaderValue::from_static("221183499"),
        ));
    }

    let framing = if wants_iceblocks {
        extra_headers.push((
            header::HeaderName::from_static("iceblocks"),
            HeaderValue::from_static("1.1"),
        ));
        Framing::IceBlock
    } else if wants_icy {
        extra_headers.push((
            header::HeaderName::from_static("icy-metaint"),
            HeaderValue::from_str(&handle.icy_interval.to_string()).unwrap(),
        ));
        Framing::Icy {
            interval: handle.icy_interval,
        }
    } else {
        Framing::Raw
    };

    handle.listener_count.fetch_add(1, Ordering::AcqRel);
    let receiver = handle.sender.subscribe();
    let handle_for_stream = handle.clone();

    let body_stream = async_stream::stream! {
        let mut sender = ListenerSender::new(framing);
        loop {
            match receiver.recv().await {
                Ok(block) => yield Ok::<_, std::io::Error>(sender.emit(&block)),
                Err(RecvError::Lagged(n)) => {
                    warn!(mount = %handle_for_stream.name, skipped = n, "listener lagged, resuming");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
        handle_for_stream.listener_count.fetch_sub(1, Ordering::AcqRel);
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::OK;
    for (name, value) in extra_headers {
        response.headers_mut().insert(name, value);
    }
    response
}

fn is_flash_or_msie(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.contains("MSIE") || ua.contains("Flash"))
        .unwrap_or(false)
}

fn normalize_mount(raw: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{raw}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn declaring_the_same_mount_twice_reuses_the_handle() {
        let registry = MountRegistry::new();
        let cfg = MountConfig::default();
        let a = registry.declare("/live", &cfg).await;
        let b = registry.declare("/live", &cfg).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn a_second_source_is_rejected_while_one_is_active() {
        let handle = MountHandle::new("/live".into(), &MountConfig::default());
        assert!(handle.claim_source());
        assert!(!handle.claim_source());
        handle.release_source();
        assert!(handle.claim_source());
    }

    #[tokio::test]
    async fn ingest_loop_fans_blocks_out_to_a_subscriber() {
        let handle = MountHandle::new("/live".into(), &MountConfig::default());
        let rx = handle.sender.subscribe();

        let frame = {
            let mut f = vec![0xFFu8, 0b1111_1010, 0b1001_0000, 0b1100_0000];
            f.resize(417, 0xAA);
            f
        };
        let stream = futures_util::stream::iter(vec![Ok::<_, axum::Error>(Bytes::from(frame.clone()))]);
        let mut stream = Box::pin(stream);
        ingest_loop(&handle, &mut stream).await.unwrap();

        let block = rx.recv().await.unwrap();
        assert_eq!(block.data.as_ref(), frame.as_slice());
    }

    #[tokio::test]
    async fn mount_names_lists_every_declared_mount() {
        let registry = MountRegistry::new();
        registry.declare("/a", &MountConfig::default()).await;
        registry.declare("/b", &MountConfig::default()).await;
        let mut names = registry.mount_names().await;
        names.sort();
        assert_eq!(names, vec!["/a".to_string(), "/b".to_string()]);
    }

    #[tokio::test]
    async fn zero_icy_interval_mount_ignores_icy_metadata_request() {
        let registry = MountRegistry::new();
        registry
            .declare(
                "/live",
                &MountConfig {
                    icy_interval: 0,
                    ..MountConfig::default()
                },
            )
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("icy-metadata", HeaderValue::from_static("1"));
        let response = listener_get(
            State(registry),
            Path("/live".to_string()),
            headers,
        )
        .await;
        assert!(!response.headers().contains_key("icy-metaint"));
    }
}
