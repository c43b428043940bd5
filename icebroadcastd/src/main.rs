use iceconfig::get_config;
use icerelay::{MasterConfig, MasterPoller, RedirectRegistry, RelayEngine, RelayState};
use iceserver::logs::LoggingOptions;
use iceserver::{build_router, MountConfig, MountRegistry, ServerBuilder};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1: configuration and logging ==========
    let config = get_config();
    let mut server = ServerBuilder::new_configured().build();
    server
        .init_logging(LoggingOptions {
            buffer_capacity: config.get_log_cache_size().unwrap_or(1000),
            enable_console: config.get_log_enable_console().unwrap_or(true),
            min_level: config.get_log_min_level().unwrap_or_else(|_| "info".to_string()),
        })
        .await;

    // ========== PHASE 2: mounts ==========
    let mounts = MountRegistry::new();
    for name in config.get_mount_names() {
        let icy_interval = config.get_mount_icy_interval(&name);
        mounts
            .declare(
                &name,
                &MountConfig {
                    icy_interval,
                    ..MountConfig::default()
                },
            )
            .await;
        info!(mount = %name, icy_interval, "declared mount from config");
    }

    // ========== PHASE 3: relay subsystem ==========
    let engine = Arc::new(RelayEngine::new());
    let redirects = Arc::new(RedirectRegistry::new());

    if let Some(settings) = config.get_master_poll_settings() {
        info!(host = %settings.host, port = settings.port, "running as relay/slave of master");
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("relay http client builds with no TLS exotica");
        let poller = MasterPoller::new(
            client,
            MasterConfig {
                host: settings.host,
                port: settings.port,
                ssl_port: settings.ssl_port,
                username: settings.username,
                password: settings.password,
                send_auth: settings.send_auth,
                update_interval_secs: config
                    .get_master_update_interval_secs()
                    .unwrap_or(10) as u64,
                relay_on_demand: config.get_relay_on_demand().unwrap_or(false),
            },
        );
        let poll_interval =
            Duration::from_secs(config.get_master_update_interval_secs().unwrap_or(10) as u64);
        let poll_engine = engine.clone();
        tokio::spawn(async move { run_master_poll(poller, poll_engine, poll_interval).await });
    }

    let supervise_engine = engine.clone();
    let supervise_mounts = mounts.clone();
    tokio::spawn(async move { supervise_relays(supervise_engine, supervise_mounts).await });

    // ========== PHASE 4: HTTP server ==========
    server
        .add_router("/", build_router(mounts, redirects))
        .await;

    info!("starting icebroadcastd");
    server.start().await;
    server.wait().await;
    info!("icebroadcastd stopped");

    Ok(())
}

/// Polls the configured master on a fixed interval, feeding each cycle's
/// mount list into the relay engine's diff.
async fn run_master_poll(poller: MasterPoller, engine: Arc<RelayEngine>, interval: Duration) {
    loop {
        match poller.poll_once().await {
            Ok(relays) => engine.diff(relays).await,
            Err(e) => warn!(error = %e, "master poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Watches the relay engine for newly-diffed relays and spawns one driver
/// task per relay the first time it is seen.
async fn supervise_relays(engine: Arc<RelayEngine>, mounts: MountRegistry) {
    let mut spawned = HashSet::new();
    loop {
        for localmount in engine.localmounts().await {
            if spawned.insert(localmount.clone()) {
                let engine = engine.clone();
                let mounts = mounts.clone();
                tokio::spawn(async move { drive_relay(engine, mounts, localmount).await });
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Drives one relay's connection state machine for the lifetime of the
/// process: Init/Terminating/Restart/Disabled are pure state folds ticked
/// here, while Startup performs the actual upstream connect and, on
/// success, blocks streaming the response body into the local mount until
/// the connection drops.
async fn drive_relay(engine: Arc<RelayEngine>, mounts: MountRegistry, localmount: String) {
    loop {
        let state = match engine.state_of(&localmount).await {
            Some(s) => s,
            None => return,
        };

        match state {
            RelayState::Dead => return,
            RelayState::Disabled => {
                engine.tick(&localmount).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            RelayState::Init | RelayState::Terminating | RelayState::Restart => {
                engine.tick(&localmount).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            RelayState::Connected => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            RelayState::Startup => match engine.start_relay(&localmount).await {
                Ok(upstream) => {
                    info!(localmount = %localmount, url = %upstream.final_url, "relay connected");
                    let handle = mounts.declare(&localmount, &MountConfig::default()).await;
                    let byte_stream = upstream.response.bytes_stream();
                    if let Err(e) = handle.ingest_relay_stream(byte_stream).await {
                        warn!(localmount = %localmount, error = %e, "relay ingest ended");
                    }
                    engine.mark_terminating(&localmount).await;
                }
                Err(e) => {
                    warn!(localmount = %localmount, error = %e, "relay connect failed");
                    engine.mark_terminating(&localmount).await;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },
        }
    }
}
