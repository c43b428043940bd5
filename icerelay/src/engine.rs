//! Diff-driven relay lifecycle and per-relay connection state machine.

use crate::error::{IceError, Result};
use crate::models::{Master, Relay};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

const MAX_REDIRECTS: u32 = 10;
const MAX_CONCURRENT_CONNECTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Startup,
    Connected,
    Terminating,
    Restart,
    Disabled,
    Dead,
}

struct RelaySlot {
    relay: Relay,
    state: RelayState,
}

/// A successfully opened upstream, ready to be handed off to a parser.
#[derive(Debug)]
pub struct ConnectedUpstream {
    pub final_url: String,
    pub response: reqwest::Response,
}

pub struct RelayEngine {
    client: reqwest::Client,
    slots: RwLock<HashMap<String, RelaySlot>>,
    connecting: std::sync::Arc<Semaphore>,
}

impl RelayEngine {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("relay http client builds with no TLS exotica");
        Self {
            client,
            slots: RwLock::new(HashMap::new()),
            connecting: std::sync::Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTS)),
        }
    }

    /// Applies a freshly polled candidate set: installs relays not already
    /// present (matched by `localmount`), marks fields that changed in a
    /// restart-worthy way via `new_details`, and flags relays absent from
    /// the candidate set for cleanup. Applying the same candidate set twice
    /// is a no-op the second time.
    pub async fn diff(&self, candidates: Vec<Relay>) {
        let mut slots = self.slots.write().await;
        let mut seen = HashSet::new();

        for candidate in candidates {
            seen.insert(candidate.localmount.clone());
            match slots.get_mut(&candidate.localmount) {
                Some(slot) => {
                    if slot.relay.differs_in_restart_worthy_fields(&candidate) {
                        slot.relay.new_details = Some(Box::new(candidate));
                    }
                }
                None => {
                    tracing::info!(localmount = %candidate.localmount, "installing relay");
                    slots.insert(
                        candidate.localmount.clone(),
                        RelaySlot {
                            relay: candidate,
                            state: RelayState::Init,
                        },
                    );
                }
            }
        }

        for (mount, slot) in slots.iter_mut() {
            if !seen.contains(mount) {
                tracing::info!(localmount = %mount, "relay dropped from master poll, marking for cleanup");
                slot.relay.cleanup = true;
                slot.relay.running = false;
            }
        }
    }

    pub async fn state_of(&self, localmount: &str) -> Option<RelayState> {
        self.slots.read().await.get(localmount).map(|s| s.state)
    }

    pub async fn relay_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Advances a relay sitting in `Init`, `Terminating`, `Restart` or
    /// `Disabled` by one tick. `Startup`/`Connected` transitions are driven
    /// by [`RelayEngine::start_relay`], since they require an actual
    /// connection attempt rather than a pure state fold.
    pub async fn tick(&self, localmount: &str) -> Option<RelayState> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(localmount)?;

        slot.state = match slot.state {
            RelayState::Init => {
                if !slot.relay.running {
                    RelayState::Disabled
                } else {
                    RelayState::Startup
                }
            }
            RelayState::Terminating => {
                if slot.relay.cleanup {
                    RelayState::Dead
                } else {
                    RelayState::Restart
                }
            }
            RelayState::Restart => {
                if let Some(new_details) = slot.relay.new_details.take() {
                    slot.relay = *new_details;
                }
                slot.relay.reset_all_skips();
                RelayState::Startup
            }
            RelayState::Disabled => {
                if slot.relay.running {
                    RelayState::Init
                } else {
                    RelayState::Disabled
                }
            }
            other => other,
        };
        Some(slot.state)
    }

    /// Marks a relay for teardown; picked up on its next scheduler visit.
    pub async fn mark_terminating(&self, localmount: &str) {
        if let Some(slot) = self.slots.write().await.get_mut(localmount) {
            slot.state = RelayState::Terminating;
        }
    }

    /// Attempts to open the relay's upstream connection, capped globally at
    /// [`MAX_CONCURRENT_CONNECTS`] concurrent attempts. Updates the stored
    /// relay's `in_use`/`skip` bits and transitions its state to `Connected`
    /// on success or `Restart` on exhaustion.
    pub async fn start_relay(&self, localmount: &str) -> Result<ConnectedUpstream> {
        let mut relay = {
            let mut slots = self.slots.write().await;
            let slot = slots
                .get_mut(localmount)
                .ok_or_else(|| IceError::other(format!("unknown relay {localmount}")))?;
            slot.state = RelayState::Startup;
            slot.relay.clone()
        };

        let permit = match self.connecting.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return Err(IceError::Transient("relay connect slots exhausted".into())),
        };
        let result = self.open_relay_connection(&mut relay).await;
        drop(permit);

        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(localmount)
            .ok_or_else(|| IceError::other(format!("relay {localmount} removed mid-connect")))?;
        slot.relay.masters = relay.masters;
        match result {
            Ok(upstream) => {
                slot.relay.in_use = relay.in_use;
                slot.state = RelayState::Connected;
                Ok(upstream)
            }
            Err(e) => {
                tracing::warn!(localmount, error = %e, "relay connect attempt failed, backing off");
                slot.state = RelayState::Restart;
                Err(e)
            }
        }
    }

    /// Mount names of every relay currently tracked, for the binary's
    /// per-relay driver loop.
    pub async fn localmounts(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    /// Iterates `relay.masters` skipping any already marked `skip`, opening
    /// each until one succeeds. Every exhausted master is left `skip`ped.
    pub async fn open_relay_connection(&self, relay: &mut Relay) -> Result<ConnectedUpstream> {
        let mut last_err = None;
        for idx in 0..relay.masters.len() {
            if relay.masters[idx].skip {
                continue;
            }
            match self.try_master(relay, idx).await {
                Ok(upstream) => {
                    relay.in_use = Some(idx);
                    return Ok(upstream);
                }
                Err(e) => {
                    relay.masters[idx].skip = true;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| IceError::upstream("no master candidates available")))
    }

    async fn try_master(&self, relay: &Relay, idx: usize) -> Result<ConnectedUpstream> {
        let mut url = master_url(&relay.masters[idx]);
        let timeout = Duration::from_secs(relay.masters[idx].timeout_secs);

        for _ in 0..MAX_REDIRECTS {
            let mut req = self
                .client
                .get(&url)
                .header(reqwest::header::USER_AGENT, "icebroadcastd-relay")
                .timeout(timeout);
            if relay.mp3metadata {
                req = req.header("Icy-MetaData", "1");
            }
            if let Some(creds) = &relay.credentials {
                req = req.basic_auth(&creds.username, Some(&creds.password));
            }

            let resp = req.send().await?;
            let status = resp.status();
            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| IceError::upstream("redirect with no Location header"))?
                    .to_string();
                url = location;
                continue;
            }
            if !status.is_success() {
                return Err(IceError::upstream(format!("master returned {status}")));
            }
            return Ok(ConnectedUpstream {
                final_url: url,
                response: resp,
            });
        }
        Err(IceError::RedirectLoop(MAX_REDIRECTS))
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn master_url(master: &Master) -> String {
    format!("http://{}:{}{}", master.ip, master.port, master.mount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host_port(uri: &str) -> (String, u16) {
        let url = url::Url::parse(uri).unwrap();
        (url.host_str().unwrap().to_string(), url.port().unwrap())
    }

    #[tokio::test]
    async fn diff_is_idempotent_when_candidates_unchanged() {
        let engine = RelayEngine::new();
        let candidates = vec![Relay::new("/a", vec![Master::new("m1", 8000, "/live")])];
        engine.diff(candidates.clone()).await;
        engine.diff(candidates).await;

        let slots = engine.slots.read().await;
        assert!(slots.get("/a").unwrap().relay.new_details.is_none());
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test]
    async fn config_diff_installs_new_details_without_duplicating() {
        // S5
        let engine = RelayEngine::new();
        engine
            .diff(vec![Relay::new("/a", vec![Master::new("m1", 8000, "/live")])])
            .await;
        engine
            .diff(vec![Relay::new("/a", vec![Master::new("m1", 8001, "/live")])])
            .await;

        let slots = engine.slots.read().await;
        assert_eq!(slots.len(), 1);
        let slot = slots.get("/a").unwrap();
        let new_details = slot.relay.new_details.as_ref().expect("restart-worthy diff");
        assert_eq!(new_details.masters[0].port, 8001);
    }

    #[tokio::test]
    async fn candidate_dropped_from_poll_is_marked_for_cleanup() {
        let engine = RelayEngine::new();
        engine
            .diff(vec![Relay::new("/a", vec![Master::new("m1", 8000, "/live")])])
            .await;
        engine.diff(vec![]).await;

        let slots = engine.slots.read().await;
        assert!(slots.get("/a").unwrap().relay.cleanup);
    }

    #[tokio::test]
    async fn redirect_chain_resolves_to_final_master() {
        // S3
        let master = MockServer::start().await;
        let peer = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/live"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", format!("{}/live", peer.uri())),
            )
            .mount(&master)
            .await;
        Mock::given(method("GET"))
            .and(path("/live"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4]))
            .mount(&peer)
            .await;

        let (host, port) = host_port(&master.uri());
        let engine = RelayEngine::new();
        let mut relay = Relay::new("/a", vec![Master::new(host, port, "/live")]);

        engine.open_relay_connection(&mut relay).await.unwrap();
        assert_eq!(relay.in_use, Some(0));
        assert!(!relay.masters[0].skip);
    }

    #[tokio::test]
    async fn redirect_loop_aborts_after_ten_hops_and_skips_master() {
        // S4, invariant 6
        let a = MockServer::start().await;
        let b = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", format!("{}/live", b.uri())),
            )
            .mount(&a)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", format!("{}/live", a.uri())),
            )
            .mount(&b)
            .await;

        let (host, port) = host_port(&a.uri());
        let engine = RelayEngine::new();
        let mut relay = Relay::new("/a", vec![Master::new(host, port, "/live")]);

        let err = engine.open_relay_connection(&mut relay).await.unwrap_err();
        assert!(matches!(err, IceError::RedirectLoop(10)));
        assert!(relay.masters[0].skip);
    }

    #[tokio::test]
    async fn connecting_cap_rejects_a_fourth_concurrent_attempt() {
        // invariant 7
        let engine = RelayEngine::new();
        let p1 = engine.connecting.clone().try_acquire_owned().unwrap();
        let p2 = engine.connecting.clone().try_acquire_owned().unwrap();
        let p3 = engine.connecting.clone().try_acquire_owned().unwrap();
        assert!(engine.connecting.clone().try_acquire_owned().is_err());
        drop((p1, p2, p3));
        assert!(engine.connecting.clone().try_acquire_owned().is_ok());
    }

    #[tokio::test]
    async fn init_tick_moves_running_relay_to_startup() {
        let engine = RelayEngine::new();
        engine
            .diff(vec![Relay::new("/a", vec![Master::new("m1", 8000, "/live")])])
            .await;
        assert_eq!(engine.tick("/a").await, Some(RelayState::Startup));
    }

    #[tokio::test]
    async fn restart_tick_clears_skip_bits_and_applies_pending_details() {
        let engine = RelayEngine::new();
        engine
            .diff(vec![Relay::new("/a", vec![Master::new("m1", 8000, "/live")])])
            .await;
        engine
            .diff(vec![Relay::new("/a", vec![Master::new("m1", 8001, "/live")])])
            .await;
        {
            let mut slots = engine.slots.write().await;
            let slot = slots.get_mut("/a").unwrap();
            slot.relay.masters[0].skip = true;
            slot.state = RelayState::Restart;
        }
        assert_eq!(engine.tick("/a").await, Some(RelayState::Startup));
        let slots = engine.slots.read().await;
        let relay = &slots.get("/a").unwrap().relay;
        assert_eq!(relay.masters[0].port, 8001);
        assert!(!relay.masters[0].skip);
    }
}
