//! Registry of peer slaves that have asked to receive redirect traffic for
//! mounts this server doesn't have.

use crate::models::RedirectHost;
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct RedirectRegistry {
    hosts: RwLock<HashMap<(String, u16), RedirectHost>>,
}

impl RedirectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a touch from a peer slave, refreshing its `next_update`.
    pub async fn touch(&self, server: String, port: u16, interval_secs: u64) {
        let mut hosts = self.hosts.write().await;
        hosts.insert(
            (server.clone(), port),
            RedirectHost {
                server,
                port,
                next_update: Instant::now() + Duration::from_secs(interval_secs),
            },
        );
    }

    /// Drops any host whose `next_update + 10s` has passed.
    pub async fn gc_expired(&self) {
        let now = Instant::now();
        self.hosts.write().await.retain(|_, h| !h.is_expired(now));
    }

    /// Picks a random live redirect target for a missing mount, if any.
    pub async fn pick_random(&self) -> Option<RedirectHost> {
        self.gc_expired().await;
        let hosts = self.hosts.read().await;
        hosts.values().collect::<Vec<_>>().choose(&mut rand::thread_rng()).cloned().cloned()
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_then_gc_keeps_fresh_entries() {
        let reg = RedirectRegistry::new();
        reg.touch("peer".into(), 9000, 30).await;
        reg.gc_expired().await;
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_gc_d() {
        let reg = RedirectRegistry::new();
        reg.hosts.write().await.insert(
            ("peer".into(), 9000),
            RedirectHost {
                server: "peer".into(),
                port: 9000,
                next_update: Instant::now() - Duration::from_secs(20),
            },
        );
        reg.gc_expired().await;
        assert_eq!(reg.len().await, 0);
    }
}
