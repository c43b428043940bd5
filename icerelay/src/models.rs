//! Relay, master candidate, and redirect-peer records.

use std::time::Instant;

/// One candidate upstream a relay can pull from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Master {
    pub ip: String,
    pub port: u16,
    pub mount: String,
    pub bind: Option<String>,
    pub timeout_secs: u64,
    /// Set for the rest of this attempt cycle once this master has failed;
    /// cleared when a long successful run ends or on the next config diff.
    pub skip: bool,
}

impl Master {
    pub fn new(ip: impl Into<String>, port: u16, mount: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            mount: mount.into(),
            bind: None,
            timeout_secs: 4,
            skip: false,
        }
    }

    pub fn matches_endpoint(&self, other: &Master) -> bool {
        self.ip == other.ip && self.port == other.port && self.mount == other.mount
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub username: String,
    pub password: String,
}

/// A local mount populated by pulling from a remote peer.
#[derive(Debug, Clone)]
pub struct Relay {
    pub localmount: String,
    /// Candidate upstreams in priority order; always non-empty.
    pub masters: Vec<Master>,
    pub credentials: Option<RelayCredentials>,
    pub mp3metadata: bool,
    pub on_demand: bool,
    pub interval_secs: u64,
    pub running: bool,
    pub cleanup: bool,
    /// Index into `masters` of the one currently in use, if connected.
    pub in_use: Option<usize>,
    /// Replacement record installed by a config-diff pass; picked up on the
    /// relay's next scheduler visit.
    pub new_details: Option<Box<Relay>>,
    pub last_error: Option<String>,
}

impl Relay {
    pub fn new(localmount: impl Into<String>, masters: Vec<Master>) -> Self {
        assert!(!masters.is_empty(), "a relay needs at least one master");
        Self {
            localmount: localmount.into(),
            masters,
            credentials: None,
            mp3metadata: true,
            on_demand: false,
            interval_secs: 5,
            running: true,
            cleanup: false,
            in_use: None,
            new_details: None,
            last_error: None,
        }
    }

    /// Compares `masters` element-wise (mount, ip, port) plus `mp3metadata`,
    /// the fields a config diff treats as restart-worthy.
    pub fn differs_in_restart_worthy_fields(&self, candidate: &Relay) -> bool {
        if self.mp3metadata != candidate.mp3metadata {
            return true;
        }
        if self.masters.len() != candidate.masters.len() {
            return true;
        }
        self.masters
            .iter()
            .zip(candidate.masters.iter())
            .any(|(a, b)| !a.matches_endpoint(b))
    }

    pub fn reset_all_skips(&mut self) {
        for master in &mut self.masters {
            master.skip = false;
        }
    }

    pub fn current_master(&self) -> Option<&Master> {
        self.in_use.and_then(|idx| self.masters.get(idx))
    }
}

/// A peer slave that has asked to be considered for redirect fallback.
#[derive(Debug, Clone)]
pub struct RedirectHost {
    pub server: String,
    pub port: u16,
    pub next_update: Instant,
}

impl RedirectHost {
    /// A host is expired once `next_update + 10s` has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.next_update).as_secs() > 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn restart_worthy_diff_detects_port_change() {
        let old = Relay::new("/a", vec![Master::new("m1", 8000, "/live")]);
        let new = Relay::new("/a", vec![Master::new("m1", 8001, "/live")]);
        assert!(old.differs_in_restart_worthy_fields(&new));
    }

    #[test]
    fn identical_masters_do_not_differ() {
        let old = Relay::new("/a", vec![Master::new("m1", 8000, "/live")]);
        let new = Relay::new("/a", vec![Master::new("m1", 8000, "/live")]);
        assert!(!old.differs_in_restart_worthy_fields(&new));
    }

    #[test]
    fn redirect_host_expires_after_ten_seconds_past_next_update() {
        let host = RedirectHost {
            server: "peer".into(),
            port: 9000,
            next_update: Instant::now() - Duration::from_secs(11),
        };
        assert!(host.is_expired(Instant::now()));
    }
}
