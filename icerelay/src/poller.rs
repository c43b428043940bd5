//! Periodic fetch of the mount list from a master peer, and its
//! header/body streaming parser.

use crate::error::{IceError, Result};
use crate::models::{Master, Relay};
use futures_util::StreamExt;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub ssl_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub send_auth: bool,
    pub update_interval_secs: u64,
    pub relay_on_demand: bool,
}

pub struct MasterPoller {
    client: reqwest::Client,
    config: MasterConfig,
}

impl MasterPoller {
    pub fn new(client: reqwest::Client, config: MasterConfig) -> Self {
        Self { client, config }
    }

    /// One poll cycle: try `/admin/streams`, falling back to
    /// `/admin/streamlist.txt` once on failure.
    pub async fn poll_once(&self) -> Result<Vec<Relay>> {
        match self.fetch_mount_list("/admin/streams").await {
            Ok(mounts) => Ok(self.mounts_to_relays(mounts)),
            Err(e) => {
                tracing::warn!(master = %self.config.host, error = %e, "falling back to streamlist.txt");
                let mounts = self.fetch_mount_list("/admin/streamlist.txt").await?;
                Ok(self.mounts_to_relays(mounts))
            }
        }
    }

    async fn fetch_mount_list(&self, path: &str) -> Result<Vec<String>> {
        let scheme = if self.config.ssl_port.is_some() {
            "https"
        } else {
            "http"
        };
        let port = self.config.ssl_port.unwrap_or(self.config.port);
        let url = format!("{scheme}://{}:{port}{path}", self.config.host);

        let mut req = self.client.get(&url);
        if let (true, Some(user), Some(pass)) =
            (self.config.send_auth, &self.config.username, &self.config.password)
        {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(IceError::upstream(format!(
                "{path} returned {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut acc = LineAccumulator::new();
        let mut mounts = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in acc.feed(&chunk) {
                if let Some(m) = accept_mount_line(&line) {
                    mounts.push(m);
                }
            }
        }
        if let Some(line) = acc.finish() {
            if let Some(m) = accept_mount_line(&line) {
                mounts.push(m);
            }
        }
        Ok(mounts)
    }

    fn mounts_to_relays(&self, mounts: Vec<String>) -> Vec<Relay> {
        mounts.iter().map(|m| self.mount_to_relay(m)).collect()
    }

    fn mount_to_relay(&self, line: &str) -> Relay {
        let (remote_mount, localmount) = parse_mount_line(line);
        let mut master = Master::new(self.config.host.clone(), self.config.port, remote_mount);
        master.timeout_secs = 4;

        let mut relay = Relay::new(localmount, vec![master]);
        relay.mp3metadata = true;
        relay.on_demand = self.config.relay_on_demand;
        if self.config.send_auth {
            if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
                relay.credentials = Some(crate::models::RelayCredentials {
                    username: user.clone(),
                    password: pass.clone(),
                });
            }
        }
        relay
    }
}

/// Splits a streaming body into lines, buffering a partial tail across
/// chunks (capped so a malformed, newline-free body can't grow unbounded).
pub struct LineAccumulator {
    tail: Vec<u8>,
}

impl LineAccumulator {
    const MAX_TAIL: usize = 200;

    pub fn new() -> Self {
        Self { tail: Vec::new() }
    }

    /// Feeds one chunk of body bytes, returning whichever lines it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut buf = std::mem::take(&mut self.tail);
        buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for i in 0..buf.len() {
            if buf[i] == b'\n' {
                let line = String::from_utf8_lossy(&buf[start..i])
                    .trim_end_matches('\r')
                    .to_string();
                lines.push(line);
                start = i + 1;
            }
        }
        let mut tail = buf[start..].to_vec();
        tail.truncate(Self::MAX_TAIL);
        self.tail = tail;
        lines
    }

    /// Call once the body is exhausted to flush any unterminated final line.
    pub fn finish(&mut self) -> Option<String> {
        if self.tail.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&std::mem::take(&mut self.tail)).to_string())
        }
    }
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn accept_mount_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.starts_with('/') {
        Some(line.to_string())
    } else {
        None
    }
}

/// `/admin/streams?mount=/X` lines carry the published mount in a query
/// parameter rather than as the path itself; everything else is its own
/// localmount.
fn parse_mount_line(line: &str) -> (String, String) {
    if let Some(query_start) = line.find('?') {
        let path = &line[..query_start];
        let query = &line[query_start + 1..];
        if path == "/admin/streams" {
            if let Some(mount) = query.split('&').find_map(|kv| kv.strip_prefix("mount=")) {
                return (mount.to_string(), mount.to_string());
            }
        }
    }
    (line.to_string(), line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_line_across_chunks_is_reassembled() {
        // S6
        let mut acc = LineAccumulator::new();
        let mut lines = acc.feed(b"/one\n/t");
        assert_eq!(lines, vec!["/one".to_string()]);
        lines = acc.feed(b"wo\n/three\n");
        assert_eq!(lines, vec!["/two".to_string(), "/three".to_string()]);
        assert_eq!(acc.finish(), None);
    }

    #[test]
    fn tail_cap_is_enforced() {
        let mut acc = LineAccumulator::new();
        let long_tail = vec![b'x'; 500];
        acc.feed(&long_tail);
        assert!(acc.tail.len() <= LineAccumulator::MAX_TAIL);
    }

    #[test]
    fn non_slash_lines_are_rejected() {
        assert_eq!(accept_mount_line("hello"), None);
        assert_eq!(accept_mount_line("/live"), Some("/live".to_string()));
    }

    #[test]
    fn mount_query_override_sets_localmount() {
        let (mount, localmount) = parse_mount_line("/admin/streams?mount=/x");
        assert_eq!(mount, "/x");
        assert_eq!(localmount, "/x");
    }
}
