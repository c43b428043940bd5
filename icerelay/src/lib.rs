//! Relay and master-poll subsystem for an Icecast-family broadcaster.
//!
//! A relay is a local mount populated by pulling from a remote peer rather
//! than receiving a pushed source stream. [`engine::RelayEngine`] owns the
//! diff-driven lifecycle of relay entries and the per-relay connection
//! state machine; [`poller::MasterPoller`] periodically fetches a mount
//! list from a master peer to feed that diff; [`redirect::RedirectRegistry`]
//! tracks peer slaves that should receive 302s for mounts this server
//! doesn't carry.

pub mod engine;
pub mod error;
pub mod models;
pub mod poller;
pub mod redirect;

pub use engine::{ConnectedUpstream, RelayEngine, RelayState};
pub use error::{IceError, Result};
pub use models::{Master, RedirectHost, Relay, RelayCredentials};
pub use poller::{MasterConfig, MasterPoller};
pub use redirect::RedirectRegistry;
