//! Core MP3/ICY ingest and fan-out pipeline.
//!
//! One mount's data flow: upstream bytes go through [`mp3state::Mp3State`],
//! which strips inline ICY metadata and validates frame alignment via
//! [`mpegsync::MpegSync`], minting [`refbuf::RefBuf`] blocks tagged with the
//! mount's current [`refbuf::BroadcastMetadata`] (built by
//! [`icymeta::IcyMetaBuilder`]). Blocks are pushed onto a [`ring`] that fans
//! out to however many listeners are attached, each driven by its own
//! [`listener::ListenerSender`].

pub mod error;
pub mod icymeta;
pub mod listener;
pub mod mp3state;
pub mod mpegsync;
pub mod refbuf;
pub mod ring;
pub mod worker;

pub use error::IceError;
pub use icymeta::{IcyMetaBuilder, NowPlaying};
pub use listener::{Framing, ListenerSender};
pub use mp3state::{Codec, Mp3State, UpdateMetadata};
pub use mpegsync::{MpegSync, MAX_UNSYNCED_BYTES};
pub use refbuf::{BroadcastMetadata, RefBuf};
