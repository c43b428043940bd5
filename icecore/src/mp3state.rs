//! Per-mount ingest state: splits inline ICY metadata out of the upstream
//! byte stream, validates MPEG frame alignment, and mints fresh payload
//! blocks tagged with the mount's current broadcast metadata.

use crate::error::IceError;
use crate::icymeta::{self, IcyMetaBuilder, NowPlaying};
use crate::mpegsync::{MpegSync, MAX_UNSYNCED_BYTES};
use crate::refbuf::{BroadcastMetadata, RefBuf};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Mp3,
    Aac,
}

/// How inline ICY metadata bytes should be decoded into text before the
/// title/artist/url tokens are parsed out of them.
///
/// Tags set through [`Mp3State::set_tag`] never consult this -- callers
/// hand over Rust `String`s, which are UTF-8 by construction, so that path
/// is always the "already UTF-8" case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMetadata {
    /// No charset has been declared for this mount; treat inline bytes as
    /// already UTF-8 rather than guessing.
    None,
    /// Transcode inline bytes from the mount's declared legacy charset
    /// (ISO8859-1) before parsing.
    ConvertFromCharset,
    /// The source has declared its inline metadata is already UTF-8.
    AlreadyUtf8,
}

/// Per-mount ingest state. One instance lives for the lifetime of a source
/// or relay connection; mutated only by the task that owns that connection.
pub struct Mp3State {
    pub metadata: Arc<BroadcastMetadata>,
    pub url_title: Option<String>,
    pub url_artist: Option<String>,
    pub inline_url: Option<String>,
    pub url: Option<String>,
    /// Charset to assume for inline ICY metadata bytes; see
    /// [`UpdateMetadata`]. Defaults to [`UpdateMetadata::ConvertFromCharset`],
    /// matching this format's legacy ISO8859-1 default.
    pub update_metadata: UpdateMetadata,

    /// ICY metadata period advertised to listeners, in bytes.
    pub interval: usize,
    /// ICY metadata period the upstream announced for this ingest, or 0 if
    /// the upstream sends no inline metadata at all.
    pub inline_metadata_interval: usize,

    codec: Codec,
    sample_rate_hz: u32,
    channels: u8,
    bit_rate_kbps: u32,

    offset: usize,
    build_metadata: Vec<u8>,
    pending_meta_len: usize,

    read_data: Vec<u8>,
    sync: MpegSync,

    max_unsynced_bytes: usize,
}

impl Mp3State {
    pub fn new(codec: Codec, inline_metadata_interval: usize, interval: usize) -> Self {
        Self {
            metadata: BroadcastMetadata::blank(),
            url_title: None,
            url_artist: None,
            inline_url: None,
            url: None,
            update_metadata: UpdateMetadata::ConvertFromCharset,
            interval,
            inline_metadata_interval,
            codec,
            sample_rate_hz: 44100,
            channels: 2,
            bit_rate_kbps: 128,
            offset: 0,
            build_metadata: Vec::new(),
            pending_meta_len: 0,
            read_data: Vec::new(),
            sync: MpegSync::new(),
            max_unsynced_bytes: MAX_UNSYNCED_BYTES,
        }
    }

    pub fn with_max_unsynced_bytes(mut self, max: usize) -> Self {
        self.max_unsynced_bytes = max;
        self
    }

    /// Declares the charset this mount's inline ICY metadata arrives in.
    /// Does not affect [`Mp3State::set_tag`], which always receives
    /// already-decoded Rust strings.
    pub fn with_source_charset(mut self, charset: UpdateMetadata) -> Self {
        self.update_metadata = charset;
        self
    }

    /// Operator-driven tag update (as opposed to one parsed from an inline
    /// ICY block); publishes a fresh broadcast metadata triple immediately.
    pub fn set_tag(&mut self, title: Option<String>, artist: Option<String>, url: Option<String>) {
        self.publish_metadata(NowPlaying {
            title,
            artist,
            url,
        });
    }

    /// Ingests one chunk of upstream bytes, stripping inline ICY metadata if
    /// applicable and validating MPEG frame alignment. Returns zero or more
    /// ready-to-publish payload blocks; any trailing partial frame is kept
    /// internally and prepended to the next call.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Vec<RefBuf>, IceError> {
        let audio = self.strip_inline_metadata(chunk)?;
        self.read_data.extend_from_slice(&audio);

        let unprocessed = self
            .sync
            .complete_frames(&self.read_data)
            .map_err(|e| IceError::FrameSync(e.to_string()))?;

        if unprocessed > self.max_unsynced_bytes {
            self.read_data.clear();
            return Err(IceError::FrameSync(format!(
                "unprocessed tail of {unprocessed} bytes exceeds threshold {}",
                self.max_unsynced_bytes
            )));
        }

        let valid_len = self.read_data.len() - unprocessed;
        let mut out = Vec::new();
        if valid_len > 0 {
            let data = Bytes::copy_from_slice(&self.read_data[..valid_len]);
            out.push(RefBuf::new(data, self.metadata.clone(), true));
            self.read_data.drain(..valid_len);
        }
        Ok(out)
    }

    fn publish_metadata(&mut self, now: NowPlaying) {
        self.url_title = now.title.clone();
        self.url_artist = now.artist.clone();
        self.url = now.url.clone();
        self.metadata = IcyMetaBuilder::build(
            &now,
            self.codec,
            self.sample_rate_hz,
            self.channels,
            self.bit_rate_kbps,
        );
    }

    /// Splits inline ICY metadata blocks out of `input`, returning the
    /// remaining audio bytes. When a complete block has been accumulated,
    /// parses it and publishes fresh metadata as a side effect.
    fn strip_inline_metadata(&mut self, input: &[u8]) -> Result<Vec<u8>, IceError> {
        if self.inline_metadata_interval == 0 {
            return Ok(input.to_vec());
        }

        let mut audio_out = Vec::with_capacity(input.len());
        let mut pos = 0usize;
        while pos < input.len() {
            let in_metadata_block =
                !self.build_metadata.is_empty() || self.offset == self.inline_metadata_interval;
            if in_metadata_block {
                if self.build_metadata.is_empty() {
                    let l = input[pos] as usize;
                    self.build_metadata.push(input[pos]);
                    pos += 1;
                    self.pending_meta_len = 1 + 16 * l;
                    if l == 0 {
                        self.build_metadata.clear();
                        self.pending_meta_len = 0;
                        self.offset = 0;
                        continue;
                    }
                }
                let need = self.pending_meta_len - self.build_metadata.len();
                let take = need.min(input.len() - pos);
                self.build_metadata.extend_from_slice(&input[pos..pos + take]);
                pos += take;
                if self.build_metadata.len() == self.pending_meta_len {
                    let block = std::mem::take(&mut self.build_metadata);
                    self.pending_meta_len = 0;
                    self.handle_inline_block(&block)?;
                    self.offset = 0;
                }
            } else {
                let room = self.inline_metadata_interval - self.offset;
                let take = room.min(input.len() - pos);
                audio_out.extend_from_slice(&input[pos..pos + take]);
                pos += take;
                self.offset += take;
            }
        }
        Ok(audio_out)
    }

    fn handle_inline_block(&mut self, block: &[u8]) -> Result<(), IceError> {
        match icymeta::parse_inline_block(block, self.update_metadata) {
            Ok(Some(now)) => {
                self.publish_metadata(now);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(IceError::InputParse(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icy_block(body: &str) -> Vec<u8> {
        let padded_len = body.len().div_ceil(16) * 16;
        let l = (padded_len / 16) as u8;
        let mut out = vec![l];
        out.extend_from_slice(body.as_bytes());
        out.resize(1 + padded_len, 0);
        out
    }

    fn frame(len: usize) -> Vec<u8> {
        // MPEG1 Layer III, 128kbps, 44100Hz, mono -- frame_len = 417
        let mut f = vec![0xFFu8, 0b1111_1010, 0b1001_0000, 0b1100_0000];
        f.resize(len, 0xAA);
        f
    }

    #[test]
    fn inline_metadata_transparency_round_trip() {
        // S1/S3: strip(interleave(payload, meta, I)) == payload
        let audio_a = frame(417);
        let mut state = Mp3State::new(Codec::Mp3, 417, 16000);
        let meta_block = icy_block("StreamTitle='X';");

        let mut ingest_stream = Vec::new();
        ingest_stream.extend_from_slice(&audio_a);
        ingest_stream.extend_from_slice(&meta_block);
        ingest_stream.extend_from_slice(&audio_a);

        let mut produced = Vec::new();
        for chunk in ingest_stream.chunks(37) {
            let blocks = state.ingest(chunk).unwrap();
            for b in blocks {
                produced.extend_from_slice(&b.data);
            }
        }

        let mut expected = Vec::new();
        expected.extend_from_slice(&audio_a);
        expected.extend_from_slice(&audio_a);
        assert_eq!(produced, expected);
        assert_eq!(state.url_title.as_deref(), Some("X"));
    }

    #[test]
    fn excess_unsynced_tail_is_an_error() {
        let mut state = Mp3State::new(Codec::Mp3, 0, 16000).with_max_unsynced_bytes(8000);
        let garbage = vec![0u8; 9000];
        assert!(state.ingest(&garbage).is_err());
    }

    #[test]
    fn partial_frame_is_carried_to_next_ingest() {
        let mut state = Mp3State::new(Codec::Mp3, 0, 16000);
        let full = frame(417);
        let (head, tail) = full.split_at(200);
        let first = state.ingest(head).unwrap();
        assert!(first.is_empty());
        let second = state.ingest(tail).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data.len(), 417);
    }

    #[test]
    fn set_tag_publishes_immediately() {
        let mut state = Mp3State::new(Codec::Mp3, 0, 16000);
        let before = state.metadata.clone();
        state.set_tag(Some("T".into()), Some("A".into()), None);
        assert!(!Arc::ptr_eq(&before, &state.metadata));
        assert_eq!(state.url_title.as_deref(), Some("T"));
    }
}
