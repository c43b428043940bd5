//! Inline Shoutcast-ICY metadata parsing and broadcast metadata construction.
//!
//! Mirrors the length-byte-plus-padded-body framing a streaming sink uses
//! when it formats `StreamTitle='...'` blocks for ICY clients, but runs in
//! both directions: parsing blocks pulled out of an ingest stream, and
//! building the next broadcast update (ICY + FLV + iceblock) once new tags
//! are known.

use crate::mp3state::{Codec, UpdateMetadata};
use crate::refbuf::BroadcastMetadata;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IcyParseError {
    #[error("empty metadata block")]
    Empty,
    #[error("declared length {declared} exceeds received length {received}")]
    LengthMismatch { declared: usize, received: usize },
}

/// The current "now playing" tags, as parsed from an inline ICY block or set
/// directly by an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub url: Option<String>,
}

/// Decodes inline metadata bytes to text per the declared charset. ISO8859-1
/// (this format's legacy default) is a single-byte encoding covering every
/// byte value, so `WINDOWS_1252` -- the charset the WHATWG encoding
/// standard itself maps the `iso-8859-1` label onto -- decodes it without
/// ever needing a replacement character.
fn decode_body(body: &[u8], charset: UpdateMetadata) -> String {
    match charset {
        UpdateMetadata::ConvertFromCharset => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(body);
            text.into_owned()
        }
        UpdateMetadata::AlreadyUtf8 | UpdateMetadata::None => {
            String::from_utf8_lossy(body).into_owned()
        }
    }
}

/// Parses one inline ICY metadata block (the length byte plus its
/// null-padded, 16-byte-multiple body). `Ok(None)` means `L == 0`, i.e. "no
/// change, no payload". `charset` controls how the body bytes are decoded
/// to text before the `StreamTitle=`/`StreamUrl=` tokens are split out.
pub fn parse_inline_block(
    block: &[u8],
    charset: UpdateMetadata,
) -> Result<Option<NowPlaying>, IcyParseError> {
    let l = *block.first().ok_or(IcyParseError::Empty)? as usize;
    if l == 0 {
        return Ok(None);
    }
    let declared = 16 * l;
    if block.len() < 1 + declared {
        return Err(IcyParseError::LengthMismatch {
            declared,
            received: block.len().saturating_sub(1),
        });
    }
    let body = &block[1..1 + declared];
    let text = decode_body(body, charset);
    let trimmed = text.trim_end_matches('\0');

    let mut now = NowPlaying::default();
    for field in trimmed.split(';').map(str::trim).filter(|f| !f.is_empty()) {
        if let Some(value) = field.strip_prefix("StreamTitle=") {
            let value = strip_quotes(value);
            match value.split_once(" - ") {
                Some((artist, title)) => {
                    now.artist = Some(artist.to_string());
                    now.title = Some(title.to_string());
                }
                None => now.title = Some(value.to_string()),
            }
        } else if let Some(value) = field.strip_prefix("StreamUrl=") {
            now.url = Some(strip_quotes(value).to_string());
        }
        // unknown tokens are skipped, per the inline metadata contract
    }
    Ok(Some(now))
}

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches('\'')
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

pub struct IcyMetaBuilder;

impl IcyMetaBuilder {
    /// Mints a fresh [`BroadcastMetadata`] triple from the given tags and
    /// codec parameters. Fields absent from `now` are simply omitted from
    /// each framing.
    pub fn build(
        now: &NowPlaying,
        codec: Codec,
        sample_rate_hz: u32,
        channels: u8,
        bit_rate_kbps: u32,
    ) -> Arc<BroadcastMetadata> {
        Arc::new(BroadcastMetadata {
            generation: GENERATION.fetch_add(1, Ordering::SeqCst),
            icy_bytes: build_icy_bytes(now),
            flv_tag: build_flv_tag(now, codec, sample_rate_hz, channels, bit_rate_kbps),
            iceblock_bytes: build_iceblock_bytes(now),
        })
    }
}

fn build_icy_bytes(now: &NowPlaying) -> Bytes {
    let mut body = String::new();
    match (&now.artist, &now.title) {
        (Some(artist), Some(title)) => {
            body.push_str(&format!("StreamTitle='{} - {}';", artist, title))
        }
        (None, Some(title)) => body.push_str(&format!("StreamTitle='{}';", title)),
        (Some(artist), None) => body.push_str(&format!("StreamTitle='{}';", artist)),
        (None, None) => {}
    }
    if let Some(url) = &now.url {
        body.push_str(&format!("StreamUrl='{}';", url));
    }

    let bytes = body.as_bytes();
    let padded_len = bytes.len().div_ceil(16) * 16;
    let length_byte = (padded_len / 16) as u8;
    let mut out = Vec::with_capacity(1 + padded_len);
    out.push(length_byte);
    out.extend_from_slice(bytes);
    out.resize(1 + padded_len, 0);
    Bytes::from(out)
}

/// Minimal AMF0 encoder, just enough for an `onMetaData` ScriptData tag.
mod amf0 {
    pub fn string(s: &str) -> Vec<u8> {
        let mut out = vec![0x02];
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub fn number(n: f64) -> Vec<u8> {
        let mut out = vec![0x00];
        out.extend_from_slice(&n.to_be_bytes());
        out
    }

    pub fn boolean(b: bool) -> Vec<u8> {
        vec![0x01, b as u8]
    }

    pub fn ecma_array(pairs: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![0x08];
        out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
        for (key, value) in pairs {
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(value);
        }
        out.extend_from_slice(&[0x00, 0x00, 0x09]); // empty key + object-end marker
        out
    }
}

fn build_flv_tag(
    now: &NowPlaying,
    codec: Codec,
    sample_rate_hz: u32,
    channels: u8,
    bit_rate_kbps: u32,
) -> Bytes {
    let audio_codec_id = match codec {
        Codec::Mp3 => 2.0,
        Codec::Aac => 10.0,
    };
    let mut pairs: Vec<(&str, Vec<u8>)> = vec![
        (
            "name",
            amf0::string(now.title.as_deref().unwrap_or_default()),
        ),
        ("description", amf0::string("live")),
        ("stereo", amf0::boolean(channels > 1)),
        ("audiosamplerate", amf0::number(sample_rate_hz as f64)),
        ("audiodatarate", amf0::number(bit_rate_kbps as f64)),
        ("audiocodecid", amf0::number(audio_codec_id)),
    ];
    if let Some(artist) = &now.artist {
        pairs.push(("artist", amf0::string(artist)));
    }
    if let Some(title) = &now.title {
        pairs.push(("title", amf0::string(title)));
    }
    if let Some(url) = &now.url {
        pairs.push(("URL", amf0::string(url)));
    }

    let mut body = amf0::string("onMetaData");
    body.extend(amf0::ecma_array(&pairs));
    body.truncate(4000);
    Bytes::from(body)
}

fn build_iceblock_bytes(now: &NowPlaying) -> Bytes {
    let mut body = String::new();
    if let Some(artist) = &now.artist {
        body.push_str(&format!("artist={}\n", artist));
    }
    if let Some(title) = &now.title {
        body.push_str(&format!("title={}\n", title));
    }
    if let Some(url) = &now.url {
        body.push_str(&format!("url={}\n", url));
    }
    let mut bytes = body.into_bytes();
    bytes.truncate(4094);
    let len = bytes.len() as u16;
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.push(((len >> 8) as u8) | 0x80); // sentinel bit on the high byte
    out.push((len & 0xFF) as u8);
    out.extend_from_slice(&bytes);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_block(body: &str) -> Vec<u8> {
        let padded_len = body.len().div_ceil(16) * 16;
        let l = (padded_len / 16) as u8;
        let mut out = vec![l];
        out.extend_from_slice(body.as_bytes());
        out.resize(1 + padded_len, 0);
        out
    }

    #[test]
    fn parses_artist_and_title() {
        let block = padded_block("StreamTitle='Daft Punk - One More Time';");
        let now = parse_inline_block(&block, UpdateMetadata::AlreadyUtf8)
            .unwrap()
            .unwrap();
        assert_eq!(now.artist.as_deref(), Some("Daft Punk"));
        assert_eq!(now.title.as_deref(), Some("One More Time"));
    }

    #[test]
    fn parses_title_and_url() {
        let block = padded_block("StreamTitle='One More Time';StreamUrl='http://x';");
        let now = parse_inline_block(&block, UpdateMetadata::AlreadyUtf8)
            .unwrap()
            .unwrap();
        assert_eq!(now.title.as_deref(), Some("One More Time"));
        assert_eq!(now.url.as_deref(), Some("http://x"));
    }

    #[test]
    fn zero_length_means_no_change() {
        assert_eq!(
            parse_inline_block(&[0u8], UpdateMetadata::AlreadyUtf8).unwrap(),
            None
        );
    }

    #[test]
    fn unknown_tokens_are_skipped() {
        let block = padded_block("SomeOtherField='whatever';StreamTitle='Hello';");
        let now = parse_inline_block(&block, UpdateMetadata::AlreadyUtf8)
            .unwrap()
            .unwrap();
        assert_eq!(now.title.as_deref(), Some("Hello"));
    }

    #[test]
    fn truncated_block_is_rejected() {
        let mut block = padded_block("StreamTitle='Hello';");
        block.truncate(block.len() - 1);
        assert!(parse_inline_block(&block, UpdateMetadata::AlreadyUtf8).is_err());
    }

    #[test]
    fn convert_from_charset_decodes_latin1_bytes() {
        // "StreamTitle='Caf\xE9';" with the title's fourth byte left as the
        // raw ISO8859-1 encoding of 'é' (0xE9) instead of UTF-8's two-byte
        // form -- what an old Shoutcast DJ tool actually sends.
        let mut body = b"StreamTitle='Caf".to_vec();
        body.push(0xE9);
        body.extend_from_slice(b"';");
        let padded_len = body.len().div_ceil(16) * 16;
        let l = (padded_len / 16) as u8;
        let mut block = vec![l];
        block.extend_from_slice(&body);
        block.resize(1 + padded_len, 0);

        let now = parse_inline_block(&block, UpdateMetadata::ConvertFromCharset)
            .unwrap()
            .unwrap();
        assert_eq!(now.title.as_deref(), Some("Café"));

        // Parsed as already-UTF-8, the same lone 0xE9 byte is invalid UTF-8
        // and gets replaced rather than decoded.
        let mangled = parse_inline_block(&block, UpdateMetadata::AlreadyUtf8)
            .unwrap()
            .unwrap();
        assert_ne!(mangled.title.as_deref(), Some("Café"));
    }

    #[test]
    fn build_mints_distinct_generations() {
        let now = NowPlaying {
            title: Some("Hello".into()),
            artist: Some("World".into()),
            url: None,
        };
        let a = IcyMetaBuilder::build(&now, Codec::Mp3, 44100, 2, 128);
        let b = IcyMetaBuilder::build(&now, Codec::Mp3, 44100, 2, 128);
        assert_ne!(a.generation, b.generation);
        assert!(a.icy_bytes.starts_with(&[2])); // "StreamTitle='World - Hello';" -> 28 bytes -> 2*16
    }

    #[test]
    fn icy_bytes_round_trip_through_parser() {
        let now = NowPlaying {
            title: Some("One More Time".into()),
            artist: Some("Daft Punk".into()),
            url: Some("http://example.com".into()),
        };
        let meta = IcyMetaBuilder::build(&now, Codec::Mp3, 44100, 2, 128);
        let parsed = parse_inline_block(&meta.icy_bytes, UpdateMetadata::AlreadyUtf8)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, now);
    }
}
