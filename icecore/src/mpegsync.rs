//! Stateful MPEG audio frame resynchronization.
//!
//! Scans a byte buffer for a run of valid MPEG frame headers starting at
//! offset 0, reporting how many trailing bytes do not yet form a complete
//! frame so the caller can carry them into the next read.

use thiserror::Error;

const SYNC_BYTE: u8 = 0xFF;
const SYNC_NIBBLE_MASK: u8 = 0xE0;

/// Threshold above which an unparsed tail is treated as "probably not MPEG"
/// rather than a frame straddling a read boundary. Overridable by callers
/// that know their mounts carry unusually large frames.
pub const MAX_UNSYNCED_BYTES: usize = 8000;

#[derive(Debug, Error)]
pub enum FrameSyncError {
    #[error("no valid frame header found in {0} bytes")]
    NoSync(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    V1,
    V2,
    V2_5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegLayer {
    L1,
    L2,
    L3,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: MpegLayer,
    pub bit_rate_kbps: u32,
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub frame_len: usize,
}

const BITRATES_V1: [[u32; 16]; 3] = [
    [
        0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0,
    ],
    [
        0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0,
    ],
    [
        0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
    ],
];

const BITRATES_V2: [[u32; 16]; 3] = [
    [
        0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0,
    ],
    [
        0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
    ],
    [
        0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
    ],
];

const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATES_V25: [u32; 3] = [11025, 12000, 8000];

fn parse_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < 4 {
        return None;
    }
    if bytes[0] != SYNC_BYTE || bytes[1] & SYNC_NIBBLE_MASK != SYNC_NIBBLE_MASK {
        return None;
    }
    let b1 = bytes[1];
    let b2 = bytes[2];
    let b3 = bytes[3];

    let version_bits = (b1 >> 3) & 0b11;
    let layer_bits = (b1 >> 1) & 0b11;

    let version = match version_bits {
        0b00 => MpegVersion::V2_5,
        0b10 => MpegVersion::V2,
        0b11 => MpegVersion::V1,
        _ => return None,
    };
    let layer = match layer_bits {
        0b01 => MpegLayer::L3,
        0b10 => MpegLayer::L2,
        0b11 => MpegLayer::L1,
        _ => return None,
    };

    let bitrate_index = ((b2 >> 4) & 0b1111) as usize;
    let samplerate_index = ((b2 >> 2) & 0b11) as usize;
    if bitrate_index == 0 || bitrate_index == 15 || samplerate_index == 3 {
        return None;
    }
    let padding = ((b2 >> 1) & 0b1) as u32;
    let channel_mode = (b3 >> 6) & 0b11;
    let channels = if channel_mode == 0b11 { 1 } else { 2 };

    let layer_idx = match layer {
        MpegLayer::L1 => 0,
        MpegLayer::L2 => 1,
        MpegLayer::L3 => 2,
    };
    let bit_rate_kbps = match version {
        MpegVersion::V1 => BITRATES_V1[layer_idx][bitrate_index],
        MpegVersion::V2 | MpegVersion::V2_5 => BITRATES_V2[layer_idx][bitrate_index],
    };
    if bit_rate_kbps == 0 {
        return None;
    }

    let sample_rate_hz = match version {
        MpegVersion::V1 => SAMPLE_RATES_V1[samplerate_index],
        MpegVersion::V2 => SAMPLE_RATES_V2[samplerate_index],
        MpegVersion::V2_5 => SAMPLE_RATES_V25[samplerate_index],
    };

    let frame_len = if matches!(layer, MpegLayer::L1) {
        ((12 * bit_rate_kbps * 1000 / sample_rate_hz + padding) * 4) as usize
    } else {
        (144 * bit_rate_kbps * 1000 / sample_rate_hz + padding) as usize
    };
    if frame_len < 4 {
        return None;
    }

    Some(FrameHeader {
        version,
        layer,
        bit_rate_kbps,
        sample_rate_hz,
        channels,
        frame_len,
    })
}

/// Finds the first byte offset at which a valid frame header begins.
fn find_sync(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == SYNC_BYTE && buf[i + 1] & SYNC_NIBBLE_MASK == SYNC_NIBBLE_MASK {
            if parse_header(&buf[i..]).is_some() {
                return Some(i);
            }
        }
    }
    None
}

#[derive(Debug, Default)]
pub struct MpegSync {
    pub last_header: Option<FrameHeader>,
    pub frames_seen: u64,
}

impl MpegSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks `buf` from the start, consuming as many whole frames as it can,
    /// and returns the count of trailing bytes that don't form a complete
    /// frame yet. Errs if no frame header can be located anywhere in `buf`
    /// before this sync has ever locked onto the stream.
    pub fn complete_frames(&mut self, buf: &[u8]) -> Result<usize, FrameSyncError> {
        let mut pos = 0usize;
        loop {
            if pos + 4 > buf.len() {
                break;
            }
            match parse_header(&buf[pos..]) {
                Some(hdr) => {
                    if pos + hdr.frame_len > buf.len() {
                        break;
                    }
                    self.last_header = Some(hdr);
                    self.frames_seen += 1;
                    pos += hdr.frame_len;
                }
                None => {
                    if self.last_header.is_none() && pos == 0 {
                        match find_sync(&buf[pos..]) {
                            Some(shift) => {
                                pos += shift;
                                continue;
                            }
                            None => return Err(FrameSyncError::NoSync(buf.len())),
                        }
                    }
                    break;
                }
            }
        }
        Ok(buf.len() - pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(bit_rate_kbps: u32, sample_rate_hz: u32) -> Vec<u8> {
        let bitrate_index = BITRATES_V1[2]
            .iter()
            .position(|&b| b == bit_rate_kbps)
            .unwrap() as u8;
        let samplerate_index = SAMPLE_RATES_V1
            .iter()
            .position(|&s| s == sample_rate_hz)
            .unwrap() as u8;
        let b0 = 0xFFu8;
        let b1 = 0b1111_1010u8; // MPEG1, Layer III, no CRC
        let b2 = (bitrate_index << 4) | (samplerate_index << 2);
        let b3 = 0b1100_0000u8; // mono
        let frame_len = (144 * bit_rate_kbps * 1000 / sample_rate_hz) as usize;
        let mut frame = vec![b0, b1, b2, b3];
        frame.resize(frame_len, 0xAA);
        frame
    }

    #[test]
    fn complete_frame_leaves_no_remainder() {
        let frame = make_frame(128, 44100);
        let mut sync = MpegSync::new();
        assert_eq!(sync.complete_frames(&frame).unwrap(), 0);
        assert_eq!(sync.frames_seen, 1);
    }

    #[test]
    fn partial_trailing_frame_is_reported() {
        let mut frame = make_frame(128, 44100);
        let full_len = frame.len();
        frame.truncate(full_len - 10);
        let mut sync = MpegSync::new();
        assert_eq!(sync.complete_frames(&frame).unwrap(), full_len - 10);
    }

    #[test]
    fn two_frames_back_to_back_both_consumed() {
        let mut buf = make_frame(128, 44100);
        buf.extend(make_frame(128, 44100));
        let mut sync = MpegSync::new();
        assert_eq!(sync.complete_frames(&buf).unwrap(), 0);
        assert_eq!(sync.frames_seen, 2);
    }

    #[test]
    fn garbage_with_no_sync_errors() {
        let buf = vec![0u8; 32];
        let mut sync = MpegSync::new();
        assert!(sync.complete_frames(&buf).is_err());
    }

    #[test]
    fn leading_garbage_is_skipped_once_locked() {
        let mut buf = vec![0u8; 3];
        buf.extend(make_frame(128, 44100));
        let mut sync = MpegSync::new();
        let unprocessed = sync.complete_frames(&buf).unwrap();
        assert_eq!(unprocessed, 0);
        assert_eq!(sync.frames_seen, 1);
    }
}
