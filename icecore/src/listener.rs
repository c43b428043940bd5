//! Per-listener writer state machine: raw, ICY-interleaved, and iceblock
//! wire framing, with byte-exact metadata insertion cadence.
//!
//! Partial-write resumption across socket congestion is delegated to the
//! async I/O layer each block is ultimately handed to (the listener task
//! `.await`s a write of the bytes this emits, and the runtime retries short
//! writes transparently) -- this state machine's job narrows to producing
//! the exact interleaved byte sequence for one payload block at a time.

use crate::refbuf::{BroadcastMetadata, RefBuf};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub enum Framing {
    Raw,
    Icy { interval: usize },
    IceBlock,
}

pub struct ListenerSender {
    framing: Framing,
    associated: Arc<BroadcastMetadata>,
    since_meta_block: usize,
}

impl ListenerSender {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            associated: BroadcastMetadata::blank(),
            since_meta_block: 0,
        }
    }

    /// Whether this listener is still referencing the blank metadata
    /// singleton (no real "now playing" tags observed yet).
    pub fn using_blank_meta(&self) -> bool {
        BroadcastMetadata::is_blank(&self.associated)
    }

    /// Consumes one payload block, producing the exact bytes to write to the
    /// listener's socket for this block under its configured framing.
    pub fn emit(&mut self, block: &RefBuf) -> Bytes {
        match self.framing {
            Framing::Raw => block.data.clone(),
            // A zero interval has no well-formed ICY framing (every byte
            // would be a metadata-insert point); fall back to raw payload
            // rather than looping forever trying to fill zero bytes of room.
            Framing::Icy { interval: 0 } => block.data.clone(),
            Framing::Icy { interval } => self.emit_icy(block, interval),
            Framing::IceBlock => self.emit_iceblock(block),
        }
    }

    fn emit_icy(&mut self, block: &RefBuf, interval: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(block.data.len() + 17);
        let data = &block.data;
        let mut pos = 0usize;
        while pos < data.len() {
            let room = interval - self.since_meta_block;
            let take = room.min(data.len() - pos);
            out.extend_from_slice(&data[pos..pos + take]);
            pos += take;
            self.since_meta_block += take;
            if self.since_meta_block == interval {
                self.insert_metadata_marker(block, &mut out);
                self.since_meta_block = 0;
            }
        }
        out.freeze()
    }

    fn insert_metadata_marker(&mut self, block: &RefBuf, out: &mut BytesMut) {
        if block.metadata_changed_from(&self.associated) {
            out.extend_from_slice(&block.metadata.icy_bytes);
            self.associated = block.metadata.clone();
        } else {
            out.extend_from_slice(&[0u8]);
        }
    }

    fn emit_iceblock(&mut self, block: &RefBuf) -> Bytes {
        let mut out = BytesMut::with_capacity(block.data.len() + block.metadata.iceblock_bytes.len() + 2);
        if block.metadata_changed_from(&self.associated) {
            out.extend_from_slice(&block.metadata.iceblock_bytes);
            self.associated = block.metadata.clone();
        }
        out.extend_from_slice(&(block.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&block.data);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refbuf::BroadcastMetadata;

    fn block(data: &[u8], meta: Arc<BroadcastMetadata>) -> RefBuf {
        RefBuf::new(Bytes::copy_from_slice(data), meta, true)
    }

    fn fresh_metadata(body: &'static [u8]) -> Arc<BroadcastMetadata> {
        Arc::new(BroadcastMetadata {
            generation: 1,
            icy_bytes: Bytes::from_static(body),
            flv_tag: Bytes::new(),
            iceblock_bytes: Bytes::from_static(body),
        })
    }

    #[test]
    fn icy_interval_is_byte_exact() {
        // I-1: over N=32 bytes at interval 16, exactly 2 inserts, never more
        // than `interval` consecutive payload bytes between them.
        let mut sender = ListenerSender::new(Framing::Icy { interval: 16 });
        let blank = BroadcastMetadata::blank();
        let payload = vec![0x41u8; 32];
        let out = sender.emit(&block(&payload, blank));
        assert_eq!(out.len(), 16 + 1 + 16 + 1);
        assert_eq!(out[16], 0x00);
        assert_eq!(out[33], 0x00);
    }

    #[test]
    fn icy_with_zero_interval_falls_back_to_raw_instead_of_hanging() {
        let mut sender = ListenerSender::new(Framing::Icy { interval: 0 });
        let blank = BroadcastMetadata::blank();
        let payload = vec![0x41u8; 32];
        let out = sender.emit(&block(&payload, blank));
        assert_eq!(out.as_ref(), payload.as_slice());
    }

    #[test]
    fn raw_listener_sees_no_metadata_bytes() {
        // S2: non-ICY listener on an ICY source sees pure payload.
        let mut sender = ListenerSender::new(Framing::Raw);
        let blank = BroadcastMetadata::blank();
        let payload = vec![0x41u8; 32];
        let out = sender.emit(&block(&payload, blank));
        assert_eq!(out.as_ref(), payload.as_slice());
    }

    #[test]
    fn metadata_change_is_emitted_exactly_once() {
        // S1: after the first full insert the listener's cached associated
        // handle equals the source's current metadata.
        let mut sender = ListenerSender::new(Framing::Icy { interval: 16 });
        let blank = BroadcastMetadata::blank();
        let fresh = fresh_metadata(b"\x01StreamTitle='x';pad...........");
        let payload = vec![0x41u8; 16];

        let first = sender.emit(&block(&payload, blank));
        assert_eq!(first[16], 0x00);

        let second = sender.emit(&block(&payload, fresh.clone()));
        assert_eq!(&second[16..], fresh.icy_bytes.as_ref());

        let third = sender.emit(&block(&payload, fresh.clone()));
        assert_eq!(third[16], 0x00); // unchanged since last send
    }

    #[test]
    fn iceblock_prefixes_length_and_metadata_on_change() {
        let mut sender = ListenerSender::new(Framing::IceBlock);
        let meta = fresh_metadata(b"\x80\x05hello");
        let payload = vec![0xABu8; 10];
        let out = sender.emit(&block(&payload, meta.clone()));
        assert_eq!(&out[..7], meta.iceblock_bytes.as_ref());
        let len_bytes = [out[7], out[8]];
        assert_eq!(u16::from_be_bytes(len_bytes), 10);
        assert_eq!(&out[9..], payload.as_slice());

        let out2 = sender.emit(&block(&payload, meta));
        assert_eq!(out2.len(), 2 + payload.len()); // no metadata repeated
    }
}
