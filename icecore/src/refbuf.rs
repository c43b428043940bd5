//! Reference-counted payload blocks and the shared broadcast metadata value.
//!
//! A source historically chains three alternative framings onto one payload
//! block via a pointer three deep (`payload -> icy-meta -> flv-meta ->
//! iceblock-meta`). Here the chain collapses into a single
//! [`BroadcastMetadata`] value, minted once per tag update and shared by
//! `Arc`; every payload block just borrows whichever snapshot was current
//! when it was produced, and listeners detect a metadata change by pointer
//! identity rather than walking a chain.

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// One broadcast metadata update: the three wire framings minted atomically
/// whenever the source thread publishes new "now playing" tags.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMetadata {
    pub generation: u64,
    pub icy_bytes: Bytes,
    pub flv_tag: Bytes,
    pub iceblock_bytes: Bytes,
}

static BLANK: Lazy<Arc<BroadcastMetadata>> = Lazy::new(|| {
    Arc::new(BroadcastMetadata {
        generation: 0,
        icy_bytes: Bytes::from_static(&[0u8]),
        flv_tag: Bytes::new(),
        iceblock_bytes: Bytes::from_static(&[0x80, 0x00]),
    })
});

impl BroadcastMetadata {
    /// The process-wide blank metadata singleton. New listeners start out
    /// pointing at this; releasing it is a no-op by construction (it is
    /// never dropped, since `BLANK` holds a permanent handle).
    pub fn blank() -> Arc<BroadcastMetadata> {
        BLANK.clone()
    }

    pub fn is_blank(handle: &Arc<BroadcastMetadata>) -> bool {
        Arc::ptr_eq(handle, &BLANK)
    }
}

/// An immutable, cheaply-cloneable payload block carrying a handle to the
/// broadcast metadata that was current when it was minted.
#[derive(Debug, Clone, PartialEq)]
pub struct RefBuf {
    pub data: Bytes,
    pub metadata: Arc<BroadcastMetadata>,
    /// Set when this block begins on a validated MPEG frame boundary.
    pub block_sync: bool,
}

impl RefBuf {
    pub fn new(data: Bytes, metadata: Arc<BroadcastMetadata>, block_sync: bool) -> Self {
        Self {
            data,
            metadata,
            block_sync,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when this block's metadata handle differs from `other` -- the
    /// listener's change-detection test.
    pub fn metadata_changed_from(&self, other: &Arc<BroadcastMetadata>) -> bool {
        !Arc::ptr_eq(&self.metadata, other)
    }
}
