//! A bounded, multi-consumer ring of payload blocks.
//!
//! Adapted from a TTL/epoch-aware pacing broadcast channel; this version
//! drops time-to-live and audio-pacing concerns entirely (byte-exact MP3
//! delivery needs neither) and keeps only ordered fan-out with backpressure,
//! garbage-collected by the slowest live reader's cursor.

use crate::refbuf::RefBuf;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Lagged(u64),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Lagged(u64),
    Closed,
}

struct Entry {
    seq: u64,
    block: RefBuf,
}

struct State {
    buffer: VecDeque<Entry>,
    next_seq: u64,
    closed: bool,
    cursors: Vec<Weak<AtomicU64>>,
}

impl State {
    fn prune_consumed(&mut self) {
        self.cursors.retain(|w| w.strong_count() > 0);
        let min_needed = self
            .cursors
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|c| c.load(Ordering::Acquire))
            .min();
        let Some(min_needed) = min_needed else {
            self.buffer.clear();
            return;
        };
        while let Some(front) = self.buffer.front() {
            if front.seq < min_needed {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    data_notify: Notify,
    space_notify: Notify,
    capacity: usize,
    sender_count: AtomicUsize,
    receiver_count: AtomicUsize,
}

pub struct Sender {
    inner: Arc<Inner>,
}

pub struct Receiver {
    inner: Arc<Inner>,
    cursor: Arc<AtomicU64>,
}

/// Creates a ring with room for `capacity` in-flight blocks.
pub fn channel(capacity: usize) -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            next_seq: 0,
            closed: false,
            cursors: Vec::new(),
        }),
        data_notify: Notify::new(),
        space_notify: Notify::new(),
        capacity,
        sender_count: AtomicUsize::new(1),
        receiver_count: AtomicUsize::new(1),
    });
    let cursor = Arc::new(AtomicU64::new(0));
    inner.state.lock().unwrap().cursors.push(Arc::downgrade(&cursor));
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner, cursor },
    )
}

impl Sender {
    /// Pushes a block onto the ring, yielding while every reader is pinned
    /// behind a full buffer.
    pub async fn send(&self, block: RefBuf) {
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.buffer.len() < self.inner.capacity {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.buffer.push_back(Entry { seq, block });
                    drop(state);
                    self.inner.data_notify.notify_waiters();
                    return;
                }
            }
            self.inner.space_notify.notified().await;
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.receiver_count.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Receiver {
        let cursor = {
            let mut state = self.inner.state.lock().unwrap();
            let start = state.buffer.front().map(|e| e.seq).unwrap_or(state.next_seq);
            let cursor = Arc::new(AtomicU64::new(start));
            state.cursors.push(Arc::downgrade(&cursor));
            cursor
        };
        self.inner.receiver_count.fetch_add(1, Ordering::AcqRel);
        Receiver {
            inner: self.inner.clone(),
            cursor,
        }
    }

    pub fn close(&self) {
        self.inner.state.lock().unwrap().closed = true;
        self.inner.data_notify.notify_waiters();
    }
}

impl Clone for Sender {
    fn clone(&self) -> Self {
        self.inner.sender_count.fetch_add(1, Ordering::AcqRel);
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if self.inner.sender_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close();
        }
    }
}

impl Receiver {
    pub fn try_recv(&self) -> Result<RefBuf, TryRecvError> {
        let mut state = self.inner.state.lock().unwrap();
        let want = self.cursor.load(Ordering::Acquire);
        let head_seq = match state.buffer.front() {
            Some(entry) => entry.seq,
            None if state.closed => return Err(TryRecvError::Closed),
            None => return Err(TryRecvError::Empty),
        };
        if want < head_seq {
            self.cursor.store(head_seq, Ordering::Release);
            return Err(TryRecvError::Lagged(head_seq - want));
        }
        let idx = (want - head_seq) as usize;
        match state.buffer.get(idx) {
            Some(entry) => {
                let block = entry.block.clone();
                self.cursor.store(want + 1, Ordering::Release);
                state.prune_consumed();
                drop(state);
                self.inner.space_notify.notify_waiters();
                Ok(block)
            }
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    pub async fn recv(&self) -> Result<RefBuf, RecvError> {
        loop {
            match self.try_recv() {
                Ok(block) => return Ok(block),
                Err(TryRecvError::Empty) => self.inner.data_notify.notified().await,
                Err(TryRecvError::Lagged(n)) => return Err(RecvError::Lagged(n)),
                Err(TryRecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }
}

impl Clone for Receiver {
    fn clone(&self) -> Self {
        let cursor = Arc::new(AtomicU64::new(self.cursor.load(Ordering::Acquire)));
        self.inner
            .state
            .lock()
            .unwrap()
            .cursors
            .push(Arc::downgrade(&cursor));
        self.inner.receiver_count.fetch_add(1, Ordering::AcqRel);
        Receiver {
            inner: self.inner.clone(),
            cursor,
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.inner.receiver_count.fetch_sub(1, Ordering::AcqRel);
        self.inner.state.lock().unwrap().prune_consumed();
        self.inner.space_notify.notify_waiters();
    }
}
