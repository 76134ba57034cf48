use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::codec::FRAME_HEADER_LEN;

/// Mutable bookkeeping of one pool buffer.
///
/// Guarded by the buffer's own lock, so a drain-side read of
/// `finished`/`consumed_count` never observes a torn producer update. The
/// lock is never held across an await point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BufferState {
    /// Offset of the next free byte in the payload region. Advances only
    /// while the buffer is not finished.
    pub(crate) write_cursor: usize,
    /// Once set, no further writes until the buffer resets.
    pub(crate) finished: bool,
    /// Number of connected clients that have fully read the payload.
    pub(crate) consumed_count: u32,
    /// Number of clients that must read the buffer before it may reset:
    /// the connected-client count snapshotted when the buffer finished.
    pub(crate) target: u32,
    /// Global finish ordinal, valid while `finished` is set. Buffers finish
    /// in sequence, so a client's next buffer is the one carrying the
    /// ordinal right after its own consumption watermark.
    pub(crate) seq: u64,
}

impl BufferState {
    /// Returns the buffer to its initial state. Payload bytes are left
    /// stale; with the cursor at zero they are unreachable.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One fixed-capacity buffer of the pool: a frame-header region followed by
/// a payload region, allocated once at pool construction.
///
/// The byte region and the bookkeeping are guarded separately. The bytes sit
/// behind a read-write lock: the producer takes the write side only while
/// the buffer is active (no readers exist then), and any number of drain
/// tasks hold the read side of a finished buffer while pushing it to their
/// sockets. A finished buffer cannot reset under a reader, because every
/// reader is counted in its consumption target.
pub(crate) struct Buffer {
    state: Mutex<BufferState>,
    data: RwLock<Box<[u8]>>,
}

impl Buffer {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > FRAME_HEADER_LEN);
        Self {
            state: Mutex::new(BufferState::default()),
            data: RwLock::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    /// Shared view of the wire bytes (header + payload), for drain tasks.
    pub(crate) async fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().await
    }

    /// Exclusive view of the bytes, for the producer filling the active
    /// buffer and for writing the frame header at finish time.
    pub(crate) async fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().await
    }
}
