//! The buffered broadcast pool.
//!
//! A fixed ring of reusable buffers carries data from one producer to every
//! connected client:
//!
//! ```text
//!                      ┌─────────────────────────────┐
//!  append/flush ──────▶│ [B0: active] [B1: finished] │──▶ client task 0
//!   (producer)         │ [B2: drained] [B3: ...]     │──▶ client task 1
//!                      └─────────────────────────────┘──▶ client task N
//! ```
//!
//! The producer fills exactly one active buffer at a time. Finishing a
//! buffer stamps its wire header, snapshots the connected-client count as
//! its consumption target, and advances the active index; the buffer then
//! drains independently to each client and resets once the last counted
//! client has read it. When the ring wraps onto a buffer that is still
//! draining, the producer waits — that wait is the backpressure valve, and
//! it bounds memory to `buffer_count * buffer_size` for any append sequence.
//!
//! Two signals connect the sides: `can_drain` wakes idle client tasks after
//! a finish, `can_reuse` wakes a blocked producer after a recycle.

mod buffer;

pub(crate) use buffer::{Buffer, BufferState};

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_mutex::{Mutex, MutexGuard};

use crate::{
    codec::{self, FRAME_HEADER_LEN},
    registry::Registry,
    sync::{event::Signal, time::now_micros},
};

/// Producer-side cursor over the ring. Holding the guard that wraps it
/// serializes appends, finishes and backpressure waits, the way a single
/// send lock serializes producers in front of the ring.
pub(crate) struct ActiveSlot {
    index: usize,
}

/// Error appending to the active buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AppendError {
    /// The active buffer has no room for the data (or is finished and
    /// awaiting recycle). The caller flushes and retries, or waits.
    Full,
    /// The pool was closed.
    Closed,
}

/// Error waiting for the active slot to become reusable.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The slot was still draining when the wait budget ran out.
    Timeout,
    /// The pool was closed.
    Closed,
}

pub(crate) struct Pool {
    buffers: Box<[Buffer]>,
    producer: Mutex<ActiveSlot>,
    /// Buffers finished since construction; also the finish-ordinal source.
    finished: AtomicU64,
    /// Timestamp of the last finish (micros since the local epoch), driving
    /// the autoflush of a stale active buffer.
    flush_stamp: AtomicU64,
    can_drain: Signal,
    can_reuse: Signal,
    payload_capacity: usize,
}

impl Pool {
    /// `buffer_size` covers the whole wire frame: header region plus
    /// payload region. Bounds are validated by the builder.
    pub(crate) fn new(buffer_count: usize, buffer_size: usize) -> Self {
        let buffers = (0..buffer_count).map(|_| Buffer::new(buffer_size)).collect();
        Self {
            buffers,
            producer: Mutex::new(ActiveSlot { index: 0 }),
            finished: AtomicU64::new(0),
            flush_stamp: AtomicU64::new(now_micros()),
            can_drain: Signal::new(),
            can_reuse: Signal::new(),
            payload_capacity: buffer_size - FRAME_HEADER_LEN,
        }
    }

    #[inline]
    pub(crate) fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Buffers finished since construction.
    #[inline]
    pub(crate) fn finished_buffers(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }

    /// Signal that fires after every finish; drain tasks wait on it for
    /// their next buffer.
    #[inline]
    pub(crate) fn drain_signal(&self) -> &Signal {
        &self.can_drain
    }

    #[inline]
    pub(crate) fn buffer(&self, index: usize) -> &Buffer {
        &self.buffers[index]
    }

    pub(crate) fn try_lock_producer(&self) -> Option<MutexGuard<'_, ActiveSlot>> {
        self.producer.try_lock()
    }

    pub(crate) async fn lock_producer(&self) -> MutexGuard<'_, ActiveSlot> {
        self.producer.lock().await
    }

    /// Copies `data` into the active buffer's payload region at the write
    /// cursor.
    ///
    /// Fails with [`AppendError::Full`] when the remaining capacity is
    /// insufficient; the caller must then finish the buffer and retry on
    /// the next slot.
    pub(crate) async fn append(&self, slot: &mut ActiveSlot, data: &[u8]) -> Result<(), AppendError> {
        self.append_parts(slot, &[data]).await
    }

    /// Appends one length-prefixed record as a single unit.
    pub(crate) async fn append_record(&self, slot: &mut ActiveSlot, record: &[u8]) -> Result<(), AppendError> {
        let prefix = codec::encode_record_header(record.len());
        self.append_parts(slot, &[&prefix, record]).await
    }

    async fn append_parts(&self, slot: &mut ActiveSlot, parts: &[&[u8]]) -> Result<(), AppendError> {
        if self.is_closed() {
            return Err(AppendError::Closed);
        }

        let total: usize = parts.iter().map(|part| part.len()).sum();
        let buffer = &self.buffers[slot.index];

        let cursor = {
            let state = buffer.state();
            if state.finished || self.payload_capacity - state.write_cursor < total {
                return Err(AppendError::Full);
            }
            state.write_cursor
        };

        // The producer guard serializes writers, and readers only ever
        // touch finished buffers, so the write lock is uncontended here.
        let mut data = buffer.data_mut().await;
        let mut at = FRAME_HEADER_LEN + cursor;
        for part in parts {
            data[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        drop(data);

        buffer.state().write_cursor = cursor + total;
        Ok(())
    }

    /// Finishes the active buffer and advances the active index.
    ///
    /// Stamps the frame header, assigns the finish ordinal and snapshots
    /// the connected-client count as the consumption target — both under
    /// the registry lock, so a client connecting concurrently is either
    /// counted and owes the buffer, or joins after it and never reads it.
    /// A buffer finished with no clients connected resets on the spot; its
    /// content is discarded.
    ///
    /// No-op (returns `false`) when the active buffer is empty or already
    /// finished.
    pub(crate) async fn finish_active(&self, slot: &mut ActiveSlot, registry: &Registry) -> bool {
        let buffer = &self.buffers[slot.index];
        {
            let state = buffer.state();
            if state.finished || state.write_cursor == 0 {
                return false;
            }
        }

        let mut data = buffer.data_mut().await;
        {
            let slots = registry.lock();
            let mut state = buffer.state();

            let seq = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
            codec::encode_frame_header(&mut data, state.write_cursor as u32);
            state.seq = seq;
            state.target = slots.connected();
            state.finished = true;

            if state.target == 0 {
                state.reset();
            }
        }
        drop(data);

        self.flush_stamp.store(now_micros(), Ordering::Release);
        slot.index = (slot.index + 1) % self.buffers.len();
        self.can_drain.notify();
        true
    }

    /// Waits until the active slot accepts writes again.
    ///
    /// Returns immediately while the active buffer is unfinished. A
    /// finished active buffer means the ring has wrapped onto a slot still
    /// draining to some client: the producer parks here — the designed
    /// backpressure point — until the slot recycles, the wait budget runs
    /// out, or the pool closes. `None` waits indefinitely.
    pub(crate) async fn wait_reusable(&self, slot: &mut ActiveSlot, wait: Option<Duration>) -> Result<(), WaitError> {
        let buffer = &self.buffers[slot.index];
        let reusable = || (!buffer.state().finished).then_some(());

        match wait {
            None => self.can_reuse.wait_until(reusable).await.map_err(|_| WaitError::Closed),
            Some(budget) => match tokio::time::timeout(budget, self.can_reuse.wait_until(reusable)).await {
                Ok(result) => result.map_err(|_| WaitError::Closed),
                Err(_) => Err(WaitError::Timeout),
            },
        }
    }

    /// Finds the finished buffer carrying finish ordinal `seq`, returning
    /// its ring index and payload length.
    ///
    /// Buffers finish in sequence, so a drain task looks up the ordinal
    /// right after its own watermark; `None` means that buffer has not
    /// been finished yet and the task idles.
    pub(crate) fn find_finished(&self, seq: u64) -> Option<(usize, usize)> {
        for (index, buffer) in self.buffers.iter().enumerate() {
            let state = buffer.state();
            if state.finished && state.seq == seq {
                return Some((index, state.write_cursor));
            }
        }
        None
    }

    /// Records that one counted client has fully read the buffer. The last
    /// counted client recycles it and wakes a blocked producer.
    pub(crate) fn consume(&self, index: usize) {
        let recycled = {
            let mut state = self.buffers[index].state();
            debug_assert!(state.finished);
            state.consumed_count += 1;
            if state.consumed_count == state.target {
                state.reset();
                true
            } else {
                false
            }
        };
        if recycled {
            self.can_reuse.notify();
        }
    }

    /// Releases the consumption claims of a departed client: every finished
    /// buffer past the client's watermark loses one target count, and any
    /// buffer now fully consumed recycles, so a vanished peer can never
    /// stall the ring.
    ///
    /// Must run under the registry lock (see [`Registry::withdraw`]), which
    /// serializes it against concurrent target snapshots.
    pub(crate) fn release_claims(&self, watermark: u64) {
        let mut recycled = false;
        for buffer in self.buffers.iter() {
            let mut state = buffer.state();
            if state.finished && state.seq > watermark {
                state.target -= 1;
                if state.consumed_count == state.target {
                    state.reset();
                    recycled = true;
                }
            }
        }
        if recycled {
            self.can_reuse.notify();
        }
    }

    /// Finishes a stale active buffer so data does not sit unsent while the
    /// producer is quiet. Skips entirely when a producer holds the lock
    /// (it is making progress on its own) or the buffer was finished within
    /// `age`.
    pub(crate) async fn autoflush(&self, registry: &Registry, age: Duration) -> bool {
        let stamp = self.flush_stamp.load(Ordering::Acquire);
        if now_micros().saturating_sub(stamp) < age.as_micros() as u64 {
            return false;
        }
        let Some(mut slot) = self.try_lock_producer() else {
            return false;
        };
        self.finish_active(&mut slot, registry).await
    }

    /// Closes the pool: blocked producers and idle drain tasks return
    /// promptly with a closed error.
    pub(crate) fn close(&self) {
        self.can_drain.close();
        self.can_reuse.close();
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.can_drain.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, index: usize) -> BufferState {
        self.buffers[index].state().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::timeout;

    use super::*;
    use crate::registry::Registry;

    const TIMEOUT: Duration = Duration::from_secs(3);
    const BUFFER_SIZE: usize = 64; // 4-byte header + 60-byte payload

    fn pool(buffer_count: usize) -> Arc<Pool> {
        Arc::new(Pool::new(buffer_count, BUFFER_SIZE))
    }

    #[tokio::test]
    async fn test_append_until_full() {
        let pool = pool(2);
        let mut slot = pool.lock_producer().await;

        // 60-byte payload region takes exactly three 20-byte appends
        for _ in 0..3 {
            pool.append(&mut slot, &[7u8; 20]).await.unwrap();
        }
        assert_eq!(pool.append(&mut slot, &[7u8; 1]).await, Err(AppendError::Full));
        assert_eq!(pool.state_of(0).write_cursor, 60);
    }

    #[tokio::test]
    async fn test_finish_empty_is_noop() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let mut slot = pool.lock_producer().await;

        assert!(!pool.finish_active(&mut slot, &registry).await);
        assert_eq!(pool.finished_buffers(), 0);
    }

    #[tokio::test]
    async fn test_finish_without_clients_discards() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let mut slot = pool.lock_producer().await;

        pool.append(&mut slot, b"doomed").await.unwrap();
        assert!(pool.finish_active(&mut slot, &registry).await);

        // Counted as finished, but immediately recycled: nobody was there
        // to read it and nobody ever will be
        assert_eq!(pool.finished_buffers(), 1);
        assert_eq!(pool.state_of(0), BufferState::default());
        assert!(pool.find_finished(1).is_none());
    }

    #[tokio::test]
    async fn test_consume_recycles_at_target() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let _a = registry.admit(1, &pool).unwrap();
        let _b = registry.admit(2, &pool).unwrap();

        let mut slot = pool.lock_producer().await;
        pool.append(&mut slot, b"payload").await.unwrap();
        pool.finish_active(&mut slot, &registry).await;
        drop(slot);

        let (index, len) = pool.find_finished(1).unwrap();
        assert_eq!(len, 7);
        assert_eq!(pool.state_of(index).target, 2);

        pool.consume(index);
        assert_eq!(pool.state_of(index).consumed_count, 1);
        assert!(pool.state_of(index).finished);

        pool.consume(index);
        assert_eq!(pool.state_of(index), BufferState::default());
    }

    #[tokio::test]
    async fn test_backpressure_blocks_and_wakes() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let _client = registry.admit(1, &pool).unwrap();

        let mut slot = pool.lock_producer().await;
        for _ in 0..2 {
            pool.append(&mut slot, b"x").await.unwrap();
            pool.finish_active(&mut slot, &registry).await;
        }

        // Ring has wrapped onto the first, still unconsumed buffer
        assert_eq!(pool.append(&mut slot, b"x").await, Err(AppendError::Full));
        assert_eq!(
            pool.wait_reusable(&mut slot, Some(Duration::from_millis(50))).await,
            Err(WaitError::Timeout)
        );

        // Consuming the oldest buffer unblocks the producer
        let (index, _) = pool.find_finished(1).unwrap();
        let c_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            let mut slot = c_pool.lock_producer().await;
            c_pool.wait_reusable(&mut slot, None).await.unwrap();
            c_pool.append(&mut slot, b"x").await.unwrap();
        });
        drop(slot);

        pool.consume(index);
        timeout(TIMEOUT, waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_late_joiner_isolation() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let _early = registry.admit(1, &pool).unwrap();

        let mut slot = pool.lock_producer().await;
        pool.append(&mut slot, b"first").await.unwrap();
        pool.finish_active(&mut slot, &registry).await;
        drop(slot);

        // Connects after the finish: not counted, owes nothing from seq 1
        let late = registry.admit(2, &pool).unwrap();
        assert_eq!(late.watermark, 1);

        let (index, _) = pool.find_finished(1).unwrap();
        assert_eq!(pool.state_of(index).target, 1);

        // The early client alone recycles the buffer
        pool.consume(index);
        assert_eq!(pool.state_of(index), BufferState::default());
    }

    #[tokio::test]
    async fn test_release_claims_on_departure() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let a = registry.admit(1, &pool).unwrap();
        let _b = registry.admit(2, &pool).unwrap();

        let mut slot = pool.lock_producer().await;
        pool.append(&mut slot, b"shared").await.unwrap();
        pool.finish_active(&mut slot, &registry).await;
        drop(slot);

        let (index, _) = pool.find_finished(1).unwrap();
        pool.consume(index); // b reads it
        assert!(pool.state_of(index).finished);

        // a vanishes without reading: the reset must not stay stalled
        registry.withdraw(a.slot, a.watermark, &pool);
        assert_eq!(pool.state_of(index), BufferState::default());
    }

    #[tokio::test]
    async fn test_reset_cycle_is_idempotent() {
        let pool = pool(2);
        let registry = Registry::new(2);
        let initial = pool.state_of(0);

        let _client = registry.admit(1, &pool).unwrap();
        let mut slot = pool.lock_producer().await;
        pool.append(&mut slot, b"cycle").await.unwrap();
        pool.finish_active(&mut slot, &registry).await;
        drop(slot);

        let (index, _) = pool.find_finished(1).unwrap();
        pool.consume(index);

        // Full cycle restores the initial state; only the pool-wide
        // finished counter remembers it happened
        assert_eq!(pool.state_of(index), initial);
        assert_eq!(pool.finished_buffers(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_fails_fast() {
        let pool = pool(2);
        let mut slot = pool.lock_producer().await;

        pool.close();
        assert_eq!(pool.append(&mut slot, b"x").await, Err(AppendError::Closed));
        assert_eq!(pool.wait_reusable(&mut slot, None).await, Err(WaitError::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_accept_racing_finish_stays_consistent() {
        // A client admitted concurrently with a finish must either be
        // counted in the buffer's target (and owe it) or not (and never
        // read it) — never half of each.
        for _ in 0..200 {
            let pool = pool(2);
            let registry = Arc::new(Registry::new(4));
            let resident = registry.admit(1, &pool).unwrap();

            {
                let mut slot = pool.lock_producer().await;
                pool.append(&mut slot, b"contended").await.unwrap();
                drop(slot);
            }

            let c_pool = pool.clone();
            let c_registry = registry.clone();
            let flusher = tokio::spawn(async move {
                let mut slot = c_pool.lock_producer().await;
                c_pool.finish_active(&mut slot, &c_registry).await;
            });
            let c_pool = pool.clone();
            let c_registry = registry.clone();
            let joiner = tokio::spawn(async move { c_registry.admit(2, &c_pool).unwrap() });

            flusher.await.unwrap();
            let joined = joiner.await.unwrap();

            let state = pool.state_of(0);
            assert!(state.finished);
            let owed = [resident.watermark, joined.watermark]
                .iter()
                .filter(|watermark| **watermark < state.seq)
                .count();
            assert_eq!(state.target as usize, owed);
        }
    }
}
