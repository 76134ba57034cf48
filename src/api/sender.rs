//! High-level sender interface broadcasting framed records to every
//! connected consumer.
//!
//! # Architecture
//!
//! The sender consists of two main components:
//!
//! - **[`Broadcaster`]**: the user-facing handle that appends records, forces flushes, and exposes stats.
//! - **[`BroadcasterTask`]**: a background task that accepts consumers, spawns one send task per client, and
//!   autoflushes a stale buffer.
//!
//! Records appended through the handle accumulate in the active buffer of a
//! fixed ring; a full or flushed buffer is stamped with its wire header and
//! drained to every consumer independently, so one slow or dead socket never
//! delays the others. A buffer recycles once every consumer that was
//! connected when it was flushed has read it — and the producer blocks when
//! the ring wraps onto a buffer that is still draining, which bounds memory
//! to `buffer_count * buffer_size` regardless of how fast records arrive.
//!
//! Consumers that disconnect forfeit whatever was in flight to them; they
//! reconnect mid-stream and resume with the next flushed buffer.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{self, FRAME_HEADER_LEN, RECORD_HEADER_LEN},
    net::{Endpoint, Listener, Stream},
    pool::{ActiveSlot, AppendError, Pool, WaitError},
    registry::{Admitted, ClientStats, Registry},
    sync::time::{AtomicDuration, now_micros},
};

/// Errors that can occur when sending a record.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The record can never fit into a buffer of the configured size.
    ///
    /// A record costs its own length plus a [`RECORD_HEADER_LEN`]-byte
    /// prefix, and must fit into one buffer payload; records are never
    /// split across buffers. This is a contract violation by the caller,
    /// not a transient condition — retrying the same record will fail the
    /// same way.
    #[error("record of {size} bytes cannot fit a buffer payload of {max} bytes")]
    TooLarge {
        /// Size of the rejected record.
        size: usize,
        /// Largest record the configured buffers can carry.
        max: usize,
    },

    /// Timed out waiting for a reusable buffer.
    ///
    /// Every buffer in the ring is flushed and still draining to at least
    /// one connected consumer. This is the backpressure signal: the
    /// producer is outrunning the slowest consumer by more than
    /// `buffer_count` buffers. The record was not stored; the caller may
    /// retry, raise the timeout, or drop the record.
    #[error("timed out waiting for a reusable buffer")]
    Timeout,

    /// The engine has been stopped.
    ///
    /// [`Broadcaster::stop`] was called or the background task terminated.
    /// This is a terminal error; a new broadcaster must be built to
    /// continue sending.
    #[error("broadcast engine is stopped")]
    Closed,
}

/// Errors detected while constructing a [`Broadcaster`].
///
/// Configuration is validated once, at [`BroadcasterBuilder::build`];
/// violations are never encountered mid-operation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `buffer_count` must be at least 1.
    #[error("buffer count must be at least 1")]
    ZeroBufferCount,

    /// `buffer_size` must leave room for at least one minimal record
    /// after the frame header.
    #[error(
        "buffer size must exceed {} bytes (frame header plus one record prefix)",
        FRAME_HEADER_LEN + RECORD_HEADER_LEN
    )]
    BufferTooSmall,

    /// `max_clients` must be at least 1.
    #[error("client capacity must be at least 1")]
    ZeroMaxClients,

    /// The listening socket could not be bound.
    #[error("failed to bind {endpoint}")]
    Bind {
        /// The endpoint that failed to bind.
        endpoint: Endpoint,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },
}

/// State shared between the handle, the accept loop and the client tasks.
struct Shared {
    pool: Pool,
    registry: Registry,
    local_addr: Option<SocketAddr>,
    max_clients: usize,
}

/// Handle for broadcasting framed records to every connected consumer.
///
/// `Broadcaster` is cheaply cloneable; clones share the same buffer ring
/// and client set, and concurrent senders serialize on the active buffer.
///
/// # Examples
///
/// ```no_run
/// # use manifold::{broadcaster, Endpoint};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (mut tx, _task) = broadcaster(Endpoint::Tcp("127.0.0.1:7600".into()))
///     .buffer_count(8)
///     .buffer_size(16 * 1024)
///     .build()
///     .await?;
///
/// tx.send(b"first record").await?;
/// tx.send(b"second record").await?;
/// tx.flush().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
    /// Budget for one send or flush operation.
    timeout: Duration,
    /// Cancellation token for coordinating shutdown.
    token: CancellationToken,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("max_clients", &self.shared.max_clients)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Sets the budget for a single [`send()`](Self::send) or
    /// [`flush()`](Self::flush) call on this handle.
    ///
    /// The budget covers waiting for a reusable buffer when the ring is
    /// saturated. Default: 10 seconds.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Appends one record to the broadcast stream.
    ///
    /// The record is length-prefixed and copied into the active buffer.
    /// A full buffer is flushed out to the consumers automatically and the
    /// record retried on the next one; the call only waits when every
    /// buffer in the ring is still draining (see [`SendError::Timeout`]).
    ///
    /// Records are buffered until the active buffer fills, an explicit
    /// [`flush()`](Self::flush) runs, or the background task autoflushes a
    /// stale buffer.
    ///
    /// With no consumer connected the record is accepted and discarded at
    /// flush time: delivery is only ever guaranteed to consumers that are
    /// connected when the buffer carrying the record is flushed.
    ///
    /// # Errors
    ///
    /// - [`SendError::TooLarge`]: the record can never fit a buffer
    /// - [`SendError::Timeout`]: no buffer became reusable within the budget
    /// - [`SendError::Closed`]: the engine is stopped
    pub async fn send(&mut self, record: &[u8]) -> Result<(), SendError> {
        let pool = &self.shared.pool;

        let max = codec::MAX_RECORD_LEN.min(pool.payload_capacity() - RECORD_HEADER_LEN);
        if record.len() > max {
            return Err(SendError::TooLarge {
                size: record.len(),
                max,
            });
        }

        let start = now_micros();
        let mut slot = self.lock_producer().await?;

        loop {
            match pool.append_record(&mut slot, record).await {
                Ok(()) => return Ok(()),
                Err(AppendError::Closed) => return Err(SendError::Closed),
                Err(AppendError::Full) => {}
            }

            // Active buffer is out of room (or still awaiting recycle):
            // flush it out and park until the next slot frees up
            pool.finish_active(&mut slot, &self.shared.registry).await;
            let remaining = self.remaining(start)?;
            match pool.wait_reusable(&mut slot, Some(remaining)).await {
                Ok(()) => {}
                Err(WaitError::Timeout) => return Err(SendError::Timeout),
                Err(WaitError::Closed) => return Err(SendError::Closed),
            }
        }
    }

    /// Flushes the active buffer out to the consumers.
    ///
    /// A no-op when the active buffer is empty. After the flush the call
    /// waits — within the handle's [`timeout`](Self::timeout) — for the
    /// next buffer slot to be reusable, so a `flush().await?` that returns
    /// `Ok` leaves the broadcaster ready to accept the full payload
    /// capacity again.
    pub async fn flush(&mut self) -> Result<(), SendError> {
        let pool = &self.shared.pool;
        let start = now_micros();
        let mut slot = self.lock_producer().await?;

        pool.finish_active(&mut slot, &self.shared.registry).await;
        let remaining = self.remaining(start)?;
        match pool.wait_reusable(&mut slot, Some(remaining)).await {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout) => Err(SendError::Timeout),
            Err(WaitError::Closed) => Err(SendError::Closed),
        }
    }

    async fn lock_producer(&self) -> Result<async_mutex::MutexGuard<'_, ActiveSlot>, SendError> {
        let pool = &self.shared.pool;
        // Fast path first; the slow path is bounded by the send budget
        match pool.try_lock_producer() {
            Some(slot) => Ok(slot),
            None => tokio::time::timeout(self.timeout, pool.lock_producer())
                .await
                .map_err(|_| SendError::Timeout),
        }
    }

    fn remaining(&self, start: u64) -> Result<Duration, SendError> {
        let elapsed = Duration::from_micros(now_micros().saturating_sub(start));
        self.timeout.checked_sub(elapsed).ok_or(SendError::Timeout)
    }

    /// Number of currently connected consumers.
    pub fn client_count(&self) -> u32 {
        self.shared.registry.connected()
    }

    /// Number of buffers flushed out since construction.
    pub fn finished_buffers(&self) -> u64 {
        self.shared.pool.finished_buffers()
    }

    /// Snapshot of per-client send timings and delivery counters.
    pub fn client_stats(&self) -> Vec<ClientStats> {
        self.shared.registry.stats()
    }

    /// Address the engine is listening on, for TCP endpoints.
    ///
    /// Useful with a `"127.0.0.1:0"` endpoint, where the port is chosen at
    /// bind time.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Whether the engine has been stopped.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.shared.pool.is_closed()
    }

    /// Stops the engine: no new consumers are accepted, in-flight sends to
    /// consumers are aborted and their connections closed, and blocked
    /// producers return [`SendError::Closed`].
    ///
    /// This is an immediate close, not a drain. When delivery of buffered
    /// data matters, call [`flush()`](Self::flush) first and give consumers
    /// time to read before stopping.
    pub fn stop(self) {
        self.shared.pool.close();
        self.token.cancel();
    }
}

// ================================================================================================
// BroadcasterTask - Background accept loop and per-client drain tasks
// ================================================================================================

/// Shared state of the accept loop, tunable from the `BroadcasterTask`
/// handle while the task is running.
struct BroadcasterTaskInner {
    /// Upper bound on one accept-loop wait between housekeeping passes.
    accept_timeout: AtomicDuration,
    /// Age after which a non-empty active buffer is flushed on its own.
    autoflush: AtomicDuration,
}

/// Background task handle for the accept loop.
///
/// The task accepts consumers (refusing them past `max_clients`), spawns
/// one send task per accepted client, and periodically flushes a stale
/// active buffer so sparse traffic does not sit unsent.
pub struct BroadcasterTask {
    /// Join handle for the accept-loop task.
    handle: JoinHandle<()>,
    /// Cancellation token for coordinating shutdown.
    token: CancellationToken,
    /// Shared state for configuration.
    inner: Arc<BroadcasterTaskInner>,
}

impl fmt::Debug for BroadcasterTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcasterTask").finish_non_exhaustive()
    }
}

impl BroadcasterTask {
    /// Sets the upper bound on one accept wait.
    ///
    /// Accepting itself is readiness-driven; this interval only bounds how
    /// long the loop waits between termination and autoflush checks.
    /// Values under a millisecond (including zero, the "poll" setting) are
    /// clamped to one millisecond so the loop cannot spin.
    ///
    /// Default: 100 milliseconds.
    pub fn set_accept_timeout(&self, timeout: Duration) {
        self.inner.accept_timeout.store(timeout, Ordering::Relaxed);
    }

    /// Sets the age after which a non-empty active buffer is flushed out
    /// without an explicit [`Broadcaster::flush`]. Zero disables the
    /// autoflush.
    ///
    /// Default: 500 milliseconds.
    pub fn set_autoflush(&self, age: Duration) {
        self.inner.autoflush.store(age, Ordering::Relaxed);
    }

    /// Stops the engine and returns a handle to await the accept loop's
    /// completion. Equivalent to [`Broadcaster::stop`] plus the join
    /// handle.
    pub fn stop(self) -> JoinHandle<()> {
        let Self { handle, token, inner: _ } = self;
        token.cancel();
        handle
    }
}

/// Builder for configuring and creating a [`Broadcaster`] and
/// [`BroadcasterTask`].
pub struct BroadcasterBuilder {
    endpoint: Endpoint,
    buffer_count: usize,
    buffer_size: usize,
    max_clients: usize,
    accept_timeout: Duration,
    autoflush: Duration,
    timeout: Duration,
}

impl BroadcasterBuilder {
    /// Sets the number of buffers in the ring.
    ///
    /// More buffers let the producer run further ahead of the slowest
    /// consumer before backpressure kicks in, at the cost of memory:
    /// the ring permanently owns `buffer_count * buffer_size` bytes.
    ///
    /// Default: 10.
    #[must_use]
    pub fn buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Sets the size of each buffer in bytes, frame header included.
    ///
    /// This is also the upper bound on one record (minus the header and
    /// record prefix) and the unit of delivery: consumers receive whole
    /// buffers.
    ///
    /// Default: 100 000 bytes.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the maximum number of simultaneously connected consumers.
    /// Connections past the cap are refused at accept time.
    ///
    /// Default: 20.
    #[must_use]
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Initial accept-wait bound; see [`BroadcasterTask::set_accept_timeout`].
    #[must_use]
    pub fn accept_timeout(mut self, accept_timeout: Duration) -> Self {
        self.accept_timeout = accept_timeout;
        self
    }

    /// Initial autoflush age; see [`BroadcasterTask::set_autoflush`].
    #[must_use]
    pub fn autoflush(mut self, autoflush: Duration) -> Self {
        self.autoflush = autoflush;
        self
    }

    /// Initial send/flush budget; see [`Broadcaster::timeout`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the configuration, binds the listening socket, and spawns
    /// the accept loop.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a bound is violated or the endpoint
    /// cannot be bound. Configuration faults never surface later than
    /// this call.
    pub async fn build(self) -> Result<(Broadcaster, BroadcasterTask), ConfigError> {
        let Self {
            endpoint,
            buffer_count,
            buffer_size,
            max_clients,
            accept_timeout,
            autoflush,
            timeout,
        } = self;

        if buffer_count == 0 {
            return Err(ConfigError::ZeroBufferCount);
        }
        if buffer_size <= FRAME_HEADER_LEN + RECORD_HEADER_LEN {
            return Err(ConfigError::BufferTooSmall);
        }
        if max_clients == 0 {
            return Err(ConfigError::ZeroMaxClients);
        }

        let listener = Listener::bind(&endpoint)
            .await
            .map_err(|source| ConfigError::Bind { endpoint, source })?;

        let shared = Arc::new(Shared {
            pool: Pool::new(buffer_count, buffer_size),
            registry: Registry::new(max_clients),
            local_addr: listener.local_addr(),
            max_clients,
        });

        let token = CancellationToken::new();
        let inner = Arc::new(BroadcasterTaskInner {
            accept_timeout: AtomicDuration::new(accept_timeout),
            autoflush: AtomicDuration::new(autoflush),
        });

        let handle = tokio::spawn(accept_task(listener, shared.clone(), inner.clone(), token.clone()));

        let broadcaster = Broadcaster {
            shared,
            timeout,
            token: token.clone(),
        };
        let task = BroadcasterTask { handle, token, inner };
        Ok((broadcaster, task))
    }
}

/// Creates a new broadcast engine listening on `endpoint`.
///
/// Returns a builder; [`build()`](BroadcasterBuilder::build) yields the
/// [`Broadcaster`] handle and the [`BroadcasterTask`] running the accept
/// loop.
pub fn broadcaster(endpoint: Endpoint) -> BroadcasterBuilder {
    BroadcasterBuilder {
        endpoint,
        buffer_count: 10,
        buffer_size: 100_000,
        max_clients: 20,
        accept_timeout: Duration::from_millis(100),
        autoflush: Duration::from_millis(500),
        timeout: Duration::from_secs(10),
    }
}

async fn accept_task(
    listener: Listener,
    shared: Arc<Shared>,
    inner: Arc<BroadcasterTaskInner>,
    token: CancellationToken,
) {
    loop {
        let tick = inner
            .accept_timeout
            .load(Ordering::Relaxed)
            .max(Duration::from_millis(1));

        select! {
            _ = token.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, id)) => admit(&shared, stream, id, &token),
                Err(error) => {
                    warn!(%error, "failed to accept a consumer");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = tokio::time::sleep(tick) => {}
        }

        // Housekeeping: flush a stale active buffer so sparse traffic
        // does not sit unsent
        let age = inner.autoflush.load(Ordering::Relaxed);
        if !age.is_zero() && shared.pool.autoflush(&shared.registry, age).await {
            debug!("autoflushed a stale buffer");
        }
    }

    // Shutdown: release blocked producers and idle drain tasks
    shared.pool.close();
}

fn admit(shared: &Arc<Shared>, stream: Stream, id: u32, token: &CancellationToken) {
    match shared.registry.admit(id, &shared.pool) {
        Ok(admitted) => {
            debug!(id, watermark = admitted.watermark, "consumer connected");
            tokio::spawn(client_task(shared.clone(), stream, admitted, token.clone()));
        }
        Err(_) => {
            warn!(id, max_clients = shared.max_clients, "refusing consumer, at capacity");
            drop(stream);
        }
    }
}

/// One connected consumer's drain loop.
///
/// Walks the ring in finish order, pushing each owed buffer to the socket:
/// idle until the next buffer finishes, then write from the last position
/// until the wire frame is fully sent, then account the consumption and
/// advance. Every exit path — peer EOF, write error, engine shutdown —
/// withdraws the client and releases its outstanding claims; other
/// consumers are unaffected.
async fn client_task(shared: Arc<Shared>, stream: Stream, admitted: Admitted, token: CancellationToken) {
    let Admitted {
        id,
        slot,
        watermark,
        counters,
    } = admitted;
    let pool = &shared.pool;

    let (mut read_half, mut write_half) = stream.into_split();
    let mut consumed = watermark;
    let mut probe = [0u8; 64];

    'run: loop {
        // Assigned: wait for the buffer right after our watermark
        let want = consumed + 1;
        let (index, payload_len) = select! {
            _ = token.cancelled() => break 'run,
            // A readable idle consumer has either closed its end or is
            // sending data it shouldn't; EOF and errors mean disconnect,
            // anything else is discarded
            result = read_half.read(&mut probe) => match result {
                Ok(0) | Err(_) => break 'run,
                Ok(_) => continue 'run,
            },
            found = pool.drain_signal().wait_until(|| pool.find_finished(want)) => match found {
                Ok(found) => found,
                Err(_) => break 'run,
            },
        };

        // Sending: drive the wire frame [cursor, wire_len) to the socket,
        // one write at a time so partial progress and timing are recorded
        let wire_len = FRAME_HEADER_LEN + payload_len;
        let mut cursor = 0usize;
        let data = pool.buffer(index).data().await;
        while cursor < wire_len {
            let begin = now_micros();
            let result = select! {
                _ = token.cancelled() => break 'run,
                result = write_half.write(&data[cursor..wire_len]) => result,
            };
            counters.record_send(Duration::from_micros(now_micros().saturating_sub(begin)));

            match result {
                Ok(0) | Err(_) => break 'run,
                Ok(written) => cursor += written,
            }
        }
        drop(data);

        // Consumed: account it and move on to the next buffer in sequence
        pool.consume(index);
        counters.record_delivered();
        consumed = want;
    }

    debug!(id, delivered = consumed.saturating_sub(watermark), "consumer disconnected");
    shared.registry.withdraw(slot, consumed, &shared.pool);
}
