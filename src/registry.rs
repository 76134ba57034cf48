//! Bounded registry of connected clients.
//!
//! The registry is an arena sized at construction: a slot per possible
//! client, no growth. Membership changes and consumption-target bookkeeping
//! are serialized under the registry lock so that a client connecting or
//! leaving concurrently with a buffer being finished is either counted in
//! that buffer's consumption target and owes it, or is not and never reads
//! it (see [`Pool::finish_active`](crate::pool::Pool::finish_active) and
//! [`Pool::release_claims`](crate::pool::Pool::release_claims)).

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};

use crate::pool::Pool;

/// A new connection was refused because every client slot is taken.
#[derive(Debug)]
pub(crate) struct RegistryFull;

/// Per-client observability counters, shared between the client's send task
/// and stats snapshots.
#[derive(Default)]
pub(crate) struct ClientCounters {
    /// Time spent in send calls since the client connected, in microseconds.
    timer_total_us: AtomicU64,
    /// Time spent in the most recent send call, in microseconds.
    timer_last_us: AtomicU64,
    /// Buffers fully delivered to this client.
    delivered: AtomicU64,
}

impl ClientCounters {
    pub(crate) fn record_send(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.timer_last_us.store(micros, Ordering::Relaxed);
        self.timer_total_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only snapshot of one connected client's counters.
#[derive(Debug, Clone)]
pub struct ClientStats {
    /// Client identifier: the peer port for TCP, the peer process id for
    /// Unix sockets.
    pub id: u32,
    /// Cumulative time spent sending to this client since it connected.
    pub total_send_time: Duration,
    /// Duration of the most recent send call to this client.
    pub last_send_duration: Duration,
    /// Number of buffers this client has fully received.
    pub buffers_delivered: u64,
}

struct ClientSlot {
    id: u32,
    counters: Arc<ClientCounters>,
}

pub(crate) struct Slots {
    clients: Box<[Option<ClientSlot>]>,
    connected: u32,
}

impl Slots {
    pub(crate) fn connected(&self) -> u32 {
        self.connected
    }
}

/// Outcome of admitting a client: its slot, the finish-ordinal watermark it
/// joins at (it owes every buffer finished after this point and none before),
/// and its shared counters.
pub(crate) struct Admitted {
    pub(crate) id: u32,
    pub(crate) slot: usize,
    pub(crate) watermark: u64,
    pub(crate) counters: Arc<ClientCounters>,
}

pub(crate) struct Registry {
    slots: Mutex<Slots>,
}

impl Registry {
    pub(crate) fn new(max_clients: usize) -> Self {
        let clients = (0..max_clients).map(|_| None).collect();
        Self {
            slots: Mutex::new(Slots { clients, connected: 0 }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock()
    }

    /// Number of currently connected clients.
    pub(crate) fn connected(&self) -> u32 {
        self.slots.lock().connected
    }

    /// Admits a new client into a free slot.
    ///
    /// The watermark is captured under the registry lock, atomically with
    /// membership: the client joins mid-stream and is never asked to read a
    /// buffer that finished before it connected.
    pub(crate) fn admit(&self, id: u32, pool: &Pool) -> Result<Admitted, RegistryFull> {
        let mut slots = self.slots.lock();
        let slot = slots
            .clients
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryFull)?;

        let watermark = pool.finished_buffers();
        let counters = Arc::new(ClientCounters::default());
        slots.clients[slot] = Some(ClientSlot {
            id,
            counters: counters.clone(),
        });
        slots.connected += 1;

        Ok(Admitted {
            id,
            slot,
            watermark,
            counters,
        })
    }

    /// Withdraws a departed client and releases its outstanding consumption
    /// claims, so no buffer reset stays stalled on a vanished peer.
    ///
    /// `watermark` is the finish ordinal of the last buffer the client fully
    /// consumed. The claim release runs under the registry lock so it cannot
    /// interleave with a concurrent target snapshot.
    pub(crate) fn withdraw(&self, slot: usize, watermark: u64, pool: &Pool) {
        let mut slots = self.slots.lock();
        if slots.clients[slot].take().is_some() {
            slots.connected -= 1;
            pool.release_claims(watermark);
        }
    }

    /// Snapshots the counters of every connected client.
    pub(crate) fn stats(&self) -> Vec<ClientStats> {
        let slots = self.slots.lock();
        slots
            .clients
            .iter()
            .flatten()
            .map(|client| ClientStats {
                id: client.id,
                total_send_time: Duration::from_micros(client.counters.timer_total_us.load(Ordering::Relaxed)),
                last_send_duration: Duration::from_micros(client.counters.timer_last_us.load(Ordering::Relaxed)),
                buffers_delivered: client.counters.delivered.load(Ordering::Relaxed),
            })
            .collect()
    }
}
