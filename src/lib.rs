//! Manifold: a buffered multi-client broadcast transport for moving framed
//! data records between independent processing modules over TCP/IP or Unix
//! sockets.
//!
//! One side — the sender — accepts connections from any number of consumers
//! and broadcasts a single stream of framed messages to all of them. The
//! other side — the receiver — connects to a sender and reassembles the
//! framed messages into a caller-supplied buffer, surviving partial socket
//! reads across calls. Like an intake manifold, one inlet feeds many
//! outlets; hence the name.
//!
//! # Overview
//!
//! The diagram below shows the broadcast engine in operation with a ring of
//! four buffers and three connected consumers:
//!
//! ```text
//!  APPLICATION SEND                                              User code
//! ┌──────┐ ┌────┐ ┌─────────┐
//! │  R1  │ │ R2 │ │   R3    │   send(record)
//! └──┬───┘ └─┬──┘ └────┬────┘
//!    ▼       ▼         ▼
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!  BROADCAST ENGINE                                         Manifold code
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Buffer ring:                                                       │
//! │   [B0: active  ← R3        ]   producer appends here                │
//! │   [B1: finished (R1 R2)    ]   draining to consumers                │
//! │   [B2: finished (R..)      ]   draining to consumers                │
//! │   [B3: recycled            ]   waiting for reuse                    │
//! │                                                                     │
//! │  One send task per consumer walks the ring in finish order:         │
//! │    consumer A ──▶ B1 @ 1800/4096 bytes                              │
//! │    consumer B ──▶ B1 @ 4096/4096 bytes ──▶ B2                       │
//! │    consumer C ──▶ B2 (slow; blocks nobody else)                     │
//! └───────────┬────────────────────┬────────────────────┬───────────────┘
//!             ▼ TCP / Unix         ▼                     ▼
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!  APPLICATION RECEIVE                                          User code
//! ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐
//! │ recv → records  │  │ recv → records  │  │ recv → records  │
//! └─────────────────┘  └─────────────────┘  └─────────────────┘
//! ```
//!
//! Records appended by the application accumulate in the active buffer.
//! When the buffer fills — or [`Broadcaster::flush`] forces it, or the
//! background task autoflushes a stale one — it is stamped with a wire
//! header and handed to the drain side. Every consumer that was connected
//! at that moment reads the whole buffer at its own pace over its own
//! socket; the buffer recycles once the last of them is done. A consumer
//! that connects later never sees it, and a consumer that disconnects
//! stops counting immediately, so a vanished peer can never stall the
//! ring.
//!
//! # Features
//!
//! - **Bounded memory**: a fixed ring of `buffer_count` buffers of `buffer_size` bytes, allocated once. When the
//!   producer outruns the slowest consumer by a full ring, it blocks — that backpressure is the only waiting the
//!   producer ever does.
//! - **No head-of-line blocking**: one send task per consumer; a slow or dead socket delays only its own stream.
//! - **Loss-free to connected consumers**: a flushed buffer is never recycled before every consumer counted at flush
//!   time has read all of it.
//! - **Resumable reception**: the receiver reassembles `[header][payload]` frames across arbitrarily split reads, and
//!   a timed-out `recv` resumes mid-message on the next call.
//! - **Prompt shutdown**: one cancellation signal stops the accept loop, the per-consumer send tasks, and any blocked
//!   producer.
//!
//! # Quick Start
//!
//! ```no_run
//! use manifold::{Endpoint, broadcaster, receiver, records};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Sender side: bind and spawn the accept loop
//!     let (mut tx, _task) = broadcaster(Endpoint::Tcp("127.0.0.1:7600".into())).build().await?;
//!
//!     // Receiver side (usually another process); a consumer only sees
//!     // buffers flushed after it connects
//!     let mut rx = receiver(Endpoint::Tcp("127.0.0.1:7600".into())).connect().await?;
//!
//!     tx.send(b"alpha").await?;
//!     tx.send(b"beta").await?;
//!     tx.flush().await?;
//!
//!     let mut buf = vec![0u8; 100_000];
//!     let len = rx.recv(&mut buf).await?;
//!     for record in records(&buf[..len]) {
//!         println!("got {} bytes", record?.len());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Delivery model
//!
//! The unit of delivery is the buffer, not the record: consumers receive
//! whole flushed buffers and split them back into records with
//! [`records()`]. There is no persistence and no redelivery — a consumer
//! that disconnects forfeits whatever was in flight to it and, on
//! reconnect, resumes with the next buffer flushed after it joined. With
//! no consumer connected at flush time a buffer is discarded outright.
//! Producers that need delivery confirmation should build acknowledgement
//! on top.

mod api;
mod codec;
mod net;
mod pool;
mod registry;
mod sync;

pub use api::*;
pub use codec::{FRAME_HEADER_LEN, MAX_RECORD_LEN, RECORD_HEADER_LEN, RecordError, Records, records};
pub use net::Endpoint;
pub use registry::ClientStats;
