//! Receiver interface: connects to a sender and reassembles framed
//! messages into a caller-supplied buffer.
//!
//! # Architecture
//!
//! The receiver consists of two parts:
//!
//! - **[`Receiver`]**: the user-facing handle owning the connection.
//! - **`Assembler`**: a resumable state machine that first fills a fixed header scratch, decodes the payload length
//!   from it, then fills the caller's buffer with exactly that many bytes.
//!
//! Socket reads are rarely aligned with message boundaries; the assembler
//! survives any split of the byte stream across any number of calls. A
//! call that runs out of its time budget returns
//! [`RecvError::Timeout`] — "more data needed" — and the next call resumes
//! exactly where the previous one stopped, as long as the caller passes
//! the same buffer.
//!
//! ```text
//! AwaitingHeader ──header full, length decoded──▶ AwaitingPayload
//!       ▲                                              │
//!       └───────────── message complete ◀──────────────┘
//! ```
//!
//! A connection lost mid-message is an [`RecvError::Incomplete`] — never a
//! silently short message — while a clean close between messages is
//! [`RecvError::Closed`].

use std::{io, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    codec::{self, FRAME_HEADER_LEN},
    net::{Endpoint, Stream},
};

/// Errors that can occur when receiving a message.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The time budget ran out before the message completed.
    ///
    /// This is a "more data needed" result, not a failure: assembly state
    /// is preserved, and the next [`recv()`](Receiver::recv) call — with
    /// the same buffer — resumes where this one stopped. Callers may
    /// interleave other work between calls.
    #[error("timed out waiting for data; the message resumes on the next call")]
    Timeout,

    /// The advertised payload does not fit the caller's buffer.
    ///
    /// The message is skipped: its payload is read off the stream and
    /// discarded, so the following message can still be received. A length
    /// this size usually means the sender's `buffer_size` exceeds the
    /// buffer the caller allocates per message.
    #[error("message payload of {size} bytes exceeds the {capacity}-byte buffer")]
    MessageTooLarge {
        /// Advertised payload length.
        size: usize,
        /// Capacity of the buffer supplied by the caller.
        capacity: usize,
    },

    /// The connection was lost in the middle of a message.
    ///
    /// The partial payload is not surfaced; a reconnecting receiver
    /// resynchronizes from scratch with the next flushed buffer.
    #[error("connection lost mid-message")]
    Incomplete,

    /// The connection is closed: a clean end-of-stream between messages,
    /// or a receiver that is no longer connected.
    #[error("connection closed")]
    Closed,

    /// Transport-level error. The receiver is disconnected.
    #[error("transport error")]
    Io(#[from] io::Error),
}

enum Mode {
    /// Filling the fixed-size header scratch.
    AwaitingHeader {
        scratch: [u8; FRAME_HEADER_LEN],
        filled: usize,
    },
    /// Filling the caller's buffer with the advertised payload.
    AwaitingPayload { total: usize, remaining: usize },
    /// Skipping an oversized payload to stay aligned with the stream.
    Discarding { remaining: usize },
}

impl Mode {
    fn awaiting_header() -> Self {
        Self::AwaitingHeader {
            scratch: [0u8; FRAME_HEADER_LEN],
            filled: 0,
        }
    }
}

/// Resumable message assembly.
///
/// Exactly one of the header scratch or the caller's buffer is the active
/// write target at any time; `bytes remaining` survives across calls.
struct Assembler {
    mode: Mode,
}

impl Assembler {
    fn new() -> Self {
        Self {
            mode: Mode::awaiting_header(),
        }
    }

    /// Drives the state machine until one message is complete, returning
    /// its payload length.
    ///
    /// Cancellation-safe: dropping the future between reads loses nothing,
    /// and the next call resumes from the preserved state.
    async fn drive<R>(&mut self, reader: &mut R, buf: &mut [u8]) -> Result<usize, RecvError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match &mut self.mode {
                Mode::AwaitingHeader { scratch, filled } => {
                    if *filled == FRAME_HEADER_LEN {
                        let size = codec::decode_frame_header(scratch) as usize;
                        if size > buf.len() {
                            self.mode = Mode::Discarding { remaining: size };
                            return Err(RecvError::MessageTooLarge {
                                size,
                                capacity: buf.len(),
                            });
                        }
                        self.mode = Mode::AwaitingPayload {
                            total: size,
                            remaining: size,
                        };
                        continue;
                    }

                    let read = reader.read(&mut scratch[*filled..]).await?;
                    if read == 0 {
                        return Err(if *filled == 0 { RecvError::Closed } else { RecvError::Incomplete });
                    }
                    *filled += read;
                }

                Mode::AwaitingPayload { total, remaining } => {
                    if *remaining == 0 {
                        let total = *total;
                        self.mode = Mode::awaiting_header();
                        return Ok(total);
                    }

                    let at = *total - *remaining;
                    let read = reader.read(&mut buf[at..*total]).await?;
                    if read == 0 {
                        return Err(RecvError::Incomplete);
                    }
                    *remaining -= read;
                }

                Mode::Discarding { remaining } => {
                    let mut sink = [0u8; 4096];
                    let want = (*remaining).min(sink.len());
                    let read = reader.read(&mut sink[..want]).await?;
                    if read == 0 {
                        return Err(RecvError::Incomplete);
                    }
                    *remaining -= read;
                    if *remaining == 0 {
                        self.mode = Mode::awaiting_header();
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn mid_message(&self) -> bool {
        match &self.mode {
            Mode::AwaitingHeader { filled, .. } => *filled > 0,
            Mode::AwaitingPayload { .. } | Mode::Discarding { .. } => true,
        }
    }
}

/// Handle for receiving broadcast messages from a sender.
///
/// Each received message is one flushed buffer of the sender: the payload
/// lands in the caller's buffer and the individual records can be decoded
/// with [`records()`](crate::records).
///
/// # Examples
///
/// ```no_run
/// # use manifold::{receiver, records, Endpoint};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut rx = receiver(Endpoint::Tcp("127.0.0.1:7600".into())).connect().await?;
///
/// let mut buf = vec![0u8; 100_000];
/// loop {
///     let len = rx.recv(&mut buf).await?;
///     for record in records(&buf[..len]) {
///         println!("record: {:?}", record?);
///     }
/// }
/// # }
/// ```
pub struct Receiver {
    stream: Option<Stream>,
    assembler: Assembler,
    timeout: Option<Duration>,
}

impl Receiver {
    /// Sets the time budget for a single [`recv()`](Self::recv) call.
    /// `None` (the default) waits indefinitely.
    pub fn timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Whether the connection to the sender is still up.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Drops the connection. Any partially assembled message is lost.
    pub fn disconnect(&mut self) {
        self.stream = None;
        self.assembler = Assembler::new();
    }

    /// Receives the next message into `buf`, returning its payload length.
    ///
    /// The call suspends until a full message is available or the
    /// configured [`timeout`](Self::timeout) elapses. On
    /// [`RecvError::Timeout`] the partial message is retained, and the
    /// next call **with the same buffer** resumes the assembly; passing a
    /// different buffer mid-message loses the bytes already received.
    ///
    /// # Errors
    ///
    /// - [`RecvError::Timeout`]: more data needed, resume on the next call
    /// - [`RecvError::MessageTooLarge`]: advertised payload exceeds `buf`; the message is skipped
    /// - [`RecvError::Incomplete`]: connection lost mid-message; the receiver is disconnected
    /// - [`RecvError::Closed`]: clean end-of-stream, or recv after disconnect
    /// - [`RecvError::Io`]: transport error; the receiver is disconnected
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(RecvError::Closed);
        };

        let result = match self.timeout {
            Some(budget) => match tokio::time::timeout(budget, self.assembler.drive(stream, buf)).await {
                Ok(result) => result,
                Err(_) => return Err(RecvError::Timeout),
            },
            None => self.assembler.drive(stream, buf).await,
        };

        if matches!(result, Err(RecvError::Closed | RecvError::Incomplete | RecvError::Io(_))) {
            self.stream = None;
        }
        result
    }
}

/// Builder for configuring and connecting a [`Receiver`].
pub struct ReceiverBuilder {
    endpoint: Endpoint,
    timeout: Option<Duration>,
}

impl ReceiverBuilder {
    /// Sets the initial per-call receive budget; see [`Receiver::timeout`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connects to the sender.
    ///
    /// There is no automatic reconnection: when the connection is lost the
    /// receiver stays disconnected and a new one must be built. A
    /// reconnecting consumer joins mid-stream and resumes with the next
    /// buffer the sender flushes.
    pub async fn connect(self) -> io::Result<Receiver> {
        let stream = Stream::connect(&self.endpoint).await?;
        Ok(Receiver {
            stream: Some(stream),
            assembler: Assembler::new(),
            timeout: self.timeout,
        })
    }
}

/// Creates a new receiver for the sender listening on `endpoint`.
pub fn receiver(endpoint: Endpoint) -> ReceiverBuilder {
    ReceiverBuilder {
        endpoint,
        timeout: None,
    }
}
