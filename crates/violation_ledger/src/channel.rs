//! One-way attribution channel from the test controller to the violation handler.
//!
//! Each announcement is a frame: a 4-byte big-endian payload length followed by
//! the JSON encoding of a [`Violator`]. Field values may contain any character,
//! including the bytes of the header itself, without confusing the decoder.
//!
//! The reader polls with a bounded timeout and reads at most
//! [`MAX_RECORD_SIZE`] bytes per poll. Only the most recent complete frame is
//! surfaced; earlier frames from the same poll are discarded, and a trailing
//! partial frame is kept until the rest of it arrives.
//!
//! Backpressure: the writer never blocks past its write timeout. A frame that
//! could not be started is dropped with [`LedgerError::ChannelFull`]; a frame
//! that was cut short keeps its unsent tail and completes it before the next
//! frame, so the byte stream never loses alignment.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{LedgerError, Result};
use crate::violator::Violator;

/// Largest frame, header included, that may cross the channel.
pub const MAX_RECORD_SIZE: usize = 1024;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

const HEADER_LEN: usize = 4;

/// Write side of a byte transport.
pub trait ByteSink: Send {
    /// Writes a prefix of `bytes` and returns its length. Fails with
    /// `WouldBlock` or `TimedOut` when the transport has no room.
    fn write_some(&mut self, bytes: &[u8]) -> io::Result<usize>;
}

/// Read side of a byte transport.
pub trait ByteSource: Send {
    /// Reads whatever arrives within `timeout` into `buf`. Returns `Ok(0)`
    /// when nothing arrived or the write side is gone.
    fn try_recv(&mut self, timeout: Duration, buf: &mut [u8]) -> io::Result<usize>;
}

pub fn encode_frame(violator: &Violator) -> Result<Vec<u8>> {
    violator.validate()?;
    let payload = serde_json::to_vec(violator)?;
    let size = payload.len() + HEADER_LEN;
    if size > MAX_RECORD_SIZE {
        return Err(LedgerError::RecordTooLarge {
            size,
            limit: MAX_RECORD_SIZE,
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| LedgerError::RecordTooLarge {
        size,
        limit: MAX_RECORD_SIZE,
    })?;

    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder that survives partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    skip: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns the last complete, well-formed violator
    /// they finish, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Violator> {
        self.pending.extend_from_slice(bytes);
        let mut latest = None;

        loop {
            if self.skip > 0 {
                let dropped = self.skip.min(self.pending.len());
                self.pending.drain(..dropped);
                self.skip -= dropped;
                if self.skip > 0 {
                    break;
                }
            }

            let Some(header) = self.pending.first_chunk::<HEADER_LEN>() else {
                break;
            };
            let length = u32::from_be_bytes(*header) as usize;

            if length.saturating_add(HEADER_LEN) > MAX_RECORD_SIZE {
                tracing::warn!(
                    length,
                    limit = MAX_RECORD_SIZE,
                    "oversized attribution frame discarded"
                );
                self.pending.drain(..HEADER_LEN);
                self.skip = length;
                continue;
            }

            if self.pending.len() < HEADER_LEN + length {
                break;
            }

            let frame = self.pending.drain(..HEADER_LEN + length).collect::<Vec<_>>();
            match decode_payload(&frame[HEADER_LEN..]) {
                Ok(violator) => latest = Some(violator),
                Err(error) => tracing::warn!(%error, "malformed attribution frame discarded"),
            }
        }

        latest
    }

    /// Bytes of an incomplete frame waiting for the rest of their payload.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_payload(payload: &[u8]) -> Result<Violator> {
    let violator = serde_json::from_slice::<Violator>(payload)?;
    violator.validate()?;
    Ok(violator)
}

/// Controller-side handle that announces the running test.
pub struct AttributionSender {
    sink: Box<dyn ByteSink>,
    backlog: Vec<u8>,
}

impl AttributionSender {
    pub fn new(sink: impl ByteSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            backlog: Vec::new(),
        }
    }

    pub fn publish(&mut self, violator: &Violator) -> Result<()> {
        let frame = encode_frame(violator)?;
        let size = frame.len();

        if !self.backlog.is_empty() {
            match self.flush_backlog() {
                Ok(()) => {}
                Err(LedgerError::ChannelFull { .. }) => {
                    return Err(LedgerError::ChannelFull { size });
                }
                Err(error) => return Err(error),
            }
        }

        self.backlog = frame;
        if let Err(error) = self.flush_backlog() {
            if self.backlog.len() == size {
                // Nothing of this frame reached the channel; drop it whole.
                self.backlog.clear();
            }
            return Err(error);
        }
        Ok(())
    }

    fn flush_backlog(&mut self) -> Result<()> {
        while !self.backlog.is_empty() {
            match self.sink.write_some(&self.backlog) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(written) => {
                    self.backlog.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(LedgerError::ChannelFull {
                        size: self.backlog.len(),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Bytes of a previously interrupted frame still waiting to be written.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Handler-side end of the channel.
pub struct AttributionReceiver {
    source: Box<dyn ByteSource>,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl AttributionReceiver {
    pub fn new(source: impl ByteSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            decoder: FrameDecoder::new(),
            buf: vec![0; MAX_RECORD_SIZE],
        }
    }

    /// Reads up to [`MAX_RECORD_SIZE`] raw bytes within `timeout`. A closed
    /// channel and a failed read both count as no data.
    pub fn poll(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        match self.source.try_recv(timeout, &mut self.buf) {
            Ok(0) => None,
            Ok(read) => Some(self.buf[..read].to_vec()),
            Err(error) => {
                tracing::debug!(%error, "attribution channel read failed");
                None
            }
        }
    }

    /// Polls and decodes the newest complete violator. A poll that fills the
    /// whole read buffer is followed by non-waiting polls until the backlog
    /// is drained.
    pub fn recv_latest(&mut self, timeout: Duration) -> Option<Violator> {
        let mut bytes = self.poll(timeout)?;
        let mut latest = None;
        loop {
            let full = bytes.len() == self.buf.len();
            if let Some(violator) = self.decoder.push(&bytes) {
                latest = Some(violator);
            }
            if !full {
                break;
            }
            match self.poll(Duration::ZERO) {
                Some(more) => bytes = more,
                None => break,
            }
        }
        latest
    }
}

#[derive(Debug)]
struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
}

type SharedPipe = Arc<(Mutex<PipeState>, Condvar)>;

fn poisoned() -> io::Error {
    io::Error::other("attribution pipe lock poisoned")
}

/// Write end of an in-process bounded pipe.
#[derive(Debug)]
pub struct MemoryPipeWriter {
    shared: SharedPipe,
}

/// Read end of an in-process bounded pipe.
#[derive(Debug)]
pub struct MemoryPipeReader {
    shared: SharedPipe,
}

/// Bounded in-process byte pipe with the same semantics as a socket pair.
#[must_use]
pub fn memory_pipe(capacity: usize) -> (MemoryPipeWriter, MemoryPipeReader) {
    let shared = Arc::new((
        Mutex::new(PipeState {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            writer_closed: false,
        }),
        Condvar::new(),
    ));
    (
        MemoryPipeWriter {
            shared: Arc::clone(&shared),
        },
        MemoryPipeReader { shared },
    )
}

impl ByteSink for MemoryPipeWriter {
    fn write_some(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let (lock, ready) = &*self.shared;
        let mut state = lock.lock().map_err(|_| poisoned())?;
        let free = state.capacity.saturating_sub(state.buf.len());
        if free == 0 && !bytes.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let written = free.min(bytes.len());
        state.buf.extend(&bytes[..written]);
        ready.notify_all();
        Ok(written)
    }
}

impl Drop for MemoryPipeWriter {
    fn drop(&mut self) {
        let (lock, ready) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.writer_closed = true;
        }
        ready.notify_all();
    }
}

impl ByteSource for MemoryPipeReader {
    fn try_recv(&mut self, timeout: Duration, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, ready) = &*self.shared;
        let mut state = lock.lock().map_err(|_| poisoned())?;
        if state.buf.is_empty() && !state.writer_closed {
            state = ready
                .wait_timeout(state, timeout)
                .map_err(|_| poisoned())?
                .0;
        }
        let read = buf.len().min(state.buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..read)) {
            *slot = byte;
        }
        Ok(read)
    }
}

/// In-process channel over a bounded pipe of `capacity` bytes.
#[must_use]
pub fn memory_channel(capacity: usize) -> (AttributionSender, AttributionReceiver) {
    let (writer, reader) = memory_pipe(capacity);
    (
        AttributionSender::new(writer),
        AttributionReceiver::new(reader),
    )
}

#[cfg(unix)]
mod socket {
    use std::io::{self, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::{AttributionReceiver, AttributionSender, ByteSink, ByteSource};

    const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

    impl ByteSink for UnixStream {
        fn write_some(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.write(bytes)
        }
    }

    impl ByteSource for UnixStream {
        fn try_recv(&mut self, timeout: Duration, buf: &mut [u8]) -> io::Result<usize> {
            // A zero timeout means "block forever" to the OS.
            self.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
            match self.read(buf) {
                Ok(read) => Ok(read),
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    Ok(0)
                }
                Err(error) => Err(error),
            }
        }
    }

    /// Connected socket pair. Both ends survive `fork`, so the sender may live
    /// in the controller and the receiver in the traced worker or vice versa.
    pub fn socket_channel(
        write_timeout: Duration,
    ) -> io::Result<(AttributionSender, AttributionReceiver)> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_write_timeout(Some(write_timeout.max(MIN_READ_TIMEOUT)))?;
        Ok((
            AttributionSender::new(writer),
            AttributionReceiver::new(reader),
        ))
    }
}

#[cfg(unix)]
pub use socket::socket_channel;
