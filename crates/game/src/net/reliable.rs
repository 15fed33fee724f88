use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mio::Waker;

use super::error::{is_peer_close, is_would_block, ChannelError};
use super::protocol::{declared_length, Message, ProtocolError, HEADER_SIZE};
use super::stats::NetworkStats;

const READ_CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// Flush what is queued, then close.
    Closing,
    Closed,
}

/// Outbound frames waiting for the connection's writer. Clones share the same
/// queue, so any thread can enqueue while only the I/O thread pops.
#[derive(Debug, Clone)]
pub struct Outbox {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    waker: Option<Arc<Waker>>,
}

impl Outbox {
    pub fn new(waker: Option<Arc<Waker>>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            waker,
        }
    }

    pub fn enqueue(&self, message: &Message) -> Result<(), ProtocolError> {
        let frame = message.encode()?;
        self.enqueue_frame(frame);
        Ok(())
    }

    pub fn enqueue_frame(&self, frame: Vec<u8>) {
        self.lock().push_back(frame);

        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake writer: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
enum Fill {
    Complete(Vec<u8>),
    Incomplete,
    Closed,
}

/// Accumulates one frame across reads: the header first, then the payload
/// it declares. Never reads past the end of the current frame.
#[derive(Debug, Default)]
struct FrameReader {
    buf: Vec<u8>,
    expected: Option<usize>,
}

impl FrameReader {
    fn fill<R: Read>(&mut self, src: &mut R) -> Result<Fill, ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let target = self.expected.unwrap_or(HEADER_SIZE);
            if self.buf.len() == target {
                match self.expected {
                    None => {
                        let declared = declared_length(&[self.buf[0], self.buf[1]]);
                        if declared < HEADER_SIZE {
                            return Err(ChannelError::Corrupt(declared));
                        }
                        self.expected = Some(declared);
                        continue;
                    }
                    Some(_) => {
                        self.expected = None;
                        return Ok(Fill::Complete(std::mem::take(&mut self.buf)));
                    }
                }
            }

            let want = (target - self.buf.len()).min(chunk.len());
            match src.read(&mut chunk[..want]) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if is_would_block(&e) => return Ok(Fill::Incomplete),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_peer_close(&e) => return Ok(Fill::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug)]
struct InFlight {
    frame: Vec<u8>,
    sent: usize,
}

#[derive(Debug, PartialEq)]
pub enum ReadStatus {
    Message(Message),
    /// Not enough bytes for a full message yet.
    Incomplete,
    /// The peer closed or reset the connection.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Sent,
    Blocked,
    Idle,
    Closed,
}

/// One ordered byte-stream connection: frame reassembly on the way in, a
/// FIFO of encoded frames with partial-send tracking on the way out.
pub struct ReliableChannel<S> {
    stream: S,
    state: ChannelState,
    reader: FrameReader,
    outbox: Outbox,
    in_flight: Option<InFlight>,
    writable: bool,
    stats: Arc<NetworkStats>,
}

impl<S: Read + Write> ReliableChannel<S> {
    pub fn open(stream: S, outbox: Outbox, stats: Arc<NetworkStats>) -> Self {
        Self {
            stream,
            state: ChannelState::Open,
            reader: FrameReader::default(),
            outbox,
            in_flight: None,
            writable: true,
            stats,
        }
    }

    /// A channel whose connect is still in progress. Nothing is written until
    /// [`mark_connected`](Self::mark_connected).
    pub fn connecting(stream: S, outbox: Outbox, stats: Arc<NetworkStats>) -> Self {
        Self {
            state: ChannelState::Connecting,
            writable: false,
            ..Self::open(stream, outbox, stats)
        }
    }

    pub fn mark_connected(&mut self) {
        if self.state == ChannelState::Connecting {
            self.state = ChannelState::Open;
            self.writable = true;
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Bytes of a partially received frame currently held.
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    /// Nothing queued and nothing half-sent.
    pub fn is_drained(&self) -> bool {
        self.in_flight.is_none() && self.outbox.is_empty()
    }

    pub fn begin_close(&mut self) {
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Closing;
        }
    }

    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
    }

    /// Reads until one complete message is available or the socket has no
    /// more bytes. Frames that fail to decode are dropped and reading goes on.
    pub fn read(&mut self) -> Result<ReadStatus, ChannelError> {
        if self.state == ChannelState::Closed {
            return Ok(ReadStatus::Closed);
        }

        loop {
            let fill = match self.reader.fill(&mut self.stream) {
                Ok(fill) => fill,
                Err(e) => {
                    self.state = ChannelState::Closed;
                    return Err(e);
                }
            };

            match fill {
                Fill::Complete(frame) => {
                    self.stats.record_received(frame.len());
                    match Message::decode(&frame) {
                        Ok(message) => return Ok(ReadStatus::Message(message)),
                        Err(e) => {
                            self.stats.record_malformed();
                            log::warn!("Discarding malformed message: {}", e);
                        }
                    }
                }
                Fill::Incomplete => return Ok(ReadStatus::Incomplete),
                Fill::Closed => {
                    self.state = ChannelState::Closed;
                    return Ok(ReadStatus::Closed);
                }
            }
        }
    }

    /// Delivers every complete message currently readable. Returns `false`
    /// once the peer has closed.
    pub fn drain_inbound(
        &mut self,
        mut deliver: impl FnMut(Message),
    ) -> Result<bool, ChannelError> {
        loop {
            match self.read()? {
                ReadStatus::Message(message) => deliver(message),
                ReadStatus::Incomplete => return Ok(true),
                ReadStatus::Closed => return Ok(false),
            }
        }
    }

    /// Sends at most one queued message, resuming a partial send first.
    pub fn write(&mut self) -> Result<WriteStatus, ChannelError> {
        match self.state {
            ChannelState::Closed => return Ok(WriteStatus::Closed),
            ChannelState::Connecting => return Ok(WriteStatus::Blocked),
            ChannelState::Open | ChannelState::Closing => {}
        }
        if !self.writable {
            return Ok(WriteStatus::Blocked);
        }

        let mut flight = match self.in_flight.take() {
            Some(flight) => flight,
            None => match self.outbox.pop() {
                Some(frame) => InFlight { frame, sent: 0 },
                None => return Ok(WriteStatus::Idle),
            },
        };

        loop {
            match self.stream.write(&flight.frame[flight.sent..]) {
                Ok(0) => {
                    self.state = ChannelState::Closed;
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    flight.sent += n;
                    if flight.sent == flight.frame.len() {
                        self.stats.record_sent(flight.frame.len());
                        return Ok(WriteStatus::Sent);
                    }
                }
                Err(e) if is_would_block(&e) => {
                    self.writable = false;
                    self.in_flight = Some(flight);
                    return Ok(WriteStatus::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_peer_close(&e) => {
                    self.state = ChannelState::Closed;
                    return Ok(WriteStatus::Closed);
                }
                Err(e) => {
                    self.state = ChannelState::Closed;
                    return Err(e.into());
                }
            }
        }
    }

    /// Writes queued messages until the first would-block or an empty queue.
    pub fn flush(&mut self) -> Result<WriteStatus, ChannelError> {
        loop {
            match self.write()? {
                WriteStatus::Sent => continue,
                status => return Ok(status),
            }
        }
    }
}
