use std::{
    collections::VecDeque,
    fmt::Display,
    io::{self, ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes};

use crate::buffer::InboundBuffer;

const READ_CHUNK_SIZE: usize = 128;

/// Identifies a client for as long as the bridge runs. Never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClientId(pub u64);

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    Connecting,
    Active,
    /// Closed by us or the peer; pending outbound bytes have been discarded.
    Closing,
    /// Buffers released. The connection is about to be dropped.
    Closed,
}

/// Why a client stopped being serviced.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    PeerClosed,
    Timeout,
    ReadError(ErrorKind),
    WriteError(ErrorKind),
    /// The client did not read bus traffic fast enough and its backlog hit the limit.
    SlowConsumer,
    Shutdown,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::Timeout => write!(f, "idle timeout"),
            CloseReason::ReadError(kind) => write!(f, "read error: {}", kind),
            CloseReason::WriteError(kind) => write!(f, "write error: {}", kind),
            CloseReason::SlowConsumer => write!(f, "outbound backlog limit exceeded"),
            CloseReason::Shutdown => write!(f, "bridge shutting down"),
        }
    }
}

/// Result of servicing a client's read side.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// Nothing was available.
    Idle,
    Received(usize),
    /// The inbound buffer is full; the socket is left unread until the bus drains it.
    Backpressured,
    Closed(CloseReason),
}

/// One accepted network stream.
///
/// `S` is a non-blocking stream: [`ErrorKind::WouldBlock`] means no progress is possible
/// right now, and a read of zero bytes means the peer has closed.
pub struct ClientConnection<S> {
    id: ClientId,
    peer: String,
    stream: S,
    state: ClientState,
    inbound: InboundBuffer,
    outbound: VecDeque<Bytes>,
    outbound_len: usize,
    last_activity: Instant,
    close_reason: Option<CloseReason>,
}

impl<S: Read + Write> ClientConnection<S> {
    pub fn new(
        id: ClientId,
        peer: impl Into<String>,
        stream: S,
        buffer_size: usize,
        now: Instant,
    ) -> ClientConnection<S> {
        ClientConnection {
            id,
            peer: peer.into(),
            stream,
            state: ClientState::Connecting,
            inbound: InboundBuffer::new(buffer_size),
            outbound: VecDeque::new(),
            outbound_len: 0,
            last_activity: now,
            close_reason: None,
        }
    }

    /// Completes the accept handshake.
    pub fn activate(&mut self) {
        if self.state == ClientState::Connecting {
            self.state = ClientState::Active;
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ClientState::Active
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn inbound(&self) -> &InboundBuffer {
        &self.inbound
    }

    pub fn inbound_mut(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }

    /// Bytes queued for this client that the network has not taken yet.
    pub fn outbound_len(&self) -> usize {
        self.outbound_len
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Whether the client has been silent for longer than `timeout`.
    /// A zero timeout never expires.
    pub fn is_idle_since(&self, now: Instant, timeout: Duration) -> bool {
        !timeout.is_zero() && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Moves bytes from the socket into the inbound buffer, never more than fits.
    pub fn read_from_stream(&mut self, now: Instant) -> ReadOutcome {
        if !self.is_active() {
            return ReadOutcome::Idle;
        }
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        while !self.inbound.is_full() {
            let len = self.inbound.free().min(READ_CHUNK_SIZE);
            match self.stream.read(&mut chunk[..len]) {
                Ok(0) => {
                    self.close(CloseReason::PeerClosed);
                    return ReadOutcome::Closed(CloseReason::PeerClosed);
                }
                Ok(count) => {
                    self.inbound
                        .push(&chunk[..count])
                        .expect("Read should be bounded by the free inbound space");
                    log::trace!("Client {} sent {:02x?}", self.id, &chunk[..count]);
                    self.last_activity = now;
                    total += count;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let reason = CloseReason::ReadError(e.kind());
                    self.close(reason);
                    return ReadOutcome::Closed(reason);
                }
            }
        }
        if total > 0 {
            ReadOutcome::Received(total)
        } else if self.inbound.is_full() {
            ReadOutcome::Backpressured
        } else {
            ReadOutcome::Idle
        }
    }

    /// Queues bus bytes for delivery to this client.
    ///
    /// Returns `false`, and queues nothing, if the backlog would exceed `limit`.
    pub fn queue_outbound(&mut self, chunk: Bytes, limit: usize) -> bool {
        if !self.is_active() {
            return true;
        }
        if self.outbound_len + chunk.len() > limit {
            return false;
        }
        self.outbound_len += chunk.len();
        self.outbound.push_back(chunk);
        true
    }

    /// Writes as much of the outbound backlog as the socket takes without blocking.
    pub fn write_to_stream(&mut self, now: Instant) -> io::Result<usize> {
        let mut total = 0;
        while self.is_active() {
            let Some(front) = self.outbound.front_mut() else {
                break;
            };
            match self.stream.write(front) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(count) => {
                    front.advance(count);
                    if front.is_empty() {
                        self.outbound.pop_front();
                    }
                    self.outbound_len -= count;
                    self.last_activity = now;
                    total += count;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Stops servicing the client and discards everything still queued towards it.
    pub fn close(&mut self, reason: CloseReason) {
        if matches!(self.state, ClientState::Connecting | ClientState::Active) {
            self.state = ClientState::Closing;
            self.close_reason = Some(reason);
            self.outbound.clear();
            self.outbound_len = 0;
        }
    }

    /// Releases the buffers of a closing client.
    pub fn finish_close(&mut self) {
        if self.state == ClientState::Closing {
            self.inbound = InboundBuffer::new(0);
            self.outbound = VecDeque::new();
            self.state = ClientState::Closed;
        }
    }
}
