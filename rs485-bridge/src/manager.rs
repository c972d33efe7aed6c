//! # Connection Manager
//!
//! Accepts clients up to the configured limit, moves bytes between sockets and the
//! clients' buffers, and evicts clients that stay silent past the idle timeout.
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{TcpListener, TcpStream},
    time::{Duration, Instant},
};

use crate::{
    SerialTransport, TxEnable,
    arbiter::BusArbiter,
    client::{ClientConnection, ClientId, CloseReason, ReadOutcome},
};

/// Source of new client connections.
pub trait Acceptor {
    /// A non-blocking stream.
    type Stream: Read + Write;

    /// Returns the next pending connection and a label identifying the peer,
    /// or `None` when there is none. Must not block.
    fn accept(&mut self) -> io::Result<Option<(Self::Stream, String)>>;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> io::Result<Option<(TcpStream, String)>> {
        let (stream, addr) = match TcpListener::accept(self) {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        stream.set_nonblocking(true)?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not disable Nagle for {}: {}", addr, e);
        }
        Ok(Some((stream, addr.to_string())))
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ManagerStats {
    pub accepted: u64,
    pub refused: u64,
    pub timed_out: u64,
    pub disconnected: u64,
}

pub struct ConnectionManager<A> {
    acceptor: A,
    buffer_size: usize,
    max_clients: usize,
    client_timeout: Duration,
    next_id: u64,
    accepting: bool,
    stats: ManagerStats,
}

impl<A: Acceptor> ConnectionManager<A> {
    pub fn new(
        acceptor: A,
        buffer_size: usize,
        max_clients: usize,
        client_timeout: Duration,
    ) -> ConnectionManager<A> {
        ConnectionManager {
            acceptor,
            buffer_size,
            max_clients,
            client_timeout,
            next_id: 1,
            accepting: true,
            stats: ManagerStats::default(),
        }
    }

    pub fn acceptor(&self) -> &A {
        &self.acceptor
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// Stops taking new connections. Pending ones stay in the listen queue.
    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    /// Accepts pending connections, at most one more than the client limit per pass.
    /// Connections beyond the limit are closed immediately.
    pub fn accept_pending<U, P>(
        &mut self,
        arbiter: &mut BusArbiter<U, P, A::Stream>,
        now: Instant,
    ) where
        U: SerialTransport,
        P: TxEnable,
    {
        let mut budget = self.max_clients + 1;
        while self.accepting && budget > 0 {
            budget -= 1;
            let (stream, peer) = match self.acceptor.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Connection error: {}", e);
                    break;
                }
            };
            if arbiter.client_count() >= self.max_clients {
                log::warn!(
                    "Connection limit of {} reached, refusing client {}",
                    self.max_clients,
                    peer
                );
                self.stats.refused += 1;
                drop(stream);
                continue;
            }
            let id = ClientId(self.next_id);
            self.next_id += 1;
            let mut client = ClientConnection::new(id, peer, stream, self.buffer_size, now);
            client.activate();
            log::info!(
                "New client connection {} from {} (total clients: {})",
                id,
                client.peer(),
                arbiter.client_count() + 1
            );
            self.stats.accepted += 1;
            arbiter.register(client);
        }
    }

    /// Reads from every active client into its inbound buffer.
    pub fn service_reads<U, P>(&mut self, arbiter: &mut BusArbiter<U, P, A::Stream>, now: Instant)
    where
        U: SerialTransport,
        P: TxEnable,
    {
        for client in arbiter.clients_mut() {
            match client.read_from_stream(now) {
                ReadOutcome::Backpressured => {
                    log::trace!("Client {} inbound buffer full, pausing reads", client.id());
                }
                ReadOutcome::Closed(CloseReason::PeerClosed) => {
                    log::debug!("Client {} closed the connection", client.id());
                }
                ReadOutcome::Closed(reason) => {
                    log::warn!("Client {} ({}): {}", client.id(), client.peer(), reason);
                }
                ReadOutcome::Idle | ReadOutcome::Received(_) => {}
            }
        }
    }

    /// Closes every active client that has been silent for longer than the timeout.
    pub fn evict_idle<U, P>(&mut self, arbiter: &mut BusArbiter<U, P, A::Stream>, now: Instant)
    where
        U: SerialTransport,
        P: TxEnable,
    {
        for client in arbiter.clients_mut() {
            if client.is_active() && client.is_idle_since(now, self.client_timeout) {
                log::warn!(
                    "Client {} ({}) timed out after {}ms of inactivity",
                    client.id(),
                    client.peer(),
                    now.saturating_duration_since(client.last_activity())
                        .as_millis()
                );
                client.close(CloseReason::Timeout);
            }
        }
    }

    /// Writes queued bus bytes to every active client.
    pub fn service_writes<U, P>(&mut self, arbiter: &mut BusArbiter<U, P, A::Stream>, now: Instant)
    where
        U: SerialTransport,
        P: TxEnable,
    {
        for client in arbiter.clients_mut() {
            if let Err(e) = client.write_to_stream(now) {
                log::warn!("Client {} ({}) write failed: {}", client.id(), client.peer(), e);
                client.close(CloseReason::WriteError(e.kind()));
            }
        }
    }

    /// Closes every client, e.g. on shutdown.
    pub fn close_all<U, P>(
        &mut self,
        arbiter: &mut BusArbiter<U, P, A::Stream>,
        reason: CloseReason,
    ) where
        U: SerialTransport,
        P: TxEnable,
    {
        for client in arbiter.clients_mut() {
            client.close(reason);
        }
    }

    /// Deregisters closed clients, freeing their slots.
    pub fn remove_closed<U, P>(&mut self, arbiter: &mut BusArbiter<U, P, A::Stream>)
    where
        U: SerialTransport,
        P: TxEnable,
    {
        for client in arbiter.remove_closed() {
            match client.close_reason() {
                Some(CloseReason::Timeout) => self.stats.timed_out += 1,
                _ => self.stats.disconnected += 1,
            }
            log::info!(
                "Client {} ({}) disconnected: {} (total clients: {})",
                client.id(),
                client.peer(),
                client
                    .close_reason()
                    .map_or_else(|| "closed".to_string(), |r| r.to_string()),
                arbiter.client_count()
            );
        }
    }
}
