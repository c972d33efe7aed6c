//! # Bus Arbiter
//!
//! Owns the [`SerialLink`] and every registered [`ClientConnection`], and is the only
//! code that drives the link. Each call to [`BusArbiter::schedule`] advances the current
//! bus turn as far as it can without blocking, fans received bus bytes out to all active
//! clients while the bus is idle, and hands the bus to the next client in round-robin
//! order once the previous turn has fully released the line.
//!
//! A turn transmits exactly the bytes the holder had buffered when the turn began.
//! Bytes read from its socket during the turn wait for its next turn, so no turn is
//! unbounded and no other client's bytes are spliced into the run.
use std::{
    io::{Read, Write},
    time::Instant,
};

use crate::{
    SerialTransport, TxEnable,
    client::{ClientConnection, ClientId, CloseReason},
    error::{BridgeError, LinkError},
    link::SerialLink,
};

/// Progress of the turn of the client holding the bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TurnStage {
    /// Waiting for the enable delay, or handing the run to the UART.
    Sending,
    /// Whole run accepted, waiting for the last bit to leave the wire.
    Flushing,
    /// Transmit-enable disable delay running.
    Releasing,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusState {
    Free,
    Held {
        holder: ClientId,
        /// Bytes of the run not yet accepted by the UART.
        remaining: usize,
        stage: TurnStage,
    },
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ArbiterStats {
    pub bytes_to_bus: u64,
    pub bytes_from_bus: u64,
    pub turns: u64,
    pub failed_turns: u64,
}

pub struct BusArbiter<U, P, S> {
    link: SerialLink<U, P>,
    clients: Vec<ClientConnection<S>>,
    bus: BusState,
    last_served: Option<ClientId>,
    outbound_limit: usize,
    rx_burst: usize,
    stats: ArbiterStats,
}

impl<U, P, S> BusArbiter<U, P, S>
where
    U: SerialTransport,
    P: TxEnable,
    S: Read + Write,
{
    pub fn new(link: SerialLink<U, P>, outbound_limit: usize, rx_burst: usize) -> Self {
        BusArbiter {
            link,
            clients: Vec::new(),
            bus: BusState::Free,
            last_served: None,
            outbound_limit,
            rx_burst,
            stats: ArbiterStats::default(),
        }
    }

    pub fn link(&self) -> &SerialLink<U, P> {
        &self.link
    }

    pub fn bus(&self) -> BusState {
        self.bus
    }

    pub fn holder(&self) -> Option<ClientId> {
        match self.bus {
            BusState::Free => None,
            BusState::Held { holder, .. } => Some(holder),
        }
    }

    /// Whether no turn is in progress and the transceiver is receiving.
    pub fn is_quiescent(&self) -> bool {
        self.bus == BusState::Free && self.link.is_idle()
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.link.deadline()
    }

    /// Registered clients in connection order.
    pub fn clients(&self) -> &[ClientConnection<S>] {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut [ClientConnection<S>] {
        &mut self.clients
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientConnection<S>> {
        self.clients.iter().find(|c| c.id() == id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn register(&mut self, client: ClientConnection<S>) {
        self.clients.push(client);
    }

    /// Deregisters every client that is no longer active and returns them closed.
    ///
    /// A holder removed mid-turn keeps its slot in [`BusState::Held`] until the link is
    /// idle again; only the bytes the UART already accepted are still transmitted.
    pub fn remove_closed(&mut self) -> Vec<ClientConnection<S>> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.clients.len() {
            if self.clients[index].is_active() {
                index += 1;
            } else {
                let mut client = self.clients.remove(index);
                client.finish_close();
                removed.push(client);
            }
        }
        removed
    }

    /// Runs one scheduling pass over the bus.
    pub fn schedule(&mut self, now: Instant) -> Result<(), BridgeError> {
        self.link.advance(now)?;
        self.run_turn(now)?;
        if self.bus == BusState::Free && self.link.is_idle() {
            self.fan_out()?;
            if let Some(id) = self.select_next() {
                self.start_turn(id, now)?;
                self.run_turn(now)?;
            }
        }
        Ok(())
    }

    /// Next client with buffered bytes after the one served last, wrapping around.
    /// Client ids grow with connection order, so this also works after the last
    /// served client has been removed.
    fn select_next(&self) -> Option<ClientId> {
        let eligible = |c: &&ClientConnection<S>| c.is_active() && !c.inbound().is_empty();
        let last = self.last_served;
        self.clients
            .iter()
            .filter(eligible)
            .find(|c| last.is_none_or(|last| c.id() > last))
            .or_else(|| self.clients.iter().find(eligible))
            .map(|c| c.id())
    }

    fn start_turn(&mut self, id: ClientId, now: Instant) -> Result<(), BridgeError> {
        let remaining = self.client(id).map_or(0, |c| c.inbound().len());
        self.link.begin_transmit(now)?;
        self.bus = BusState::Held {
            holder: id,
            remaining,
            stage: TurnStage::Sending,
        };
        self.last_served = Some(id);
        log::debug!("Client {} holds the bus for {} bytes", id, remaining);
        Ok(())
    }

    fn run_turn(&mut self, now: Instant) -> Result<(), BridgeError> {
        loop {
            let BusState::Held {
                holder,
                remaining,
                stage,
            } = self.bus
            else {
                return Ok(());
            };
            match stage {
                TurnStage::Sending => {
                    if !self.link.is_transmitting() {
                        return Ok(());
                    }
                    let remaining = match self.send_run(holder, remaining) {
                        Ok(remaining) => remaining,
                        Err(LinkError::Transport(e)) => {
                            self.fail_turn(holder, now, e)?;
                            continue;
                        }
                        Err(other) => return Err(other.into()),
                    };
                    let stage = if remaining == 0 {
                        TurnStage::Flushing
                    } else {
                        TurnStage::Sending
                    };
                    self.bus = BusState::Held {
                        holder,
                        remaining,
                        stage,
                    };
                    if remaining > 0 {
                        return Ok(());
                    }
                }
                TurnStage::Flushing => match self.link.is_transmit_complete() {
                    Ok(false) => return Ok(()),
                    Ok(true) => {
                        self.link.end_transmit(now)?;
                        self.bus = BusState::Held {
                            holder,
                            remaining: 0,
                            stage: TurnStage::Releasing,
                        };
                    }
                    Err(LinkError::Transport(e)) => self.fail_turn(holder, now, e)?,
                    Err(other) => return Err(other.into()),
                },
                TurnStage::Releasing => {
                    if self.link.is_idle() {
                        self.bus = BusState::Free;
                        self.stats.turns += 1;
                        log::debug!("Client {} released the bus", holder);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Hands as much of the holder's run to the UART as it takes right now.
    /// Returns how much of the run is left.
    fn send_run(&mut self, holder: ClientId, mut remaining: usize) -> Result<usize, LinkError> {
        let Some(client) = self
            .clients
            .iter_mut()
            .find(|c| c.id() == holder && c.is_active())
        else {
            if remaining > 0 {
                log::debug!(
                    "Client {} went away mid-turn, discarding {} unsent bytes",
                    holder,
                    remaining
                );
            }
            return Ok(0);
        };
        while remaining > 0 {
            let run = client.inbound().front(remaining);
            let accepted = match self.link.send(run) {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.bus = BusState::Held {
                        holder,
                        remaining,
                        stage: TurnStage::Sending,
                    };
                    return Err(e);
                }
            };
            if accepted == 0 {
                break;
            }
            client.inbound_mut().consume(accepted);
            remaining -= accepted;
            self.stats.bytes_to_bus += accepted as u64;
        }
        Ok(remaining)
    }

    /// A UART failure ends the turn. Nothing is retried: the unsent rest of the run is
    /// dropped and the line released.
    fn fail_turn(
        &mut self,
        holder: ClientId,
        now: Instant,
        error: std::io::Error,
    ) -> Result<(), BridgeError> {
        let remaining = match self.bus {
            BusState::Held { remaining, .. } => remaining,
            BusState::Free => 0,
        };
        log::warn!(
            "Transmit failed for client {}: {}, dropping {} bytes of its turn",
            holder,
            error,
            remaining
        );
        if let Some(client) = self.clients.iter_mut().find(|c| c.id() == holder) {
            client.inbound_mut().consume(remaining);
        }
        self.link.abort_transmit(now)?;
        self.stats.failed_turns += 1;
        self.bus = BusState::Held {
            holder,
            remaining: 0,
            stage: TurnStage::Releasing,
        };
        Ok(())
    }

    /// Broadcasts everything received from the bus to every active client.
    fn fan_out(&mut self) -> Result<(), BridgeError> {
        for chunk in self.link.poll_receive(self.rx_burst) {
            let chunk = chunk.map_err(BridgeError::Serial)?;
            self.stats.bytes_from_bus += chunk.len() as u64;
            log::trace!("Bus received {:02x?}", &chunk[..]);
            let mut delivered = false;
            for client in self.clients.iter_mut().filter(|c| c.is_active()) {
                delivered = true;
                if !client.queue_outbound(chunk.clone(), self.outbound_limit) {
                    log::warn!(
                        "Client {} ({}) is not reading bus data fast enough, closing",
                        client.id(),
                        client.peer()
                    );
                    client.close(CloseReason::SlowConsumer);
                }
            }
            if !delivered {
                log::debug!(
                    "No TCP clients connected, discarding {} bus bytes",
                    chunk.len()
                );
            }
        }
        Ok(())
    }

    /// Forces the transceiver into receive mode and forgets any turn in progress.
    pub fn release(&mut self) -> Result<(), BridgeError> {
        self.link.release()?;
        self.bus = BusState::Free;
        Ok(())
    }
}
