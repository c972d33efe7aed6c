use std::{fmt::Display, time::Instant};

use crate::{
    SerialTransport, TxEnable,
    arbiter::{ArbiterStats, BusArbiter},
    client::CloseReason,
    config::BridgeConfig,
    error::BridgeError,
    link::SerialLink,
    manager::{Acceptor, ConnectionManager, ManagerStats},
};

/// Counters over the lifetime of a [`Bridge`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BridgeStats {
    pub bytes_to_bus: u64,
    pub bytes_from_bus: u64,
    pub turns: u64,
    pub failed_turns: u64,
    pub clients_accepted: u64,
    pub clients_refused: u64,
    pub clients_timed_out: u64,
    pub clients_disconnected: u64,
}

impl BridgeStats {
    fn combine(arbiter: ArbiterStats, manager: ManagerStats) -> BridgeStats {
        BridgeStats {
            bytes_to_bus: arbiter.bytes_to_bus,
            bytes_from_bus: arbiter.bytes_from_bus,
            turns: arbiter.turns,
            failed_turns: arbiter.failed_turns,
            clients_accepted: manager.accepted,
            clients_refused: manager.refused,
            clients_timed_out: manager.timed_out,
            clients_disconnected: manager.disconnected,
        }
    }
}

impl Display for BridgeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes to bus in {} turns ({} failed), {} bytes from bus, \
             {} clients accepted, {} refused, {} timed out, {} disconnected",
            self.bytes_to_bus,
            self.turns,
            self.failed_turns,
            self.bytes_from_bus,
            self.clients_accepted,
            self.clients_refused,
            self.clients_timed_out,
            self.clients_disconnected
        )
    }
}

/// The bridge core: the bus arbiter plus the connection manager feeding it.
///
/// Nothing happens on its own. Each call to [`Bridge::poll`] performs one complete,
/// non-blocking scheduling pass.
pub struct Bridge<U, P, A: Acceptor> {
    config: BridgeConfig,
    arbiter: BusArbiter<U, P, A::Stream>,
    manager: ConnectionManager<A>,
}

impl<U, P, A> Bridge<U, P, A>
where
    U: SerialTransport,
    P: TxEnable,
    A: Acceptor,
{
    /// Creates the bridge and puts the transceiver into receive mode.
    pub fn new(
        config: BridgeConfig,
        uart: U,
        tx_enable: P,
        acceptor: A,
    ) -> Result<Bridge<U, P, A>, BridgeError> {
        let link = SerialLink::new(
            uart,
            tx_enable,
            config.tx_enable_delay,
            config.tx_disable_delay,
        )?;
        let arbiter = BusArbiter::new(link, config.outbound_limit, config.rx_burst);
        let manager = ConnectionManager::new(
            acceptor,
            config.buffer_size,
            config.max_clients,
            config.client_timeout,
        );
        Ok(Bridge {
            config,
            arbiter,
            manager,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &BusArbiter<U, P, A::Stream> {
        &self.arbiter
    }

    pub fn manager(&self) -> &ConnectionManager<A> {
        &self.manager
    }

    pub fn client_count(&self) -> usize {
        self.arbiter.client_count()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats::combine(self.arbiter.stats(), self.manager.stats())
    }

    /// One scheduling pass: accept, read every client, evict idle clients, run the bus,
    /// write to every client and drop the ones that closed.
    pub fn poll(&mut self, now: Instant) -> Result<(), BridgeError> {
        self.manager.accept_pending(&mut self.arbiter, now);
        self.manager.service_reads(&mut self.arbiter, now);
        self.manager.evict_idle(&mut self.arbiter, now);
        self.arbiter.schedule(now)?;
        self.manager.service_writes(&mut self.arbiter, now);
        self.manager.remove_closed(&mut self.arbiter);
        Ok(())
    }

    /// The earliest pending transceiver direction change, if a settle delay is running.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.arbiter.next_deadline()
    }

    /// When the next pass should run: one tick from `now`, or earlier if a transceiver
    /// settle delay expires before that.
    pub fn next_wake(&self, now: Instant) -> Instant {
        let tick = now + self.config.tick;
        match self.next_deadline() {
            Some(deadline) => deadline.min(tick),
            None => tick,
        }
    }

    /// Stops accepting and closes every client. Keep polling until
    /// [`Bridge::is_quiescent`] so a turn in progress can put its accepted bytes on the
    /// wire, then call [`Bridge::release`].
    pub fn begin_shutdown(&mut self) {
        self.manager.stop_accepting();
        self.manager
            .close_all(&mut self.arbiter, CloseReason::Shutdown);
        self.manager.remove_closed(&mut self.arbiter);
    }

    pub fn is_quiescent(&self) -> bool {
        self.arbiter.is_quiescent()
    }

    /// Forces the transceiver into receive mode.
    pub fn release(&mut self) -> Result<(), BridgeError> {
        self.arbiter.release()
    }
}
