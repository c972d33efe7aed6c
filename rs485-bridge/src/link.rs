//! # Serial Transceiver Controller
//!
//! [`SerialLink`] owns the UART and the transmit-enable output and switches the
//! half-duplex transceiver between receiving and transmitting:
//!
//! ```text
//! Idle --begin_transmit--> EnablingTx --(tx_enable_delay)--> Transmitting
//!   ^                                                              |
//!   +----(tx_disable_delay)---- DisablingTx <----end_transmit------+
//! ```
//!
//! The settle delays never block. Entering a delayed state records a deadline and the
//! transition is taken by the first [`SerialLink::advance`] at or after it.
//!
//! The transmit-enable line is high exactly while the direction is not [`Direction::Idle`].
use std::{
    io::{self, ErrorKind},
    iter::FusedIterator,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{Level, SerialTransport, TxEnable, error::LinkError};

/// Size of a single UART read.
pub const RX_CHUNK_SIZE: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Receiving; transmit-enable low.
    Idle,
    /// Transmit-enable asserted, waiting for the driver to settle.
    EnablingTx { ready_at: Instant },
    /// Bytes may be handed to the UART.
    Transmitting,
    /// Last bit is out, holding the line until `release_at`.
    DisablingTx { release_at: Instant },
}

impl Direction {
    pub fn name(&self) -> &'static str {
        match self {
            Direction::Idle => "Idle",
            Direction::EnablingTx { .. } => "EnablingTx",
            Direction::Transmitting => "Transmitting",
            Direction::DisablingTx { .. } => "DisablingTx",
        }
    }

    /// Whether the transmit-enable line is asserted in this direction.
    pub fn tx_enabled(&self) -> bool {
        !matches!(self, Direction::Idle)
    }
}

pub struct SerialLink<U, P> {
    uart: U,
    tx_enable: P,
    direction: Direction,
    enable_delay: Duration,
    disable_delay: Duration,
}

impl<U: SerialTransport, P: TxEnable> SerialLink<U, P> {
    /// Wraps the hardware and puts the transceiver into receive mode.
    pub fn new(
        uart: U,
        mut tx_enable: P,
        enable_delay: Duration,
        disable_delay: Duration,
    ) -> Result<SerialLink<U, P>, LinkError> {
        tx_enable.set_level(Level::Low).map_err(LinkError::TxEnable)?;
        log::debug!("TX enable initialized to LOW (receive mode)");
        Ok(SerialLink {
            uart,
            tx_enable,
            direction: Direction::Idle,
            enable_delay,
            disable_delay,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_idle(&self) -> bool {
        self.direction == Direction::Idle
    }

    pub fn is_transmitting(&self) -> bool {
        self.direction == Direction::Transmitting
    }

    /// The instant of the next pending deferred transition, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.direction {
            Direction::EnablingTx { ready_at } => Some(ready_at),
            Direction::DisablingTx { release_at } => Some(release_at),
            Direction::Idle | Direction::Transmitting => None,
        }
    }

    /// Takes any deferred transition whose deadline has passed.
    pub fn advance(&mut self, now: Instant) -> Result<Direction, LinkError> {
        match self.direction {
            Direction::EnablingTx { ready_at } if now >= ready_at => {
                self.direction = Direction::Transmitting;
                log::debug!("Transceiver ready, direction Transmitting");
            }
            Direction::DisablingTx { release_at } if now >= release_at => {
                self.tx_enable
                    .set_level(Level::Low)
                    .map_err(LinkError::TxEnable)?;
                self.direction = Direction::Idle;
                log::debug!("Set TX enable LOW, back to receive mode");
            }
            _ => {}
        }
        Ok(self.direction)
    }

    /// Asserts transmit-enable and starts the enable settle delay.
    ///
    /// With a zero delay the link is `Transmitting` when this returns.
    pub fn begin_transmit(&mut self, now: Instant) -> Result<(), LinkError> {
        if !self.is_idle() {
            return Err(self.misuse("begin_transmit"));
        }
        self.tx_enable
            .set_level(Level::High)
            .map_err(LinkError::TxEnable)?;
        self.direction = Direction::EnablingTx {
            ready_at: now + self.enable_delay,
        };
        log::debug!(
            "Set TX enable HIGH, waiting {}us before transmitting",
            self.enable_delay.as_micros()
        );
        self.advance(now)?;
        Ok(())
    }

    /// Hands bytes to the UART. Only valid while `Transmitting`.
    ///
    /// # Returns
    ///
    /// The number of bytes accepted, which may be short when the UART queue is full.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        if !self.is_transmitting() {
            return Err(self.misuse("send"));
        }
        let accepted = match self.uart.write(bytes) {
            Ok(count) => count,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => return Err(LinkError::Transport(e)),
        };
        log::trace!("UART accepted {:02x?}", &bytes[..accepted]);
        Ok(accepted)
    }

    /// Whether the UART reports all accepted bytes physically transmitted.
    pub fn is_transmit_complete(&mut self) -> Result<bool, LinkError> {
        if !self.is_transmitting() {
            return Err(self.misuse("is_transmit_complete"));
        }
        self.uart.is_transmit_complete().map_err(LinkError::Transport)
    }

    /// Starts the disable hold time. The caller must have seen
    /// [`SerialLink::is_transmit_complete`] return `true`.
    pub fn end_transmit(&mut self, now: Instant) -> Result<(), LinkError> {
        if !self.is_transmitting() {
            return Err(self.misuse("end_transmit"));
        }
        self.enter_disabling(now)
    }

    /// Gives up the current transmission after a transport failure, without waiting for
    /// the UART to report completion. Does nothing when already releasing or idle.
    pub fn abort_transmit(&mut self, now: Instant) -> Result<(), LinkError> {
        match self.direction {
            Direction::EnablingTx { .. } | Direction::Transmitting => self.enter_disabling(now),
            Direction::DisablingTx { .. } | Direction::Idle => Ok(()),
        }
    }

    fn enter_disabling(&mut self, now: Instant) -> Result<(), LinkError> {
        self.direction = Direction::DisablingTx {
            release_at: now + self.disable_delay,
        };
        log::debug!(
            "Transmission complete, holding TX enable for {}us",
            self.disable_delay.as_micros()
        );
        self.advance(now)?;
        Ok(())
    }

    /// Drains up to `limit` received bytes from the UART.
    ///
    /// The returned iterator is lazy and finite: every item is one UART read, and it ends
    /// when the UART has nothing more or `limit` bytes were produced. It is empty unless
    /// the link is `Idle`, since a half-duplex line echoes or collides with our own
    /// transmission.
    pub fn poll_receive(&mut self, limit: usize) -> Receive<'_, U> {
        let uart = if self.is_idle() {
            Some(&mut self.uart)
        } else {
            None
        };
        Receive {
            uart,
            remaining: limit,
        }
    }

    /// Forces the transceiver back into receive mode, regardless of state.
    pub fn release(&mut self) -> Result<(), LinkError> {
        self.tx_enable
            .set_level(Level::Low)
            .map_err(LinkError::TxEnable)?;
        self.direction = Direction::Idle;
        Ok(())
    }

    pub fn uart(&self) -> &U {
        &self.uart
    }

    pub fn tx_enable(&self) -> &P {
        &self.tx_enable
    }

    fn misuse(&self, operation: &'static str) -> LinkError {
        LinkError::Misuse {
            operation,
            direction: self.direction.name(),
        }
    }
}

/// Lazily drains received bytes from the UART. See [`SerialLink::poll_receive`].
pub struct Receive<'a, U> {
    uart: Option<&'a mut U>,
    remaining: usize,
}

impl<U: SerialTransport> Iterator for Receive<'_, U> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.uart = None;
        }
        let uart = self.uart.as_mut()?;
        let mut chunk = [0u8; RX_CHUNK_SIZE];
        let len = self.remaining.min(RX_CHUNK_SIZE);
        match uart.read(&mut chunk[..len]) {
            Ok(0) => {
                self.uart = None;
                None
            }
            Ok(count) => {
                self.remaining -= count;
                Some(Ok(Bytes::copy_from_slice(&chunk[..count])))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                self.uart = None;
                None
            }
            Err(e) => {
                self.uart = None;
                Some(Err(e))
            }
        }
    }
}

impl<U: SerialTransport> FusedIterator for Receive<'_, U> {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockUart, RecordingPin};

    fn link(
        enable_us: u64,
        disable_us: u64,
    ) -> (SerialLink<MockUart, RecordingPin>, MockUart, RecordingPin) {
        let uart = MockUart::new();
        let pin = RecordingPin::default();
        let link = SerialLink::new(
            uart.clone(),
            pin.clone(),
            Duration::from_micros(enable_us),
            Duration::from_micros(disable_us),
        )
        .unwrap();
        (link, uart, pin)
    }

    #[test]
    fn starts_in_receive_mode() {
        let (link, _, pin) = link(0, 0);
        assert!(link.is_idle());
        assert_eq!(pin.levels(), vec![Level::Low]);
    }

    #[test]
    fn zero_delays_transition_immediately() {
        let (mut link, uart, pin) = link(0, 0);
        let now = Instant::now();
        link.begin_transmit(now).unwrap();
        assert!(link.is_transmitting());
        assert_eq!(link.send(b"abc").unwrap(), 3);
        assert!(link.is_transmit_complete().unwrap());
        link.end_transmit(now).unwrap();
        assert!(link.is_idle());
        assert_eq!(uart.written(), b"abc");
        assert_eq!(pin.levels(), vec![Level::Low, Level::High, Level::Low]);
    }

    #[test]
    fn enable_delay_is_deferred() {
        let (mut link, _, pin) = link(100, 0);
        let start = Instant::now();
        link.begin_transmit(start).unwrap();
        assert_eq!(pin.level(), Some(Level::High));
        let ready_at = start + Duration::from_micros(100);
        assert_eq!(link.direction(), Direction::EnablingTx { ready_at });
        assert_eq!(link.deadline(), Some(ready_at));

        link.advance(start + Duration::from_micros(99)).unwrap();
        assert!(!link.is_transmitting());
        assert!(matches!(
            link.send(b"x"),
            Err(LinkError::Misuse {
                operation: "send",
                direction: "EnablingTx"
            })
        ));

        assert_eq!(link.advance(ready_at).unwrap(), Direction::Transmitting);
    }

    #[test]
    fn disable_delay_holds_line() {
        let (mut link, _, pin) = link(0, 250);
        let start = Instant::now();
        link.begin_transmit(start).unwrap();
        link.send(b"z").unwrap();
        link.end_transmit(start).unwrap();
        assert!(link.direction().tx_enabled());
        assert_eq!(pin.level(), Some(Level::High));

        link.advance(start + Duration::from_micros(249)).unwrap();
        assert_eq!(pin.level(), Some(Level::High));

        link.advance(start + Duration::from_micros(250)).unwrap();
        assert!(link.is_idle());
        assert_eq!(pin.level(), Some(Level::Low));
    }

    #[test]
    fn begin_transmit_twice_is_misuse() {
        let (mut link, _, _) = link(10, 0);
        let now = Instant::now();
        link.begin_transmit(now).unwrap();
        assert!(matches!(
            link.begin_transmit(now),
            Err(LinkError::Misuse {
                operation: "begin_transmit",
                ..
            })
        ));
    }

    #[test]
    fn end_transmit_while_idle_is_misuse() {
        let (mut link, _, _) = link(0, 0);
        assert!(matches!(
            link.end_transmit(Instant::now()),
            Err(LinkError::Misuse {
                operation: "end_transmit",
                direction: "Idle"
            })
        ));
    }

    #[test]
    fn short_writes_are_reported() {
        let (mut link, uart, _) = link(0, 0);
        uart.0.borrow_mut().accept_per_write = Some(2);
        link.begin_transmit(Instant::now()).unwrap();
        assert_eq!(link.send(b"hello").unwrap(), 2);
        assert_eq!(uart.written(), b"he");
    }

    #[test]
    fn transport_failure_is_reported() {
        let (mut link, uart, _) = link(0, 0);
        uart.0.borrow_mut().fail_writes = true;
        link.begin_transmit(Instant::now()).unwrap();
        assert!(matches!(link.send(b"x"), Err(LinkError::Transport(_))));
    }

    #[test]
    fn abort_releases_from_enabling() {
        let (mut link, _, pin) = link(1000, 0);
        let now = Instant::now();
        link.begin_transmit(now).unwrap();
        link.abort_transmit(now).unwrap();
        assert!(link.is_idle());
        assert_eq!(pin.level(), Some(Level::Low));
    }

    #[test]
    fn receive_only_while_idle() {
        let (mut link, uart, _) = link(0, 10);
        uart.receive(b"\x01\x02\x03\x04");
        let now = Instant::now();
        link.begin_transmit(now).unwrap();
        assert_eq!(link.poll_receive(256).count(), 0);
        link.end_transmit(now).unwrap();
        assert_eq!(link.poll_receive(256).count(), 0);

        link.advance(now + Duration::from_micros(10)).unwrap();
        let received: Vec<u8> = link
            .poll_receive(256)
            .map(|chunk| chunk.unwrap())
            .flat_map(|chunk| chunk.to_vec())
            .collect();
        assert_eq!(received, b"\x01\x02\x03\x04");
    }

    #[test]
    fn receive_is_chunked_and_bounded() {
        let (mut link, uart, _) = link(0, 0);
        uart.receive(&[0xAA; 200]);
        let chunks: Vec<Bytes> = link.poll_receive(150).map(|c| c.unwrap()).collect();
        assert_eq!(
            chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![64, 64, 22]
        );
        assert_eq!(uart.0.borrow().rx.len(), 50);
    }
}
