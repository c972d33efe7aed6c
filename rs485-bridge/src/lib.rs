//! # RS485 Stream Bridge
//!
//! This crate exposes a single shared half-duplex RS485 bus to any number of
//! concurrent TCP stream clients.
//!
//! ## Overview
//!
//! RS485 is a half-duplex medium: only one node may drive the line at a time, and the
//! transceiver must be switched into transmit mode (by asserting a transmit-enable
//! line) before sending and back into receive mode afterwards. This library takes byte
//! streams from network clients, serializes them onto the bus one client at a time with
//! the correct direction timing, and broadcasts everything received from the bus back
//! to every connected client.
//!
//! The bridge is byte-transparent. It does not know about Modbus or any other framing.
//!
//! ## Architecture
//!
//! The crate is built around these components, leaf-first:
//!
//! - **[`SerialTransport`] / [`TxEnable`] Traits**: The interface that hardware backends
//!   implement (UART byte transport and the transmit-enable output).
//! - **[`link::SerialLink`]**: The direction state machine
//!   (`Idle → EnablingTx → Transmitting → DisablingTx → Idle`) with deferred settle delays.
//! - **[`client::ClientConnection`]**: One accepted network stream with a bounded inbound
//!   buffer and a per-client outbound backlog.
//! - **[`arbiter::BusArbiter`]**: Owns the link and the clients; grants the bus round-robin,
//!   runs each turn to completion and fans received bus bytes out to all clients.
//! - **[`manager::ConnectionManager`]**: Accepts connections up to a limit, services socket
//!   reads and writes, and evicts idle clients.
//! - **[`bridge::Bridge`]**: One synchronous scheduling pass over all of the above.
//! - **[`server::Server`]**: Drives the bridge from a TCP listener on a `tokio` timer.
//!
//! ## Basic Usage
//!
//! ### Implementing a Backend
//!
//! ```ignore
//! use rs485_bridge::{Level, SerialTransport, TxEnable};
//!
//! struct MyUart { /* device-specific fields */ }
//!
//! impl SerialTransport for MyUart {
//!     fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> { todo!() }
//!     fn is_transmit_complete(&mut self) -> std::io::Result<bool> { todo!() }
//!     fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> { todo!() }
//! }
//! ```
//!
//! ### Starting the Server
//!
//! ```ignore
//! use rs485_bridge::config::Builder;
//! use rs485_bridge::server::Server;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Builder::new(8080, Duration::from_secs(30))
//!     .tx_disable_delay(Duration::from_micros(50))
//!     .build()?;
//! let server = Server::new(config, my_uart, my_pin);
//! server.listen("0.0.0.0".parse()?, CancellationToken::new()).await?;
//! ```
//!
//! ## Error Handling
//!
//! Failures of a single client (I/O errors, idle timeout, refused connections) are logged
//! and isolated to that client. Only failures of the shared hardware, or a violation of the
//! link state machine, are returned as [`error::BridgeError`] and stop the bridge.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Configure logging with an
//! implementation like `env_logger`:
//!
//! ```ignore
//! env_logger::init();
//! ```
//!
//! ## Thread Model
//!
//! Scheduling is single-threaded and cooperative. Every operation takes the current
//! [`std::time::Instant`] and never blocks; transceiver settle delays are recorded as
//! deadlines and resolved by later passes.
use std::io;

pub mod arbiter;
pub mod bridge;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod server;

#[cfg(test)]
pub(crate) mod mock;

/// Logic level of the transmit-enable output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    /// Transceiver driver enabled (transmit mode).
    High,
    /// Transceiver driver disabled (receive mode).
    Low,
}

impl Level {
    pub fn inverted(self) -> Level {
        match self {
            Level::High => Level::Low,
            Level::Low => Level::High,
        }
    }
}

/// Byte transport of the UART the RS485 transceiver is attached to.
///
/// All methods must return immediately. The bridge calls them from its scheduling pass
/// and relies on them never blocking.
pub trait SerialTransport {
    /// Queue bytes for transmission.
    ///
    /// # Returns
    ///
    /// The number of bytes accepted. This may be less than `bytes.len()` (including zero)
    /// if the outgoing queue is full; the caller retries the remainder later.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Whether every accepted byte has physically left the wire.
    ///
    /// Having an empty software queue is not enough: the last byte must also have been
    /// shifted out of the transmitter, otherwise disabling the driver clips it.
    fn is_transmit_complete(&mut self) -> io::Result<bool>;

    /// Read received bytes into `buf`.
    ///
    /// Returns `Ok(0)` or an error of kind [`io::ErrorKind::WouldBlock`] when nothing is
    /// available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The output pin that switches the RS485 transceiver between receive and transmit.
pub trait TxEnable {
    fn set_level(&mut self, level: Level) -> io::Result<()>;
}

impl<T: SerialTransport + ?Sized> SerialTransport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn is_transmit_complete(&mut self) -> io::Result<bool> {
        (**self).is_transmit_complete()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
}

impl<T: TxEnable + ?Sized> TxEnable for Box<T> {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        (**self).set_level(level)
    }
}
