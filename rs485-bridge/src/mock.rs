//! In-memory stand-ins for the UART, the transmit-enable pin and client sockets.
//! Every mock is a cheap handle onto shared state so a test can keep inspecting it
//! after ownership has moved into the bridge.
use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
};

use crate::{Level, SerialTransport, TxEnable};

#[derive(Default)]
pub struct UartState {
    /// Everything accepted for transmission, in order.
    pub written: Vec<u8>,
    /// Maximum bytes accepted per `write` call. `None` accepts everything.
    pub accept_per_write: Option<usize>,
    /// Total bytes still accepted before the UART stalls. `None` is unlimited.
    pub budget: Option<usize>,
    /// Bytes accepted but not yet "on the wire".
    pub in_flight: usize,
    /// When false, `in_flight` is only cleared by calling [`MockUart::finish_transmit`].
    pub auto_complete: bool,
    pub fail_writes: bool,
    pub rx: VecDeque<u8>,
    pub write_calls: usize,
}

#[derive(Clone, Default)]
pub struct MockUart(pub Rc<RefCell<UartState>>);

impl MockUart {
    pub fn new() -> MockUart {
        let uart = MockUart::default();
        uart.0.borrow_mut().auto_complete = true;
        uart
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    pub fn receive(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend(bytes);
    }

    pub fn finish_transmit(&self) {
        self.0.borrow_mut().in_flight = 0;
    }
}

impl SerialTransport for MockUart {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.write_calls += 1;
        if state.fail_writes {
            return Err(io::Error::other("uart write failed"));
        }
        let mut count = state
            .accept_per_write
            .map_or(bytes.len(), |max| max.min(bytes.len()));
        if let Some(budget) = state.budget.as_mut() {
            count = count.min(*budget);
            *budget -= count;
        }
        state.written.extend_from_slice(&bytes[..count]);
        if !state.auto_complete {
            state.in_flight += count;
        }
        Ok(count)
    }

    fn is_transmit_complete(&mut self) -> io::Result<bool> {
        Ok(self.0.borrow().in_flight == 0)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        let count = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

#[derive(Clone, Default)]
pub struct RecordingPin(pub Rc<RefCell<Vec<Level>>>);

impl RecordingPin {
    pub fn levels(&self) -> Vec<Level> {
        self.0.borrow().clone()
    }

    pub fn level(&self) -> Option<Level> {
        self.0.borrow().last().copied()
    }
}

impl TxEnable for RecordingPin {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        self.0.borrow_mut().push(level);
        Ok(())
    }
}

#[derive(Default)]
pub struct StreamState {
    pub incoming: VecDeque<u8>,
    pub eof: bool,
    pub read_error: Option<io::ErrorKind>,
    pub written: Vec<u8>,
    /// Maximum bytes accepted per `write` call. `None` accepts everything.
    pub write_cap: Option<usize>,
    pub write_error: Option<io::ErrorKind>,
}

#[derive(Clone, Default)]
pub struct MockStream(pub Rc<RefCell<StreamState>>);

impl MockStream {
    pub fn send(&self, bytes: &[u8]) {
        self.0.borrow_mut().incoming.extend(bytes);
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    pub fn pending_incoming(&self) -> usize {
        self.0.borrow().incoming.len()
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        if let Some(kind) = state.read_error {
            return Err(io::Error::from(kind));
        }
        if state.incoming.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let count = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        if let Some(kind) = state.write_error {
            return Err(io::Error::from(kind));
        }
        let count = state.write_cap.map_or(buf.len(), |cap| cap.min(buf.len()));
        if count == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.written.extend_from_slice(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
