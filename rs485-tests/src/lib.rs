//! Simulated hardware and socket helpers shared by the integration tests.
use std::{
    collections::VecDeque,
    io::{self, Read},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use rs485_bridge::{Level, SerialTransport, TxEnable};

#[derive(Default)]
struct BusState {
    written: Vec<u8>,
    rx: VecDeque<u8>,
}

/// A UART that transmits instantly and records what was put on the wire.
#[derive(Clone, Default)]
pub struct SimUart(Arc<Mutex<BusState>>);

impl SimUart {
    pub fn written(&self) -> Vec<u8> {
        self.0.lock().unwrap().written.clone()
    }

    /// Bytes another node puts on the bus.
    pub fn receive(&self, bytes: &[u8]) {
        self.0.lock().unwrap().rx.extend(bytes);
    }
}

impl SerialTransport for SimUart {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().written.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn is_transmit_complete(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.lock().unwrap();
        let count = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

#[derive(Clone, Default)]
pub struct SimPin(Arc<Mutex<Vec<Level>>>);

impl SimPin {
    pub fn levels(&self) -> Vec<Level> {
        self.0.lock().unwrap().clone()
    }

    pub fn level(&self) -> Option<Level> {
        self.0.lock().unwrap().last().copied()
    }
}

impl TxEnable for SimPin {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        self.0.lock().unwrap().push(level);
        Ok(())
    }
}

/// A non-blocking listener on an ephemeral loopback port.
pub fn loopback_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// A blocking client connection with a read timeout, so a missing byte fails the test
/// instead of hanging it.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

/// Reads exactly `len` bytes from `stream`.
pub fn read_bytes(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Whether the peer closed the connection (reads EOF or a reset).
pub fn is_closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
        ),
    }
}

/// Repeats `pass` until it returns true, giving the loopback sockets real time to
/// deliver in between. Panics after five seconds.
pub fn poll_until(mut pass: impl FnMut() -> bool) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !pass() {
        assert!(Instant::now() < give_up, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
