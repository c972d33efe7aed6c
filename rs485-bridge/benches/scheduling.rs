use std::{
    cell::Cell,
    hint::black_box,
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use criterion::{Criterion, criterion_group, criterion_main};
use rs485_bridge::{
    Level, SerialTransport, TxEnable,
    arbiter::BusArbiter,
    client::{ClientConnection, ClientId},
    link::SerialLink,
};

/// Accepts everything and "receives" `rx` zero bytes.
struct NullUart {
    rx: Cell<usize>,
}

impl SerialTransport for NullUart {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        Ok(bytes.len())
    }

    fn is_transmit_complete(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.rx.get());
        buf[..count].fill(0);
        self.rx.set(self.rx.get() - count);
        Ok(count)
    }
}

struct NullPin;

impl TxEnable for NullPin {
    fn set_level(&mut self, _level: Level) -> io::Result<()> {
        Ok(())
    }
}

struct SinkStream;

impl Read for SinkStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }
}

impl Write for SinkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn busy_arbiter(clients: u64) -> BusArbiter<NullUart, NullPin, SinkStream> {
    let uart = NullUart { rx: Cell::new(0) };
    let link = SerialLink::new(uart, NullPin, Duration::ZERO, Duration::ZERO)
        .expect("null pin cannot fail");
    let mut arbiter = BusArbiter::new(link, 64 * 1024, 256);
    let now = Instant::now();
    for id in 0..clients {
        let mut client = ClientConnection::new(ClientId(id), "bench", SinkStream, 256, now);
        client.activate();
        arbiter.register(client);
    }
    arbiter
}

fn scheduling_pass(c: &mut Criterion) {
    let mut arbiter = busy_arbiter(8);
    let payload = [0x5Au8; 64];
    let now = Instant::now();
    c.bench_function("turn with 8 clients", |b| {
        b.iter(|| {
            for client in arbiter.clients_mut() {
                let _ = client.inbound_mut().push(&payload);
            }
            for _ in 0..8 {
                arbiter.schedule(black_box(now)).expect("schedule");
            }
        })
    });
}

fn fan_out(c: &mut Criterion) {
    let mut arbiter = busy_arbiter(8);
    let now = Instant::now();
    c.bench_function("fan out 256 bytes to 8 clients", |b| {
        b.iter(|| {
            arbiter.link().uart().rx.set(256);
            arbiter.schedule(black_box(now)).expect("schedule");
            for client in arbiter.clients_mut() {
                client.write_to_stream(now).expect("sink");
            }
        })
    });
}

criterion_group!(benches, scheduling_pass, fan_out);
criterion_main!(benches);
