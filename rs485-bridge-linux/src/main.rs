//! # RS485 Stream Bridge for Linux
//!
//! Serves a half-duplex RS485 bus, attached through a tty serial device, to TCP stream
//! clients.
//!
//! ## Overview
//!
//! This binary wires [`rs485_bridge`](https://docs.rs/rs485-bridge/) to Linux hardware: the
//! UART is a termios serial device in raw mode, and transmit-enable is either the RTS line
//! of that device or a sysfs GPIO.
pub mod backends;

use std::error::Error;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use clap_num::number_range;
use env_logger::Env;
use rs485_bridge::{
    TxEnable,
    config::{Builder, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CLIENTS},
    server::Server,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::backends::{
    ActiveLow,
    gpio::SysfsGpio,
    tty::{Parity, TtyUart, baud_rate},
};

/// Where the transceiver's driver-enable input is connected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TxEnableOutput {
    Rts,
    Gpio(u32),
}

impl FromStr for TxEnableOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("rts") {
            return Ok(TxEnableOutput::Rts);
        }
        match s.split_once(':') {
            Some(("gpio", pin)) => pin
                .parse()
                .map(TxEnableOutput::Gpio)
                .map_err(|_| format!("invalid GPIO number '{}'", pin)),
            _ => Err(format!("expected 'rts' or 'gpio:<n>', got '{}'", s)),
        }
    }
}

fn parse_baud(s: &str) -> Result<u32, String> {
    let baud: u32 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    match baud_rate(baud) {
        Some(_) => Ok(baud),
        None => Err(format!("unsupported baud rate {}", baud)),
    }
}

fn buffer_size_in_range(s: &str) -> Result<usize, String> {
    number_range(s, 1, 1 << 20)
}

fn max_clients_in_range(s: &str) -> Result<usize, String> {
    number_range(s, 1, 1024)
}

fn delay_us_in_range(s: &str) -> Result<u64, String> {
    number_range(s, 0, 1_000_000)
}

fn tick_us_in_range(s: &str) -> Result<u64, String> {
    number_range(s, 10, 1_000_000)
}

#[derive(Parser, Debug)]
#[command(about = "Bridge a half-duplex RS485 bus to TCP stream clients", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    ip: IpAddr,

    #[arg(short, long, default_value = "8080")]
    port: u16,

    #[arg(short, long, help = "Serial device, auto-detected if omitted")]
    device: Option<PathBuf>,

    #[arg(short, long, default_value = "9600", value_parser = parse_baud)]
    baud: u32,

    #[arg(long, value_enum, default_value = "none")]
    parity: Parity,

    #[arg(long, help = "Transmit-enable output: 'rts' or 'gpio:<n>'")]
    tx_enable: TxEnableOutput,

    #[arg(long, help = "The transceiver enables its driver on a low level")]
    gpio_active_low: bool,

    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE, value_parser = buffer_size_in_range)]
    buffer_size: usize,

    #[arg(long, help = "Idle timeout in milliseconds, 0 disables it")]
    client_timeout_ms: u64,

    #[arg(long, default_value = "0", value_parser = delay_us_in_range)]
    tx_enable_delay_us: u64,

    #[arg(long, default_value = "0", value_parser = delay_us_in_range)]
    tx_disable_delay_us: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS, value_parser = max_clients_in_range)]
    max_clients: usize,

    #[arg(long, default_value = "1000", value_parser = tick_us_in_range)]
    tick_us: u64,
}

/// Attempts to automatically find the serial device the transceiver is attached to
fn serial_device_path() -> Option<PathBuf> {
    const CANDIDATES: [&str; 5] = [
        "/dev/ttyRS485",
        "/dev/serial0",
        "/dev/ttyUSB0",
        "/dev/ttyAMA0",
        "/dev/ttyS0",
    ];
    for candidate in CANDIDATES {
        let path = PathBuf::from(candidate);
        log::debug!("Looking at serial device {}", path.display());
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting RS485 stream bridge");

    let args = Args::parse();
    log::debug!("Parsed arguments: {:?}", args);

    let device = match args.device.clone().or_else(|| {
        let path = serial_device_path()?;
        log::info!("Auto-detected serial device at {}", path.display());
        Some(path)
    }) {
        None => {
            println!(
                "No serial device could be detected. Use --device <path> to manually specify one."
            );
            return Ok(());
        }
        Some(path) => path,
    };

    let config = Builder::new(args.port, Duration::from_millis(args.client_timeout_ms))
        .buffer_size(args.buffer_size)
        .max_clients(args.max_clients)
        .tx_enable_delay(Duration::from_micros(args.tx_enable_delay_us))
        .tx_disable_delay(Duration::from_micros(args.tx_disable_delay_us))
        .tick(Duration::from_micros(args.tick_us))
        .build()?;

    let uart = TtyUart::open(&device, args.baud, args.parity)?;
    let tx_enable: Box<dyn TxEnable> = match args.tx_enable {
        TxEnableOutput::Rts => {
            log::info!("Using RTS of {} as transmit enable", device.display());
            Box::new(uart.rts_line()?)
        }
        TxEnableOutput::Gpio(pin) => Box::new(SysfsGpio::new(pin)?),
    };
    let tx_enable: Box<dyn TxEnable> = if args.gpio_active_low {
        log::info!("Transmit enable is active low");
        Box::new(ActiveLow(tx_enable))
    } else {
        tx_enable
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => log::info!("Received shutdown signal"),
            Err(e) => log::error!("Could not listen for shutdown signals: {}", e),
        }
        token.cancel();
    });

    let addr = SocketAddr::new(args.ip, args.port);
    log::info!("Binding to address: {}", addr);
    let stats = Server::new(config, uart, tx_enable)
        .listen(args.ip, shutdown)
        .await?;
    log::debug!("Final counters: {:?}", stats);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tx_enable() {
        assert_eq!("rts".parse::<TxEnableOutput>(), Ok(TxEnableOutput::Rts));
        assert_eq!("gpio:17".parse::<TxEnableOutput>(), Ok(TxEnableOutput::Gpio(17)));
        assert!("gpio:x".parse::<TxEnableOutput>().is_err());
        assert!("dtr".parse::<TxEnableOutput>().is_err());
    }

    #[test]
    fn minimal_arguments_use_defaults() {
        let args = Args::try_parse_from([
            "rs485-stream-server",
            "--tx-enable",
            "rts",
            "--client-timeout-ms",
            "5000",
        ])
        .unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.ip, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(args.baud, 9600);
        assert_eq!(args.parity, Parity::None);
        assert_eq!(args.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(args.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(args.client_timeout_ms, 5000);
        assert_eq!(args.tx_enable, TxEnableOutput::Rts);
        assert!(args.device.is_none());
    }

    #[test]
    fn timeout_and_tx_enable_are_required() {
        assert!(Args::try_parse_from(["rs485-stream-server", "--tx-enable", "rts"]).is_err());
        assert!(
            Args::try_parse_from(["rs485-stream-server", "--client-timeout-ms", "10"]).is_err()
        );
    }

    fn parse_with(extra: &[&'static str]) -> Result<Args, clap::Error> {
        let mut argv = vec![
            "rs485-stream-server",
            "--tx-enable",
            "gpio:4",
            "--client-timeout-ms",
            "0",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse_with(&[]).is_ok());
        assert!(parse_with(&["--max-clients", "0"]).is_err());
        assert!(parse_with(&["--buffer-size", "0"]).is_err());
        assert!(parse_with(&["--baud", "12345"]).is_err());
        assert!(parse_with(&["--baud", "115200"]).is_ok());
        assert!(parse_with(&["--tick-us", "1"]).is_err());
    }
}
