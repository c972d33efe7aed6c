//! # TTY Backend
//!
//! UART access through a Linux serial device (`/dev/ttyS*`, `/dev/ttyUSB*`, ...) in
//! raw, non-blocking mode, and transmit-enable through the device's RTS modem line.
//!
//! ## Example Usage
//!
//! ```ignore
//! use rs485_bridge::server::Server;
//!
//! let uart = TtyUart::open("/dev/ttyUSB0", 9600, Parity::None)?;
//! let rts = uart.rts_line()?;
//! let server = Server::new(config, uart, rts);
//! ```
use clap::ValueEnum;
use nix::{
    errno::Errno,
    ioctl_read_bad, ioctl_write_ptr_bad, libc,
    sys::termios::{
        self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices,
    },
};
use std::{
    ffi::c_int,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
};

use rs485_bridge::{Level, SerialTransport, TxEnable};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Parity {
    None,
    Even,
    Odd,
}

// Defined in include/uapi/asm-generic/ioctls.h and include/uapi/linux/serial.h
const TIOCSERGETLSR_NR: u32 = 0x5459;
const TIOCSER_TEMT: c_int = 0x01;

// Line status register; TEMT is set once the transmitter shift register is empty
ioctl_read_bad!(tty_get_lsr, TIOCSERGETLSR_NR, c_int);
// Bytes still in the driver's output queue
ioctl_read_bad!(tty_output_queue, libc::TIOCOUTQ, c_int);
ioctl_write_ptr_bad!(tty_modem_bits_set, libc::TIOCMBIS, c_int);
ioctl_write_ptr_bad!(tty_modem_bits_clear, libc::TIOCMBIC, c_int);

/// Maps a numeric baud rate onto the termios constant.
pub fn baud_rate(baud: u32) -> Option<BaudRate> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        _ => return None,
    };
    Some(rate)
}

/// A serial device in raw 8-bit mode with non-blocking reads and writes.
pub struct TtyUart {
    file: File,
    /// Not every driver (notably many USB adapters) implements the line status ioctl.
    /// Without it, an empty output queue is taken as transmission complete.
    lsr_supported: bool,
}

impl TtyUart {
    pub fn open(path: impl AsRef<Path>, baud: u32, parity: Parity) -> io::Result<TtyUart> {
        let path = path.as_ref();
        log::debug!("Opening serial device: {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;

        let rate = baud_rate(baud).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unsupported baud rate {}", baud),
            )
        })?;

        let mut settings = termios::tcgetattr(&file)?;
        termios::cfmakeraw(&mut settings);
        termios::cfsetspeed(&mut settings, rate)?;
        settings.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        settings.control_flags &=
            !(ControlFlags::CSTOPB | ControlFlags::CRTSCTS | ControlFlags::PARENB | ControlFlags::PARODD);
        match parity {
            Parity::None => {}
            Parity::Even => settings.control_flags |= ControlFlags::PARENB,
            Parity::Odd => settings.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD,
        }
        settings.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        settings.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&file, SetArg::TCSANOW, &settings)?;
        termios::tcflush(&file, FlushArg::TCIOFLUSH)?;
        log::info!(
            "Serial device {} configured: {} baud, 8{}1",
            path.display(),
            baud,
            match parity {
                Parity::None => 'N',
                Parity::Even => 'E',
                Parity::Odd => 'O',
            }
        );

        Ok(TtyUart {
            file,
            lsr_supported: true,
        })
    }

    /// Transmit-enable through the RTS line of this device.
    pub fn rts_line(&self) -> io::Result<RtsLine> {
        Ok(RtsLine {
            file: self.file.try_clone()?,
        })
    }

    fn line_status(&self) -> nix::Result<c_int> {
        let mut lsr: c_int = 0;
        // SAFETY: The ioctl call is safe because:
        // - File descriptor is valid (self.file is open)
        // - lsr is a valid c_int the driver writes into
        unsafe {
            tty_get_lsr(self.file.as_raw_fd(), &mut lsr)?;
        }
        Ok(lsr)
    }

    fn output_queue_len(&self) -> nix::Result<c_int> {
        let mut queued: c_int = 0;
        // SAFETY: Same as for line_status
        unsafe {
            tty_output_queue(self.file.as_raw_fd(), &mut queued)?;
        }
        Ok(queued)
    }
}

impl SerialTransport for TtyUart {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.file.write(bytes)
    }

    fn is_transmit_complete(&mut self) -> io::Result<bool> {
        if self.output_queue_len()? > 0 {
            return Ok(false);
        }
        if !self.lsr_supported {
            return Ok(true);
        }
        match self.line_status() {
            Ok(lsr) => Ok(lsr & TIOCSER_TEMT != 0),
            Err(Errno::ENOTTY) | Err(Errno::EINVAL) => {
                log::warn!(
                    "Serial driver does not report the line status, \
                     the last byte may be clipped unless tx_disable_delay covers one character time"
                );
                self.lsr_supported = false;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Drives transmit-enable through the RTS modem control line.
pub struct RtsLine {
    file: File,
}

impl TxEnable for RtsLine {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        let bits: c_int = libc::TIOCM_RTS;
        // SAFETY: The ioctl call is safe because:
        // - File descriptor is valid (self.file is open)
        // - bits outlives the call
        unsafe {
            match level {
                Level::High => tty_modem_bits_set(self.file.as_raw_fd(), &bits)?,
                Level::Low => tty_modem_bits_clear(self.file.as_raw_fd(), &bits)?,
            };
        }
        log::trace!("RTS set {:?}", level);
        Ok(())
    }
}
