//! # Sysfs GPIO Backend
//!
//! Transmit-enable through a GPIO exported via `/sys/class/gpio`, for boards where the
//! transceiver's DE/RE pins are wired to a general-purpose output rather than RTS.
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path,
};

use rs485_bridge::{Level, TxEnable};

const GPIO_CLASS_PATH: &str = "/sys/class/gpio";

pub struct SysfsGpio {
    pin: u32,
    value: File,
}

impl SysfsGpio {
    /// Exports `pin` (if not already exported) and configures it as an output.
    pub fn new(pin: u32) -> io::Result<SysfsGpio> {
        SysfsGpio::with_root(GPIO_CLASS_PATH, pin)
    }

    fn with_root(root: impl AsRef<Path>, pin: u32) -> io::Result<SysfsGpio> {
        let root = root.as_ref();
        let pin_path = root.join(format!("gpio{}", pin));
        if !pin_path.exists() {
            log::debug!("Exporting GPIO {}", pin);
            fs::write(root.join("export"), pin.to_string())?;
        }
        // Start low so the transceiver never drives the bus while we set up.
        fs::write(pin_path.join("direction"), "low")?;
        let value = OpenOptions::new()
            .write(true)
            .open(pin_path.join("value"))?;
        log::info!("Using GPIO {} as transmit enable", pin);
        Ok(SysfsGpio { pin, value })
    }
}

impl TxEnable for SysfsGpio {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        let value: &[u8] = match level {
            Level::High => b"1",
            Level::Low => b"0",
        };
        self.value.write_at(value, 0)?;
        log::trace!("GPIO {} set {:?}", self.pin, level);
        Ok(())
    }
}
