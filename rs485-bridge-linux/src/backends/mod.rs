//! Hardware backends for the bridge on Linux.
use std::io;

use rs485_bridge::{Level, TxEnable};

pub mod gpio;
pub mod tty;

/// Inverts a transmit-enable output for transceivers whose driver enable is active low.
pub struct ActiveLow<P>(pub P);

impl<P: TxEnable> TxEnable for ActiveLow<P> {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        self.0.set_level(level.inverted())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Last(Option<Level>);

    impl TxEnable for Last {
        fn set_level(&mut self, level: Level) -> io::Result<()> {
            self.0 = Some(level);
            Ok(())
        }
    }

    #[test]
    fn active_low_inverts() {
        let mut pin = ActiveLow(Last::default());
        pin.set_level(Level::High).unwrap();
        assert_eq!(pin.0.0, Some(Level::Low));
        pin.set_level(Level::Low).unwrap();
        assert_eq!(pin.0.0, Some(Level::High));
    }
}
