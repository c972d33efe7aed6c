use std::{
    error::Error,
    fmt::Display,
    io::{self},
};

/// Errors reported by [`crate::config::Builder::build`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    ZeroValue(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroValue(name) => write!(f, "{} must be greater than zero", name),
        }
    }
}

impl Error for ConfigError {}

/// Errors of the serial transceiver controller.
#[derive(Debug)]
pub enum LinkError {
    /// An operation was invoked in a direction state that does not permit it.
    /// This is a programming error in the caller, never a consequence of client input.
    Misuse {
        operation: &'static str,
        direction: &'static str,
    },
    /// The UART failed.
    Transport(io::Error),
    /// The transmit-enable output could not be driven.
    TxEnable(io::Error),
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Misuse {
                operation,
                direction,
            } => write!(
                f,
                "Transceiver misuse: {} called while direction is {}",
                operation, direction
            ),
            LinkError::Transport(error) => write!(f, "UART error: {}", error),
            LinkError::TxEnable(error) => write!(f, "TX enable output error: {}", error),
        }
    }
}

impl Error for LinkError {}

/// Fatal errors of the bridge. Per-client failures never end up here.
#[derive(Debug)]
pub enum BridgeError {
    TransceiverMisuse {
        operation: &'static str,
        direction: &'static str,
    },
    Serial(io::Error),
    TxEnable(io::Error),
    Io(io::Error),
}

impl From<LinkError> for BridgeError {
    fn from(value: LinkError) -> Self {
        match value {
            LinkError::Misuse {
                operation,
                direction,
            } => BridgeError::TransceiverMisuse {
                operation,
                direction,
            },
            LinkError::Transport(error) => BridgeError::Serial(error),
            LinkError::TxEnable(error) => BridgeError::TxEnable(error),
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(value: io::Error) -> Self {
        BridgeError::Io(value)
    }
}

impl Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::TransceiverMisuse {
                operation,
                direction,
            } => write!(
                f,
                "Transceiver misuse: {} called while direction is {}",
                operation, direction
            ),
            BridgeError::Serial(error) => write!(f, "UART error: {}", error),
            BridgeError::TxEnable(error) => write!(f, "TX enable output error: {}", error),
            BridgeError::Io(error) => write!(f, "{}", error),
        }
    }
}

impl Error for BridgeError {}

/// A client's inbound buffer cannot take the offered bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufferFull {
    pub capacity: usize,
    pub free: usize,
    pub requested: usize,
}

impl Display for BufferFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Buffer full! Capacity is {}, {} free, but got {}",
            self.capacity, self.free, self.requested
        )
    }
}

impl Error for BufferFull {}

#[test]
fn misuse_converts_to_fatal_bridge_error() {
    let err: BridgeError = LinkError::Misuse {
        operation: "send",
        direction: "Idle",
    }
    .into();
    assert!(matches!(
        err,
        BridgeError::TransceiverMisuse {
            operation: "send",
            direction: "Idle"
        }
    ));
    assert_eq!(
        err.to_string(),
        "Transceiver misuse: send called while direction is Idle"
    );
}
