//! Serial side of deej: the slider board connection and its line protocol

pub mod connection;
pub mod decoder;

use thiserror::Error;

use crate::config::SliderIndex;

pub use connection::{available_ports, SerialConnection};
pub use decoder::LineDecoder;

/// One significant slider movement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderMoveEvent {
    pub slider_id: SliderIndex,
    /// In [0, 1], two-decimal precision
    pub percent_value: f32,
}

/// Errors from opening or reading the serial port
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("serial port {port} is busy")]
    Busy { port: String },

    #[error("serial port {port} not found")]
    NotFound { port: String },

    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(#[source] tokio_serial::Error),

    #[error("serial connection already active")]
    AlreadyActive,

    #[error("serial connection closed by device")]
    Closed,

    #[error("failed to read from serial port: {0}")]
    Read(#[from] std::io::Error),
}

impl SerialError {
    /// Short user-facing advice for open failures
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SerialError::Busy { .. } => {
                Some("Close other applications using the port and try again.")
            }
            SerialError::NotFound { .. } => {
                Some("Ensure the correct port is set in the configuration (see --list-ports).")
            }
            _ => None,
        }
    }
}
