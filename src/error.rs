//! Custom error types for the station.
//!
//! This module defines the primary error type, `StationError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it provides one consistent way to report failures,
//! from configuration issues to serial-port problems and device lookup misses.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading the station configuration.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration (a zero
//!   sample count, an empty listener address). Raised by the validation step.
//! - **`Io`**: Wraps `std::io::Error`, covering socket, file and serial read/write errors.
//! - **`Serial`**: Failures opening or configuring a serial port.
//! - **`DeviceNotFound`**: The device registry has no factory for the requested kind/name.
//! - **`DeviceInit`**: A configured device could not be brought up. This is fatal at
//!   startup; the station refuses to enter service with a missing device.
//! - **`InvalidArgument`**: A caller broke an operation's precondition (for example an empty
//!   frame set handed to a capture session).
//! - **`Timeout`**: A bounded wait expired (frame collection, device answers).
//! - **`Server`** / **`Sender`**: HTTP/WebSocket listener and outbound sender failures.
//! - **`Document`**: Wraps `quick_xml` errors while rendering a result document.
//!
//! Transient device noise (malformed frames) is never turned into a `StationError`; the
//! protocol adapters log and drop it. Algorithm failures are reported as
//! [`CalculationStatus`](crate::result::CalculationStatus) values, not errors.

use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type AppResult<T> = std::result::Result<T, StationError>;

/// Errors raised by the station.
#[derive(Error, Debug)]
pub enum StationError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured.
    #[error("Serial port error on {port}: {message}")]
    Serial {
        /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
        port: String,
        /// Driver message.
        message: String,
    },

    /// No factory registered for the requested device.
    #[error("Device not found: {kind} \"{name}\"")]
    DeviceNotFound {
        /// Device kind (scales, scanner, ...).
        kind: String,
        /// Requested device name.
        name: String,
    },

    /// A configured device failed to start.
    #[error("Device initialization failed for {device}: {message}")]
    DeviceInit {
        /// Device description.
        device: String,
        /// Failure reason.
        message: String,
    },

    /// An operation precondition was violated by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// HTTP or WebSocket listener failure.
    #[error("Server error: {0}")]
    Server(String),

    /// Result document could not be rendered.
    #[error("Result document error: {0}")]
    Document(#[from] quick_xml::Error),

    /// Outbound sender failure.
    #[error("Sender {sender} failed: {message}")]
    Sender {
        /// Sender name.
        sender: String,
        /// Failure reason.
        message: String,
    },
}

impl From<figment::Error> for StationError {
    fn from(err: figment::Error) -> Self {
        StationError::Config(Box::new(err))
    }
}

impl From<tokio_serial::Error> for StationError {
    fn from(err: tokio_serial::Error) -> Self {
        StationError::Serial {
            port: String::from("<unknown>"),
            message: err.to_string(),
        }
    }
}

impl StationError {
    /// Shorthand for a device initialization failure.
    pub fn device_init(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StationError::DeviceInit {
            device: device.into(),
            message: message.to_string(),
        }
    }

    /// True for errors that must keep the station out of service.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StationError::Config(_)
                | StationError::Configuration(_)
                | StationError::DeviceNotFound { .. }
                | StationError::DeviceInit { .. }
                | StationError::Serial { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_not_found_display() {
        let err = StationError::DeviceNotFound {
            kind: "scales".into(),
            name: "acme".into(),
        };
        assert_eq!(err.to_string(), "Device not found: scales \"acme\"");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: StationError = io.into();
        assert!(matches!(err, StationError::Io(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_device_init_helper() {
        let err = StationError::device_init("casm@/dev/ttyS0", "port busy");
        assert_eq!(
            err.to_string(),
            "Device initialization failed for casm@/dev/ttyS0: port busy"
        );
    }
}
