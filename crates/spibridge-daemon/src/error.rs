//! Error types for the bridge daemon
//!
//! The taxonomy follows the protocol's recovery rules: socket errors are
//! handled locally per channel and never surface here; everything in this
//! enum either aborts daemon startup or kills the transaction loop.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal daemon errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Failed to open the spidev device
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to set SPI mode
    #[error("Failed to set SPI mode to {mode}: {source}")]
    SetModeFailed {
        mode: u8,
        #[source]
        source: io::Error,
    },

    /// Failed to set bits per word
    #[error("Failed to set bits per word to {bits}: {source}")]
    SetBitsPerWordFailed {
        bits: u8,
        #[source]
        source: io::Error,
    },

    /// Failed to set clock speed
    #[error("Failed to set clock speed to {speed} Hz: {source}")]
    SetSpeedFailed {
        speed: u32,
        #[source]
        source: io::Error,
    },

    /// SPI transfer failed. Buffer contents are indeterminate after a
    /// driver-level failure, so no partial-cycle recovery is attempted.
    #[error("SPI transfer failed: {0}")]
    Spi(#[source] io::Error),

    /// GPIO line request or operation failed
    #[error("GPIO error: {0}")]
    Gpio(#[from] gpiocdev::Error),

    /// Listening socket setup failed
    #[error("Failed to set up socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// poll() failed
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// Too many consecutive desynchronized cycles; the external supervisor
    /// is expected to restart the daemon.
    #[error("{count} consecutive desynchronized cycles, giving up")]
    ExcessiveRetries { count: u32 },
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
