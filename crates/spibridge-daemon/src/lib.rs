//! spibridge-daemon - SoC-side bridge daemon
//!
//! This crate implements the Linux half of the spibridge link: a
//! single-threaded, `poll()`-driven transaction loop that owns the spidev
//! master device, the SYNC/IRQ handshake GPIO lines, and one Unix domain
//! socket per channel.
//!
//! # Overview
//!
//! Every loop iteration is one transaction cycle. The daemon pulls SYNC
//! low, exchanges fixed-size headers with the MCU, raises SYNC high, and,
//! when the shared derivation in `spibridge-icd` selects any channels,
//! runs one batched data-phase SPI message. Bytes drained from channel
//! sockets cross to the MCU; bytes received from the MCU are written back
//! out to the sockets.
//!
//! Channels 1 and 2 (the module ports) are listener-style: an inbound
//! connection on `<base-dir>/<index>` enables the channel. Channel 0 (USB
//! pass-through) is client-style: the daemon connects outward to
//! `<base-dir>/usb` when the MCU enables its side.
//!
//! # Failure model
//!
//! Socket errors are local to their channel. SPI `ioctl` failures and
//! exceeding the consecutive-desync ceiling are fatal; an external
//! supervisor restarts the process, and the MCU needs no coordinated reset
//! because it revalidates every cycle from scratch.

mod channel;
pub mod daemon;
pub mod error;
pub mod gpio;
pub mod spi;

// Re-exports
pub use daemon::{BridgeDaemon, CycleOutcome, DaemonConfig};
pub use error::{DaemonError, Result};
pub use gpio::{IrqGpio, SyncControl, SyncGpio};
pub use spi::{mode, Segment, SpiBus, Spidev, SpidevConfig};
