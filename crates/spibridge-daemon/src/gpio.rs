//! SYNC and IRQ handshake lines
//!
//! Both lines go through the GPIO character device (gpiocdev). SYNC is an
//! output the daemon drives low to open a control phase and high to open
//! the data window; it idles high between cycles. IRQ is an input the MCU
//! pulses when it has something pending. IRQ is advisory only; the
//! per-cycle polling cadence is authoritative regardless of it.

use crate::error::Result;

use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;

use gpiocdev::line::{EdgeDetection, Offset, Value};
use gpiocdev::request::{Config, Request};

/// Seam for driving the SYNC handshake line, so the transaction loop can be
/// exercised without GPIO hardware.
pub trait SyncControl {
    /// Drive SYNC high or low.
    fn set(&mut self, high: bool) -> Result<()>;
}

/// The SYNC line as a requested GPIO output.
pub struct SyncGpio {
    request: Request,
    offset: Offset,
}

impl SyncGpio {
    /// Request `offset` on `chip` (e.g. `/dev/gpiochip0`) as the SYNC
    /// output, initially high.
    pub fn open(chip: &str, offset: Offset) -> Result<Self> {
        let mut config = Config::default();
        config.with_line(offset).as_output(Value::Active);

        let request = Request::from_config(config)
            .on_chip(chip)
            .with_consumer("spibridged")
            .request()?;

        log::debug!("gpio: sync line {}:{} requested", chip, offset);
        Ok(Self { request, offset })
    }
}

impl SyncControl for SyncGpio {
    fn set(&mut self, high: bool) -> Result<()> {
        let value = if high { Value::Active } else { Value::Inactive };
        self.request.set_value(self.offset, value)?;
        Ok(())
    }
}

/// The IRQ line as a requested GPIO input with rising-edge detection.
///
/// The daemon only uses the edge events to wake its `poll()` early; they
/// carry no payload and are drained unread-beyond-acknowledgement.
pub struct IrqGpio {
    request: Request,
}

impl IrqGpio {
    /// Request `offset` on `chip` as the IRQ input.
    pub fn open(chip: &str, offset: Offset) -> Result<Self> {
        let mut config = Config::default();
        config
            .with_line(offset)
            .as_input()
            .with_edge_detection(EdgeDetection::RisingEdge);

        let request = Request::from_config(config)
            .on_chip(chip)
            .with_consumer("spibridged")
            .request()?;

        log::debug!("gpio: irq line {}:{} requested", chip, offset);
        Ok(Self { request })
    }

    /// Borrowed fd for the poll set.
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        // The request owns the fd for as long as `self` lives.
        unsafe { BorrowedFd::borrow_raw(self.request.as_raw_fd()) }
    }

    /// Consume all pending edge events.
    pub fn drain(&mut self) -> Result<()> {
        while self.request.has_edge_event()? {
            let event = self.request.read_edge_event()?;
            log::trace!("gpio: irq edge at {}", event.timestamp_ns);
        }
        Ok(())
    }
}
