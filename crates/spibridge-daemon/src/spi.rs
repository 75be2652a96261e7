//! spidev transport
//!
//! The daemon drives the bus as SPI master through the kernel's spidev
//! character device. Each phase of a transaction cycle is one batched
//! `SPI_IOC_MESSAGE` call of half-duplex descriptors: two for the header
//! exchange, up to `MAX_TRANSFERS` for the data phase.
//!
//! [`SpiBus`] is the seam the transaction loop runs against; tests implement
//! it with an in-memory peer instead of a device file.

use crate::error::{DaemonError, Result};

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;

/// Default SPI clock speed in Hz (2 MHz)
const DEFAULT_SPEED_HZ: u32 = 2_000_000;

/// SPI mode constants
pub mod mode {
    /// SPI mode 0: CPOL=0, CPHA=0
    pub const MODE_0: u8 = 0;
    /// SPI mode 1: CPOL=0, CPHA=1
    pub const MODE_1: u8 = 1;
    /// SPI mode 2: CPOL=1, CPHA=0
    pub const MODE_2: u8 = 2;
    /// SPI mode 3: CPOL=1, CPHA=1
    pub const MODE_3: u8 = 3;
}

/// Linux spidev ioctl constants
mod ioctl {
    use nix::ioctl_write_ptr;

    // SPI ioctl magic number
    const SPI_IOC_MAGIC: u8 = b'k';

    // SPI ioctl type numbers
    const SPI_IOC_TYPE_MODE: u8 = 1;
    const SPI_IOC_TYPE_BITS_PER_WORD: u8 = 3;
    const SPI_IOC_TYPE_MAX_SPEED_HZ: u8 = 4;

    // Generate ioctl functions
    ioctl_write_ptr!(spi_ioc_wr_mode, SPI_IOC_MAGIC, SPI_IOC_TYPE_MODE, u8);
    ioctl_write_ptr!(
        spi_ioc_wr_bits_per_word,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_BITS_PER_WORD,
        u8
    );
    ioctl_write_ptr!(
        spi_ioc_wr_max_speed_hz,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_MAX_SPEED_HZ,
        u32
    );

    /// Size of spi_ioc_transfer struct (for 64-bit systems)
    pub const SPI_IOC_TRANSFER_SIZE: usize = 32;

    /// Calculate ioctl number for SPI_IOC_MESSAGE(n)
    ///
    /// SPI_IOC_MESSAGE(n) = _IOW(SPI_IOC_MAGIC, 0, char[n * sizeof(struct spi_ioc_transfer)])
    /// where _IOC(dir, type, nr, size) = ((dir)<<30)|((size)<<16)|((type)<<8)|(nr)
    pub fn spi_ioc_message(n: u8) -> libc::c_ulong {
        let size = (n as usize) * SPI_IOC_TRANSFER_SIZE;
        ((1u32 << 30) | ((size as u32) << 16) | ((SPI_IOC_MAGIC as u32) << 8)) as libc::c_ulong
    }
}

/// SPI transfer structure for ioctl
/// This must match the kernel's struct spi_ioc_transfer layout
#[repr(C)]
#[derive(Debug, Default, Clone)]
struct SpiIocTransfer {
    tx_buf: u64,          // __u64 tx_buf
    rx_buf: u64,          // __u64 rx_buf
    len: u32,             // __u32 len
    speed_hz: u32,        // __u32 speed_hz
    delay_usecs: u16,     // __u16 delay_usecs
    bits_per_word: u8,    // __u8 bits_per_word
    cs_change: u8,        // __u8 cs_change
    tx_nbits: u8,         // __u8 tx_nbits
    rx_nbits: u8,         // __u8 rx_nbits
    word_delay_usecs: u8, // __u8 word_delay_usecs
    _pad: u8,             // padding
}

/// One half-duplex descriptor in a batched SPI message.
pub enum Segment<'a> {
    /// Master transmits, slave's transmit line is ignored.
    Write(&'a [u8]),
    /// Master clocks the slave out into the buffer.
    Read(&'a mut [u8]),
}

/// Transport seam for the transaction loop.
///
/// One `transfer` call is one `SPI_IOC_MESSAGE` batch with chip select held
/// across all segments. Errors are fatal to the daemon.
pub trait SpiBus {
    /// Run the segments as one batched message, in order.
    fn transfer(&mut self, segments: &mut [Segment<'_>]) -> Result<()>;
}

/// Configuration for opening a spidev device
#[derive(Debug, Clone)]
pub struct SpidevConfig {
    /// Device path (e.g., "/dev/spidev0.1")
    pub device: String,
    /// SPI clock speed in Hz (default: 2 MHz)
    pub speed_hz: u32,
    /// SPI mode (0-3, default: 0)
    pub mode: u8,
}

impl SpidevConfig {
    /// Create a new configuration with the given device path
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            speed_hz: DEFAULT_SPEED_HZ,
            mode: mode::MODE_0,
        }
    }

    /// Set the SPI clock speed in Hz
    pub fn with_speed(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }

    /// Set the SPI mode (0-3)
    pub fn with_mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }
}

/// SPI master over the `/dev/spidevX.Y` device interface.
///
/// Bus mode and clock are fixed at open time for the life of the daemon.
pub struct Spidev {
    /// File handle for spidev device
    file: File,
    /// Clock speed stamped into every transfer descriptor
    speed_hz: u32,
}

impl Spidev {
    /// Open a spidev device with the given configuration
    pub fn open(config: &SpidevConfig) -> Result<Self> {
        log::debug!("spi: opening device {}", config.device);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|e| DaemonError::OpenFailed {
                path: config.device.clone(),
                source: e,
            })?;

        let fd = file.as_raw_fd();

        // Set SPI mode
        let mode = config.mode;
        unsafe {
            ioctl::spi_ioc_wr_mode(fd, &mode).map_err(|e| DaemonError::SetModeFailed {
                mode,
                source: io::Error::from_raw_os_error(e as i32),
            })?;
        }

        // Set bits per word (always 8)
        let bits: u8 = 8;
        unsafe {
            ioctl::spi_ioc_wr_bits_per_word(fd, &bits).map_err(|e| {
                DaemonError::SetBitsPerWordFailed {
                    bits,
                    source: io::Error::from_raw_os_error(e as i32),
                }
            })?;
        }

        // Set clock speed
        let speed = config.speed_hz;
        unsafe {
            ioctl::spi_ioc_wr_max_speed_hz(fd, &speed).map_err(|e| {
                DaemonError::SetSpeedFailed {
                    speed,
                    source: io::Error::from_raw_os_error(e as i32),
                }
            })?;
        }

        log::info!(
            "spi: opened {} (mode={}, speed={} kHz)",
            config.device,
            mode,
            speed / 1000
        );

        Ok(Self {
            file,
            speed_hz: speed,
        })
    }
}

impl SpiBus for Spidev {
    fn transfer(&mut self, segments: &mut [Segment<'_>]) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }

        let mut transfers = Vec::with_capacity(segments.len());
        for segment in segments.iter_mut() {
            let mut t = SpiIocTransfer {
                speed_hz: self.speed_hz,
                bits_per_word: 8,
                ..Default::default()
            };
            match segment {
                Segment::Write(buf) => {
                    t.tx_buf = buf.as_ptr() as u64;
                    t.len = buf.len() as u32;
                }
                Segment::Read(buf) => {
                    t.rx_buf = buf.as_mut_ptr() as u64;
                    t.len = buf.len() as u32;
                }
            }
            transfers.push(t);
        }

        let ioctl_num = ioctl::spi_ioc_message(transfers.len() as u8);
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), ioctl_num, transfers.as_ptr()) };
        if ret < 0 {
            return Err(DaemonError::Spi(io::Error::last_os_error()));
        }

        Ok(())
    }
}
