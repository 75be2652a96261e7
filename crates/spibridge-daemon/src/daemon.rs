//! The transaction loop
//!
//! One `poll()` iteration is one transaction cycle; the SPI `ioctl`s block
//! for the duration of each phase, so no two cycles ever overlap, and the
//! SYNC handshake guarantees at most one transaction in flight system-wide.
//!
//! Cycle shape, in order: wait in `poll()`, acknowledge any IRQ edge, pull
//! SYNC low, service sockets, exchange headers, raise SYNC high, validate,
//! reconcile peer open/close edges, run the agreed data phase, and write
//! received payloads out to their sockets.

use crate::channel::ChannelPort;
use crate::error::{DaemonError, Result};
use crate::gpio::{IrqGpio, SyncControl};
use crate::spi::{Segment, SpiBus};

use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// `POLLRDHUP` is not surfaced by `nix::poll::PollFlags`, so build it from the
/// libc constant (peer closed its write half).
const POLLRDHUP: PollFlags = PollFlags::from_bits_retain(libc::POLLRDHUP);

use spibridge_icd::{
    plan_transfers, ControlPkt, Direction, Status, TransferPlan, CHANNEL_PORT_A, CHANNEL_PORT_B,
    CHANNEL_USB, CMD_ACK, NUM_CHANNELS,
};

/// Default ceiling on consecutive desynchronized cycles.
const DEFAULT_MAX_RETRIES: u32 = 500;

/// Default `poll()` timeout. The cycle runs even when nothing woke us; the
/// polling cadence, not the IRQ line, is the authoritative driver.
const DEFAULT_POLL_TIMEOUT_MS: u16 = 5000;

/// Settle time between the header and data phases; the slave needs the gap
/// to arm its data-phase DMA.
const INTER_PHASE_DELAY_US: u64 = 20;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding the per-channel sockets.
    pub socket_dir: PathBuf,
    /// Consecutive-desync ceiling; exceeding it is fatal.
    pub max_retries: u32,
    /// `poll()` timeout per cycle, in milliseconds.
    pub poll_timeout_ms: u16,
}

impl DaemonConfig {
    /// Configuration with the given socket directory and default timings.
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }

    /// Set the consecutive-desync ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-cycle `poll()` timeout.
    pub fn with_poll_timeout_ms(mut self, poll_timeout_ms: u16) -> Self {
        self.poll_timeout_ms = poll_timeout_ms;
        self
    }
}

/// Summary of one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// The peer's header failed validation and the data phase was skipped.
    pub desync: bool,
    /// Data-phase descriptors issued.
    pub transfers: usize,
}

#[derive(Clone, Copy)]
enum Slot {
    Irq,
    Conn(usize),
    Listener(usize),
}

/// The SoC-side bridge daemon.
///
/// Generic over its bus and SYNC seams so the transaction loop can run
/// against an in-memory peer in tests.
pub struct BridgeDaemon<B, S> {
    bus: B,
    sync: S,
    irq: Option<IrqGpio>,
    ports: [ChannelPort; NUM_CHANNELS],
    /// Peer enabled mask as of the last valid header.
    peer_open: u8,
    /// Consecutive desynchronized cycles.
    retries: u32,
    config: DaemonConfig,
}

impl<B: SpiBus, S: SyncControl> BridgeDaemon<B, S> {
    /// Bind the channel sockets and assemble the daemon.
    pub fn new(bus: B, sync: S, irq: Option<IrqGpio>, config: DaemonConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.socket_dir).map_err(|e| DaemonError::Socket {
            path: config.socket_dir.clone(),
            source: e,
        })?;

        let ports = [
            ChannelPort::client(config.socket_dir.join("usb")),
            ChannelPort::listener(&config.socket_dir.join(CHANNEL_PORT_A.to_string()))?,
            ChannelPort::listener(&config.socket_dir.join(CHANNEL_PORT_B.to_string()))?,
        ];

        Ok(Self {
            bus,
            sync,
            irq,
            ports,
            peer_open: 0,
            retries: 0,
            config,
        })
    }

    /// Run transaction cycles until a fatal error.
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "bridge: entering transaction loop (sockets in {})",
            self.config.socket_dir.display()
        );
        loop {
            self.cycle()?;
        }
    }

    /// Consecutive desynchronized cycles so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Peer enabled mask as of the last valid header.
    pub fn peer_open_mask(&self) -> u8 {
        self.peer_open
    }

    /// Execute one transaction cycle.
    pub fn cycle(&mut self) -> Result<CycleOutcome> {
        let events = self.poll_events()?;

        // Acknowledge the advisory IRQ edge, if any. The cycle below runs
        // either way.
        if events
            .iter()
            .any(|(slot, ev)| matches!(slot, Slot::Irq) && !ev.is_empty())
        {
            if let Some(irq) = self.irq.as_mut() {
                irq.drain()?;
            }
        }

        // Control phase.
        self.sync.set(false)?;

        for (slot, revents) in &events {
            match *slot {
                Slot::Listener(i) if revents.contains(PollFlags::POLLIN) => {
                    match self.ports[i].accept() {
                        Ok(()) => log::info!("channel {}: accepted connection", i),
                        Err(e) => log::warn!("channel {}: accept failed: {}", i, e),
                    }
                }
                Slot::Conn(i) => self.service_conn(i, *revents),
                _ => {}
            }
        }

        let request = self.build_header();
        let tx_raw = request.to_bytes();
        let mut rx_raw = [0u8; ControlPkt::WIRE_SIZE];
        self.bus
            .transfer(&mut [Segment::Write(&tx_raw), Segment::Read(&mut rx_raw)])?;

        // Data window opens for the peer.
        self.sync.set(true)?;

        let reply = ControlPkt::from_bytes(&rx_raw);
        if reply.cmd != CMD_ACK {
            self.retries += 1;
            log::warn!(
                "bridge: bad header cmd {:#04x} from peer (retry {}/{})",
                reply.cmd,
                self.retries,
                self.config.max_retries
            );
            if self.retries > self.config.max_retries {
                return Err(DaemonError::ExcessiveRetries {
                    count: self.retries,
                });
            }
            return Ok(CycleOutcome {
                desync: true,
                transfers: 0,
            });
        }
        self.retries = 0;

        thread::sleep(Duration::from_micros(INTER_PHASE_DELAY_US));

        self.reconcile_peer_open(reply.status().open_mask());

        let plan = plan_transfers(&request, &reply);
        if !plan.is_empty() {
            self.data_phase(&plan)?;
        }

        Ok(CycleOutcome {
            desync: false,
            transfers: plan.len(),
        })
    }

    /// Wait for socket or IRQ activity, or the cycle timeout.
    fn poll_events(&self) -> Result<Vec<(Slot, PollFlags)>> {
        let mut tags = Vec::new();
        let mut fds = Vec::new();

        if let Some(irq) = &self.irq {
            fds.push(PollFd::new(irq.poll_fd(), PollFlags::POLLIN));
            tags.push(Slot::Irq);
        }

        for (i, port) in self.ports.iter().enumerate() {
            if let Some(conn) = port.conn() {
                let mut events = POLLRDHUP;
                if port.want_read {
                    events |= PollFlags::POLLIN;
                }
                if port.want_pollout {
                    events |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(conn.as_fd(), events));
                tags.push(Slot::Conn(i));
            } else if let Some(listener) = port.acceptor() {
                fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                tags.push(Slot::Listener(i));
            }
        }

        poll(&mut fds, PollTimeout::from(self.config.poll_timeout_ms))
            .map_err(|e| DaemonError::Poll(io::Error::from(e)))?;

        Ok(tags
            .into_iter()
            .zip(fds.iter().map(|fd| fd.revents().unwrap_or(PollFlags::empty())))
            .collect())
    }

    /// Handle readiness on one live connection.
    fn service_conn(&mut self, i: usize, revents: PollFlags) {
        let port = &mut self.ports[i];
        let mut broken = false;

        if revents.contains(PollFlags::POLLIN) {
            match port.drain() {
                Ok(0) => broken = true,
                Ok(n) => log::trace!("channel {}: drained {} bytes", i, n),
                Err(e) => {
                    log::warn!("channel {}: read failed: {}", i, e);
                    broken = true;
                }
            }
        }

        if broken
            || revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | POLLRDHUP)
        {
            log::info!("channel {}: connection closed", i);
            port.close();
            return;
        }

        if revents.contains(PollFlags::POLLOUT) {
            port.writable = true;
            port.want_pollout = false;
        }
    }

    /// Build this cycle's request header from channel state.
    fn build_header(&self) -> ControlPkt {
        let mut size = [0u8; NUM_CHANNELS];
        let mut ready = 0u8;
        let mut open = 0u8;
        for (i, port) in self.ports.iter().enumerate() {
            size[i] = port.out_len;
            if port.writable {
                ready |= 1 << i;
            }
            if port.is_open() {
                open |= 1 << i;
            }
        }
        ControlPkt::request(Status::new(ready, open), size)
    }

    /// React to peer enabled-bit edges from a freshly validated header.
    ///
    /// The client-style channel connects outward on a rising edge and
    /// closes on a falling one. Listener channels are locally driven, but a
    /// peer that went away still closes the live connection and re-arms
    /// the listener.
    fn reconcile_peer_open(&mut self, now: u8) {
        let before = self.peer_open;
        self.peer_open = now;

        for i in 0..NUM_CHANNELS {
            let bit = 1u8 << i;
            let rose = now & bit != 0 && before & bit == 0;
            let fell = now & bit == 0 && before & bit != 0;

            if i == CHANNEL_USB {
                if rose && !self.ports[i].is_open() {
                    match self.ports[i].connect() {
                        Ok(()) => log::info!("channel {}: connected to usb endpoint", i),
                        Err(e) => log::warn!("channel {}: connect failed: {}", i, e),
                    }
                }
                if fell && self.ports[i].is_open() {
                    log::info!("channel {}: peer disabled, disconnecting", i);
                    self.ports[i].close();
                }
            } else if fell && self.ports[i].is_open() {
                log::info!("channel {}: peer disabled, dropping connection", i);
                self.ports[i].close();
            }
        }
    }

    /// Run the agreed data phase and route received payloads to sockets.
    fn data_phase(&mut self, plan: &TransferPlan) -> Result<()> {
        let (bus, ports) = (&mut self.bus, &mut self.ports);

        // Segments in plan order: channels ascending, write before read.
        // Each channel contributes at most one of each, so the per-port
        // split borrows are disjoint.
        let mut segments: Vec<Segment<'_>> = Vec::with_capacity(plan.len());
        for (i, port) in ports.iter_mut().enumerate() {
            let (out_buf, in_buf) = port.bufs_mut();
            let tx = plan
                .iter()
                .find(|t| t.channel == i && t.direction == Direction::SocToMcu);
            let rx = plan
                .iter()
                .find(|t| t.channel == i && t.direction == Direction::McuToSoc);
            if let Some(t) = tx {
                segments.push(Segment::Write(&out_buf[..t.len as usize]));
            }
            if let Some(t) = rx {
                segments.push(Segment::Read(&mut in_buf[..t.len as usize]));
            }
        }
        bus.transfer(&mut segments)?;
        drop(segments);

        for t in plan.iter() {
            let port = &mut self.ports[t.channel];
            match t.direction {
                Direction::SocToMcu => {
                    // Sent: free the buffer and resume reading the socket.
                    port.out_len = 0;
                    port.want_read = true;
                }
                Direction::McuToSoc => {
                    if let Err(e) = port.send(t.len as usize) {
                        log::warn!("channel {}: write failed: {}", t.channel, e);
                        port.close();
                    }
                }
            }
        }

        Ok(())
    }
}
