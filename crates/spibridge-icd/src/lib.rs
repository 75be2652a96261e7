//! Interface Control Document for the spibridge channel protocol
//!
//! This crate defines the wire types shared between the MCU bridge engine
//! and the SoC bridge daemon: the control header exchanged at the start of
//! every transaction cycle, the status-byte bit layout, and the derivation
//! of the data-phase transfer set.
//!
//! Both sides depend on this one definition. There is no negotiation round
//! in the protocol: after the header exchange, each side independently
//! derives the same ordered list of data transfers from the same bytes.
//! Keeping that derivation here, as a single pure function, is what makes
//! the two event loops agree byte-for-byte.

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// CONSTANTS
// ============================================================================

/// Number of multiplexed channels carried by the bridge.
pub const NUM_CHANNELS: usize = 3;

/// Largest payload a channel can move in one transaction cycle.
///
/// Sizes travel in a single wire byte, so this is also the hard protocol
/// ceiling.
pub const MAX_PAYLOAD: usize = 255;

/// Upper bound on data-phase transfers in one cycle (one each way per channel).
pub const MAX_TRANSFERS: usize = NUM_CHANNELS * 2;

/// `cmd` value marking a SoC-originated header.
pub const CMD_REQUEST: u8 = 0x53;

/// `cmd` value marking the MCU's acknowledging header.
pub const CMD_ACK: u8 = 0xCA;

/// USB pass-through channel. The daemon side is the connecting client.
pub const CHANNEL_USB: usize = 0;

/// Module Port A channel. The daemon side listens.
pub const CHANNEL_PORT_A: usize = 1;

/// Module Port B channel. The daemon side listens.
pub const CHANNEL_PORT_B: usize = 2;

const READY_SHIFT: u8 = 0;
const OPEN_SHIFT: u8 = 4;
const CHANNEL_MASK: u8 = (1 << NUM_CHANNELS) - 1;

// ============================================================================
// STATUS BYTE
// ============================================================================

/// The packed per-channel status byte carried in every control header.
///
/// Bits 0..2 signal ready-to-receive for channels 0..2; bits 4..6 signal
/// enabled (the sender's view) / open (the receiver's view) for the same
/// channels. The two nibbles never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u8);

impl Status {
    /// Pack ready and enabled channel masks into one status byte.
    pub const fn new(ready: u8, enabled: u8) -> Self {
        Self(((ready & CHANNEL_MASK) << READY_SHIFT) | ((enabled & CHANNEL_MASK) << OPEN_SHIFT))
    }

    /// Rebuild from a raw wire byte.
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// The raw wire byte.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Whether the sender has a receive buffer posted for `channel`.
    pub const fn ready(self, channel: usize) -> bool {
        self.0 & (1 << (READY_SHIFT + channel as u8)) != 0
    }

    /// Whether the sender considers `channel` enabled.
    pub const fn open(self, channel: usize) -> bool {
        self.0 & (1 << (OPEN_SHIFT + channel as u8)) != 0
    }

    /// The ready bits as a channel mask (bit n = channel n).
    pub const fn ready_mask(self) -> u8 {
        (self.0 >> READY_SHIFT) & CHANNEL_MASK
    }

    /// The enabled/open bits as a channel mask (bit n = channel n).
    pub const fn open_mask(self) -> u8 {
        (self.0 >> OPEN_SHIFT) & CHANNEL_MASK
    }
}

// ============================================================================
// CONTROL HEADER
// ============================================================================

/// The fixed-size header exchanged at the start of every transaction cycle.
///
/// Wire layout, `WIRE_SIZE` bytes total:
///
/// | byte | field     |
/// |------|-----------|
/// | 0    | `cmd`     |
/// | 1    | `status`  |
/// | 2..  | `size[n]` |
///
/// `size[n]` is the sender's pending outgoing length for channel `n`,
/// zero when it has nothing queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlPkt {
    /// `CMD_REQUEST` or `CMD_ACK`; anything else is a desync.
    pub cmd: u8,
    /// Packed [`Status`] byte.
    pub status: u8,
    /// Per-channel pending outgoing lengths.
    pub size: [u8; NUM_CHANNELS],
}

impl ControlPkt {
    /// Size of the header on the wire.
    pub const WIRE_SIZE: usize = 2 + NUM_CHANNELS;

    /// Build a SoC-side request header.
    pub const fn request(status: Status, size: [u8; NUM_CHANNELS]) -> Self {
        Self {
            cmd: CMD_REQUEST,
            status: status.raw(),
            size,
        }
    }

    /// Build an MCU-side acknowledging header.
    pub const fn ack(status: Status, size: [u8; NUM_CHANNELS]) -> Self {
        Self {
            cmd: CMD_ACK,
            status: status.raw(),
            size,
        }
    }

    /// The packed status byte as a [`Status`].
    pub const fn status(&self) -> Status {
        Status::from_raw(self.status)
    }

    /// Serialize to the wire layout.
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0] = self.cmd;
        out[1] = self.status;
        out[2..].copy_from_slice(&self.size);
        out
    }

    /// Parse from the wire layout. Performs no `cmd` validation; the caller
    /// decides how to treat a desynchronized header.
    pub fn from_bytes(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut size = [0u8; NUM_CHANNELS];
        size.copy_from_slice(&raw[2..]);
        Self {
            cmd: raw[0],
            status: raw[1],
            size,
        }
    }
}

// ============================================================================
// TRANSFER SET DERIVATION
// ============================================================================

/// Direction of one data-phase transfer, named from the wire's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// SoC transmits, MCU receives.
    SocToMcu,
    /// MCU transmits, SoC receives.
    McuToSoc,
}

/// One agreed data-phase transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Channel index.
    pub channel: usize,
    /// Who transmits.
    pub direction: Direction,
    /// Transfer length in bytes, 1..=255.
    pub len: u8,
}

/// The ordered set of data-phase transfers for one cycle.
pub type TransferPlan = heapless::Vec<Transfer, MAX_TRANSFERS>;

/// Derive the data-phase transfer set from one exchanged header pair.
///
/// A channel transfers in a given direction iff the sender declared a
/// nonzero size for it and the receiver's ready bit is set. Order is part
/// of the protocol: channels ascending, and within a channel the SoC→MCU
/// transfer precedes the MCU→SoC transfer.
///
/// Both sides call this with the same two headers (each passes its own
/// transmitted header plus the one it received), so the derived descriptor
/// lists match without any further communication.
pub fn plan_transfers(soc: &ControlPkt, mcu: &ControlPkt) -> TransferPlan {
    let mut plan = TransferPlan::new();

    for channel in 0..NUM_CHANNELS {
        if mcu.status().ready(channel) && soc.size[channel] > 0 {
            // Capacity is MAX_TRANSFERS by construction.
            let _ = plan.push(Transfer {
                channel,
                direction: Direction::SocToMcu,
                len: soc.size[channel],
            });
        }
        if soc.status().ready(channel) && mcu.size[channel] > 0 {
            let _ = plan.push(Transfer {
                channel,
                direction: Direction::McuToSoc,
                len: mcu.size[channel],
            });
        }
    }

    plan
}
