//! The bridge engine proper
//!
//! [`BridgeEngine`] holds all mutable bridge state in one place: channel
//! book-keeping, the outgoing header, and the header snapshot for the cycle
//! in flight. Event entry points return [`Action`]s for the hardware binding
//! layer and [`Completions`] for the consumer dispatch layer; the engine
//! itself performs no I/O and calls no callbacks.

use crate::channel::ChannelState;
use crate::state::{advance, BridgeState, Event};

use spibridge_icd::{
    plan_transfers, ControlPkt, Status, TransferPlan, CMD_REQUEST, MAX_PAYLOAD, NUM_CHANNELS,
};

/// What the hardware binding layer must do after an event entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to start.
    None,
    /// Abort any DMA in flight, reset and reinitialize the SPI slave (SYNC
    /// substitutes for a frame pulse; the peripheral FIFO must be cleared),
    /// then start the header read+write against the engine's
    /// [`outgoing_header`](BridgeEngine::outgoing_header).
    StartControl,
    /// Build and start the data-phase DMA chain for exactly this plan, in
    /// this order.
    StartData(TransferPlan),
}

/// One consumer-visible event produced by a finished (or synthesized)
/// data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Peer enabled bit rose for this channel.
    Opened(usize),
    /// Peer enabled bit fell for this channel.
    Closed(usize),
    /// Queued outgoing payload was taken by the peer.
    In(usize),
    /// Armed receive finished; `len` bytes are in the channel's receive
    /// buffer.
    Out {
        /// Channel index.
        channel: usize,
        /// Received payload length.
        len: u8,
    },
}

/// Completion set for one cycle: per channel at most one open/close edge,
/// one receive, one send.
pub type Completions = heapless::Vec<Completion, { NUM_CHANNELS * 3 }>;

/// Both headers of the cycle in flight, captured at header acceptance.
///
/// The live DMA header buffer may legally be overwritten by the next
/// SYNC-low interrupt while the data-phase completion still needs these
/// fields, so the completion path reads only this copy.
#[derive(Clone, Copy)]
struct HeaderSnapshot {
    local: ControlPkt,
    peer: ControlPkt,
}

/// All MCU-side bridge state.
pub struct BridgeEngine {
    state: BridgeState,
    chans: [ChannelState; NUM_CHANNELS],
    ctrl_tx: ControlPkt,
    snapshot: Option<HeaderSnapshot>,
    /// Peer enabled mask for which open/close has already been delivered.
    peer_open: u8,
    /// Advisory IRQ line level mirrored to the pin by the binding layer.
    irq: bool,
    /// Cycles dropped on a bad header cmd. Diagnostic only; recovery needs
    /// no state because every cycle revalidates from scratch.
    dropped: u32,
}

impl BridgeEngine {
    /// A fresh engine in `Disabled`; call [`init`](Self::init) once the
    /// peripherals are configured.
    pub const fn new() -> Self {
        Self {
            state: BridgeState::Disabled,
            chans: [ChannelState::new(); NUM_CHANNELS],
            ctrl_tx: ControlPkt::ack(Status::new(0, 0), [0; NUM_CHANNELS]),
            snapshot: None,
            peer_open: 0,
            irq: false,
            dropped: 0,
        }
    }

    /// Peripherals are configured; start accepting SYNC pulses.
    pub fn init(&mut self) {
        self.state = advance(self.state, Event::Activate);
    }

    /// The SPI/DMA hardware is being repurposed. Channel state, any queued
    /// payloads, and the cycle in flight are discarded; the caller aborts
    /// DMA and resets the peripheral synchronously.
    pub fn shutdown(&mut self) {
        self.state = advance(self.state, Event::Shutdown);
        self.snapshot = None;
        self.irq = false;
        for ch in &mut self.chans {
            *ch = ChannelState::new();
        }
        self.peer_open = 0;
    }

    // ------------------------------------------------------------------
    // Hardware event entry points
    // ------------------------------------------------------------------

    /// SYNC fell: the SoC opened a control phase.
    ///
    /// Builds the outgoing header from the current channel state and asks
    /// the binding layer to (re)start the header exchange. Any cycle in
    /// flight is abandoned.
    pub fn sync_falling(&mut self) -> Action {
        if self.state == BridgeState::Disabled {
            return Action::None;
        }

        self.snapshot = None;

        let mut size = [0u8; NUM_CHANNELS];
        let mut ready = 0u8;
        let mut enabled = 0u8;
        for (i, ch) in self.chans.iter().enumerate() {
            size[i] = ch.out_len;
            if ch.ready {
                ready |= 1 << i;
            }
            if ch.enabled {
                enabled |= 1 << i;
            }
        }
        self.ctrl_tx = ControlPkt::ack(Status::new(ready, enabled), size);

        self.state = advance(self.state, Event::SyncFalling);
        Action::StartControl
    }

    /// SYNC rose: the SoC opened the data window. The slave side has
    /// nothing to do; its data phase is driven by DMA completion.
    pub fn sync_rising(&mut self) -> Action {
        self.state = advance(self.state, Event::SyncRising);
        Action::None
    }

    /// Header exchange completed; `raw` is the received header buffer.
    ///
    /// On a bad `cmd` the cycle is dropped silently (expected transient
    /// noise, self-heals on the next SYNC pulse). On a good header the
    /// transfer plan is derived; completions are returned directly when the
    /// plan is empty but an open/close edge still has to be delivered.
    pub fn header_received(
        &mut self,
        raw: &[u8; ControlPkt::WIRE_SIZE],
    ) -> (Action, Completions) {
        if self.state != BridgeState::Ctrl {
            return (Action::None, Completions::new());
        }

        let peer = ControlPkt::from_bytes(raw);
        if peer.cmd != CMD_REQUEST {
            self.dropped = self.dropped.wrapping_add(1);
            log::warn!(
                "bridge: bad header cmd {:#04x}, dropping cycle (total {})",
                peer.cmd,
                self.dropped
            );
            self.state = advance(self.state, Event::HeaderInvalid);
            return (Action::None, Completions::new());
        }

        // Header accepted: the advisory IRQ request has been serviced.
        self.irq = false;

        let local = self.ctrl_tx;
        self.snapshot = Some(HeaderSnapshot { local, peer });

        let plan = plan_transfers(&peer, &local);
        if !plan.is_empty() {
            self.state = advance(self.state, Event::HeaderValid { transfers: true });
            (Action::StartData(plan), Completions::new())
        } else if peer.status().open_mask() != self.peer_open {
            // Nothing to move, but open/close edges must still be delivered
            // this cycle: take the data path and complete it immediately.
            self.state = advance(self.state, Event::HeaderValid { transfers: true });
            let comps = self.finish_data();
            (Action::None, comps)
        } else {
            self.snapshot = None;
            self.state = advance(self.state, Event::HeaderValid { transfers: false });
            (Action::None, Completions::new())
        }
    }

    /// Data-phase DMA completed.
    pub fn data_complete(&mut self) -> Completions {
        if self.state != BridgeState::Data {
            return Completions::new();
        }
        self.finish_data()
    }

    fn finish_data(&mut self) -> Completions {
        let mut comps = Completions::new();
        let Some(snap) = self.snapshot.take() else {
            self.state = advance(self.state, Event::DataComplete);
            return comps;
        };

        // Open/close edges, exactly once per transition.
        let now = snap.peer.status().open_mask();
        for c in 0..NUM_CHANNELS {
            let bit = 1u8 << c;
            if now & bit != 0 && self.peer_open & bit == 0 {
                let _ = comps.push(Completion::Opened(c));
            }
            if now & bit == 0 && self.peer_open & bit != 0 {
                let _ = comps.push(Completion::Closed(c));
            }
        }
        self.peer_open = now;

        // Receive completions for all channels, then send completions, in
        // the order the transfers ran on the wire. A channel disabled after
        // the header went out gets its flags cleared but no callback.
        for c in 0..NUM_CHANNELS {
            if snap.local.status().ready(c) && snap.peer.size[c] > 0 {
                self.chans[c].ready = false;
                if self.chans[c].enabled {
                    let _ = comps.push(Completion::Out {
                        channel: c,
                        len: snap.peer.size[c],
                    });
                }
            }
        }
        for c in 0..NUM_CHANNELS {
            if snap.peer.status().ready(c) && snap.local.size[c] > 0 {
                self.chans[c].out_len = 0;
                if self.chans[c].enabled {
                    let _ = comps.push(Completion::In(c));
                }
            }
        }

        self.state = advance(self.state, Event::DataComplete);
        comps
    }

    // ------------------------------------------------------------------
    // Consumer API (call through `Bridge` when interrupts are live)
    // ------------------------------------------------------------------

    /// Queue an outgoing payload on `channel` and raise the advisory IRQ.
    ///
    /// Replaces any payload already queued. A payload longer than the
    /// channel buffer is a firmware bug and traps.
    pub fn start_in(&mut self, channel: usize, payload: &[u8]) {
        assert!(
            payload.len() <= MAX_PAYLOAD,
            "bridge: payload exceeds channel buffer"
        );
        let ch = &mut self.chans[channel];
        ch.tx_buf[..payload.len()].copy_from_slice(payload);
        ch.out_len = payload.len() as u8;
        self.irq = true;
    }

    /// Arm the receive side of `channel` and raise the advisory IRQ.
    pub fn start_out(&mut self, channel: usize) {
        self.chans[channel].ready = true;
        self.irq = true;
    }

    /// Mark `channel` wanted-active; the peer observes the open edge after
    /// one full successful cycle.
    pub fn enable(&mut self, channel: usize) {
        self.chans[channel].enabled = true;
        self.irq = true;
    }

    /// Mark `channel` inactive. Clears the queued outgoing length and the
    /// receive arm immediately; no transfer happens for this channel
    /// afterward, and a cycle already in flight completes without
    /// callbacks for it.
    pub fn disable(&mut self, channel: usize) {
        let ch = &mut self.chans[channel];
        ch.enabled = false;
        ch.out_len = 0;
        ch.ready = false;
        self.irq = true;
    }

    // ------------------------------------------------------------------
    // Accessors for the binding layer
    // ------------------------------------------------------------------

    /// Current machine state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Level the advisory IRQ pin should be driven to.
    pub fn irq_level(&self) -> bool {
        self.irq
    }

    /// Header the control-phase DMA clocks out.
    pub fn outgoing_header(&self) -> ControlPkt {
        self.ctrl_tx
    }

    /// Outgoing payload storage the data-phase DMA reads from.
    pub fn outgoing(&self, channel: usize) -> &[u8] {
        &self.chans[channel].tx_buf
    }

    /// Receive storage, read side.
    pub fn incoming(&self, channel: usize) -> &[u8] {
        &self.chans[channel].rx_buf
    }

    /// Receive storage the data-phase DMA writes into.
    pub fn incoming_mut(&mut self, channel: usize) -> &mut [u8] {
        &mut self.chans[channel].rx_buf
    }

    /// Cycles dropped on a bad header cmd since boot.
    pub fn dropped_cycles(&self) -> u32 {
        self.dropped
    }
}

impl Default for BridgeEngine {
    fn default() -> Self {
        Self::new()
    }
}
