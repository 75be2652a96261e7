//! Per-channel state and the consumer callback surface

use spibridge_icd::{MAX_PAYLOAD, NUM_CHANNELS};

/// Callbacks a channel consumer receives from the bridge.
///
/// One handler per channel, collected in a [`HandlerTable`]. Handlers run in
/// interrupt context on target; keep them short. They may re-enter the
/// [`Bridge`](crate::Bridge) consumer API (for example to re-arm a receive
/// buffer from `on_complete_out`).
pub trait ChannelHandler {
    /// The peer's enabled bit for this channel turned on.
    fn on_open(&mut self) {}

    /// The peer's enabled bit for this channel turned off.
    fn on_close(&mut self) {}

    /// A payload queued with `start_in` was fully taken by the peer.
    fn on_complete_in(&mut self) {}

    /// A receive armed with `start_out` finished; `data` is the payload the
    /// peer sent. The slice is only valid for the duration of the call.
    fn on_complete_out(&mut self, _data: &[u8]) {}
}

/// Fixed table of per-channel handlers, indexed by channel number.
pub type HandlerTable<'a> = [&'a mut dyn ChannelHandler; NUM_CHANNELS];

/// Book-keeping and buffers for one channel.
///
/// Buffers live inside the engine rather than being lent in by reference:
/// `start_in` copies the payload in, `on_complete_out` lends the received
/// bytes out, and nothing outlives a callback.
#[derive(Clone, Copy)]
pub(crate) struct ChannelState {
    /// The local consumer wants this channel active.
    pub enabled: bool,
    /// A receive is armed; advertised as the ready bit.
    pub ready: bool,
    /// Queued outgoing length, 0 when nothing is pending.
    pub out_len: u8,
    /// Outgoing payload storage (toward the SoC).
    pub tx_buf: [u8; MAX_PAYLOAD],
    /// Receive storage (from the SoC), filled by the data-phase DMA.
    pub rx_buf: [u8; MAX_PAYLOAD],
}

impl ChannelState {
    pub const fn new() -> Self {
        Self {
            enabled: false,
            ready: false,
            out_len: 0,
            tx_buf: [0; MAX_PAYLOAD],
            rx_buf: [0; MAX_PAYLOAD],
        }
    }
}
