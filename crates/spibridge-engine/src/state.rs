//! Bridge state machine
//!
//! The transition table is pure so it can be tested exhaustively without any
//! engine context. The engine feeds it one [`Event`] per hardware interrupt
//! and performs the side effects itself.

/// Lifecycle of the MCU bridge engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Peripherals unconfigured or repurposed; all events ignored.
    Disabled,
    /// Between transaction cycles, header DMA armed, waiting for SYNC.
    Idle,
    /// Control phase: header exchange in flight.
    Ctrl,
    /// Data phase: payload descriptors in flight.
    Data,
}

/// One hardware or lifecycle event fed to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Peripherals configured; the engine may leave `Disabled`.
    Activate,
    /// SYNC fell: the SoC opened a control phase.
    SyncFalling,
    /// SYNC rose: the SoC opened the data window.
    SyncRising,
    /// Header DMA completed and validated; `transfers` is whether the
    /// derived plan is nonempty.
    HeaderValid {
        /// Nonempty transfer plan for this cycle.
        transfers: bool,
    },
    /// Header DMA completed with a bad `cmd` byte; drop the cycle.
    HeaderInvalid,
    /// Data-phase DMA completed (or was synthesized for an empty plan).
    DataComplete,
    /// The SPI/DMA hardware is being repurposed; stop everything.
    Shutdown,
}

/// Pure transition table.
///
/// A falling SYNC edge restarts the frame from any active state: SPI has no
/// inherent frame boundary, so the edge is authoritative and anything in
/// flight is abandoned. Events that do not apply to the current state leave
/// it unchanged.
pub const fn advance(state: BridgeState, event: Event) -> BridgeState {
    match (state, event) {
        (_, Event::Shutdown) => BridgeState::Disabled,
        (BridgeState::Disabled, Event::Activate) => BridgeState::Idle,
        (BridgeState::Disabled, _) => BridgeState::Disabled,

        (_, Event::SyncFalling) => BridgeState::Ctrl,
        // The MCU is the SPI slave: its data phase is driven by DMA
        // completion, not by the rising edge.
        (s, Event::SyncRising) => s,

        (BridgeState::Ctrl, Event::HeaderValid { transfers: true }) => BridgeState::Data,
        (BridgeState::Ctrl, Event::HeaderValid { transfers: false }) => BridgeState::Idle,
        (BridgeState::Ctrl, Event::HeaderInvalid) => BridgeState::Idle,

        (BridgeState::Data, Event::DataComplete) => BridgeState::Idle,

        (s, _) => s,
    }
}
