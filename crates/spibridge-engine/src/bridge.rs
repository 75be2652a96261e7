//! Shared-engine wrapper for firmware use
//!
//! The engine's bitmask updates are read-modify-write sequences reachable
//! from both interrupt and foreground context, and the target has no atomic
//! bit-set instruction. [`Bridge`] therefore keeps the engine inside a
//! [`critical_section::Mutex`], so every entry runs under the ecosystem's
//! RAII interrupt-mask guard.
//!
//! Completion dispatch happens after the engine borrow is released: handlers
//! are allowed to re-enter the consumer API (re-arming a receive buffer from
//! `on_complete_out` is the normal pattern), which would otherwise be a
//! double borrow.

use core::cell::RefCell;

use critical_section::Mutex;
use spibridge_icd::{ControlPkt, MAX_PAYLOAD};

use crate::channel::HandlerTable;
use crate::engine::{Action, BridgeEngine, Completion, Completions};
use crate::state::BridgeState;

/// A [`BridgeEngine`] shared between foreground code and interrupt handlers.
///
/// Suitable for a `static`:
///
/// ```ignore
/// static BRIDGE: Bridge = Bridge::new();
/// ```
pub struct Bridge {
    engine: Mutex<RefCell<BridgeEngine>>,
}

impl Bridge {
    /// A disabled bridge; call [`init`](Self::init) once peripherals are up.
    pub const fn new() -> Self {
        Self {
            engine: Mutex::new(RefCell::new(BridgeEngine::new())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut BridgeEngine) -> R) -> R {
        critical_section::with(|cs| f(&mut self.engine.borrow_ref_mut(cs)))
    }

    /// Run `f` with the engine borrowed, for binding-layer work that needs
    /// direct buffer access (programming the data-phase DMA descriptors).
    /// `f` runs in a critical section and must not block.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut BridgeEngine) -> R) -> R {
        self.with(f)
    }

    /// See [`BridgeEngine::init`].
    pub fn init(&self) {
        self.with(|e| e.init());
    }

    /// See [`BridgeEngine::shutdown`].
    pub fn shutdown(&self) {
        self.with(|e| e.shutdown());
    }

    /// See [`BridgeEngine::start_in`].
    pub fn start_in(&self, channel: usize, payload: &[u8]) {
        self.with(|e| e.start_in(channel, payload));
    }

    /// See [`BridgeEngine::start_out`].
    pub fn start_out(&self, channel: usize) {
        self.with(|e| e.start_out(channel));
    }

    /// See [`BridgeEngine::enable`].
    pub fn enable(&self, channel: usize) {
        self.with(|e| e.enable(channel));
    }

    /// See [`BridgeEngine::disable`].
    pub fn disable(&self, channel: usize) {
        self.with(|e| e.disable(channel));
    }

    /// Level the advisory IRQ pin should be driven to.
    pub fn irq_level(&self) -> bool {
        self.with(|e| e.irq_level())
    }

    /// Current machine state.
    pub fn state(&self) -> BridgeState {
        self.with(|e| e.state())
    }

    /// SYNC falling edge ISR entry.
    pub fn sync_falling(&self) -> Action {
        self.with(|e| e.sync_falling())
    }

    /// SYNC rising edge ISR entry.
    pub fn sync_rising(&self) -> Action {
        self.with(|e| e.sync_rising())
    }

    /// Header the control-phase DMA clocks out.
    pub fn outgoing_header(&self) -> ControlPkt {
        self.with(|e| e.outgoing_header())
    }

    /// Header-DMA completion ISR entry; dispatches any synthesized
    /// completions to `handlers` and returns the action to execute.
    pub fn header_received(
        &self,
        raw: &[u8; ControlPkt::WIRE_SIZE],
        handlers: &mut HandlerTable<'_>,
    ) -> Action {
        let (action, comps) = self.with(|e| e.header_received(raw));
        self.dispatch(&comps, handlers);
        action
    }

    /// Data-DMA completion ISR entry; dispatches completions to `handlers`.
    pub fn data_complete(&self, handlers: &mut HandlerTable<'_>) {
        let comps = self.with(|e| e.data_complete());
        self.dispatch(&comps, handlers);
    }

    fn dispatch(&self, comps: &Completions, handlers: &mut HandlerTable<'_>) {
        for comp in comps {
            match *comp {
                Completion::Opened(c) => handlers[c].on_open(),
                Completion::Closed(c) => handlers[c].on_close(),
                Completion::In(c) => handlers[c].on_complete_in(),
                Completion::Out { channel, len } => {
                    // Copied out before the call: the handler may re-arm the
                    // channel, and the engine borrow must already be gone.
                    let mut data = [0u8; MAX_PAYLOAD];
                    let len = len as usize;
                    self.with(|e| data[..len].copy_from_slice(&e.incoming(channel)[..len]));
                    handlers[channel].on_complete_out(&data[..len]);
                }
            }
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}
