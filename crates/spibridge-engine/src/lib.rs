//! spibridge-engine - MCU-side bridge engine
//!
//! This crate implements the microcontroller half of the spibridge link: a
//! four-state machine driven by SYNC-edge and DMA-completion events that
//! multiplexes several duplex byte-stream channels over one SPI slave
//! peripheral.
//!
//! The crate is `no_std` and heap-free; every channel owns fixed-size
//! transmit/receive buffers sized to the protocol's one-byte length field.
//!
//! # Hardware seam
//!
//! The engine never touches hardware. The binding layer (firmware) forwards
//! hardware events to the engine's entry points and executes the returned
//! [`Action`]s against the real SPI/DMA peripherals:
//!
//! - SYNC falling edge → [`BridgeEngine::sync_falling`], then on
//!   [`Action::StartControl`] abort in-flight DMA, reset the SPI slave, and
//!   start the header read+write.
//! - SYNC rising edge → [`BridgeEngine::sync_rising`] (no engine action; the
//!   MCU is the SPI slave and its data phase is driven by clock activity).
//! - Header DMA completion → [`BridgeEngine::header_received`], then on
//!   [`Action::StartData`] run the returned descriptor plan.
//! - Data DMA completion → [`BridgeEngine::data_complete`].
//!
//! Tests bind the same entry points to a scripted event sequence instead, so
//! the whole state machine runs deterministically off-target.
//!
//! # Consumer API
//!
//! Channel consumers use [`Bridge`], which wraps the engine in a
//! critical-section mutex so the queue/arm/enable calls are safe against the
//! interrupt-context event entry points, and which dispatches completions to
//! a per-channel [`ChannelHandler`] table.

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod channel;
pub mod engine;
pub mod state;

pub use bridge::Bridge;
pub use channel::{ChannelHandler, HandlerTable};
pub use engine::{Action, BridgeEngine, Completion, Completions};
pub use state::{BridgeState, Event};
