//! Shared logic for the pressure-key USB-MIDI device.
//!
//! This crate is `no_std` so it can be used by both the AVR firmware and the
//! native CLI tool. Everything that does not touch a register lives here:
//!
//! - [`usb`]: software USB low-speed stack (line codec, interrupt-side
//!   engine, control-transfer engine)
//! - [`descriptors`]: the USB-MIDI 1.0 descriptor tables
//! - [`midi`]: USB-MIDI event packets
//! - [`note`]: pressure → Note On / Note Off / aftertouch state machine
//! - [`pressure`]: ADC settle filter and the interrupt-to-loop pressure cell
//! - [`status`]: LED model and the MIDI clock beat indicator
//! - [`calibration`]: oscillator trim persistence and tuning

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "avr", feature(asm_experimental_arch))]

#[cfg(feature = "defmt")]
use defmt as _;

pub mod calibration;
pub mod config;
pub mod descriptors;
pub mod error;
pub mod midi;
pub mod note;
pub mod pressure;
pub mod status;
pub mod usb;

pub use error::{LineError, PacketError};
