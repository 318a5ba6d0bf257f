//! Pressure sampling: conversion filter and the interrupt-to-loop cell.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::ADC_SETTLE_CONVERSIONS;

/// Where the filter is in its discard/report cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettleState {
    /// Next conversion arms the discard window
    Warming,
    /// Conversions left to throw away
    Discarding(u16),
}

/// Throws away a window of conversions before each one it trusts.
///
/// Lives in the ADC interrupt; one call per conversion.
#[derive(Clone, Debug)]
pub struct SettleFilter {
    state: SettleState,
    window: u16,
}

impl SettleFilter {
    pub const fn new() -> Self {
        Self::with_window(ADC_SETTLE_CONVERSIONS)
    }

    pub const fn with_window(window: u16) -> Self {
        Self {
            state: SettleState::Warming,
            window,
        }
    }

    /// Feed one raw 10-bit conversion. Returns the scaled reading (0..=255)
    /// once the discard window has elapsed.
    pub fn on_conversion(&mut self, raw: u16) -> Option<u8> {
        match self.state {
            SettleState::Warming => {
                self.state = SettleState::Discarding(self.window);
                None
            }
            SettleState::Discarding(0) => {
                self.state = SettleState::Warming;
                Some((raw.min(0x3FF) / 4) as u8)
            }
            SettleState::Discarding(left) => {
                self.state = SettleState::Discarding(left - 1);
                None
            }
        }
    }

    pub fn state(&self) -> SettleState {
        self.state
    }
}

impl Default for SettleFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// The latest trusted pressure reading.
///
/// Written only by the ADC interrupt, read only by the main loop. A single
/// byte, so loads and stores are single instructions on the target and no
/// critical section is needed; the loop may see a value one conversion old.
pub struct SharedPressure(AtomicU8);

impl SharedPressure {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn publish(&self, reading: u8) {
        self.0.store(reading, Ordering::Release);
    }

    pub fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for SharedPressure {
    fn default() -> Self {
        Self::new()
    }
}
