//! Oscillator trim: the OSCCAL register and its copy in EEPROM.
//!
//! The trim lives in the first EEPROM cell.

use avr_device::attiny85::Peripherals;
use pressure_midi_core::calibration::{Oscillator, TrimStore};

/// EEPE: write in progress.
const EEPE: u8 = 0x02;
/// EEMPE: arms EEPE for four cycles.
const EEMPE: u8 = 0x04;
/// EERE: read strobe.
const EERE: u8 = 0x01;

pub struct EepromTrim<'a> {
    dp: &'a Peripherals,
}

impl<'a> EepromTrim<'a> {
    pub fn new(dp: &'a Peripherals) -> Self {
        Self { dp }
    }

    fn wait_ready(&self) {
        while self.dp.EEPROM.eecr.read().bits() & EEPE != 0 {}
    }
}

impl TrimStore for EepromTrim<'_> {
    fn read(&mut self) -> u8 {
        self.wait_ready();
        let eeprom = &self.dp.EEPROM;
        eeprom.eear.write(|w| unsafe { w.bits(0) });
        eeprom.eecr.write(|w| unsafe { w.bits(EERE) });
        eeprom.eedr.read().bits()
    }

    fn write(&mut self, value: u8) {
        self.wait_ready();
        let eeprom = &self.dp.EEPROM;
        avr_device::interrupt::free(|_| {
            // EEPM = 0: erase and write in one operation
            eeprom.eecr.write(|w| unsafe { w.bits(0) });
            eeprom.eear.write(|w| unsafe { w.bits(0) });
            eeprom.eedr.write(|w| unsafe { w.bits(value) });
            eeprom.eecr.write(|w| unsafe { w.bits(EEMPE) });
            eeprom.eecr.write(|w| unsafe { w.bits(EEMPE | EEPE) });
        });
    }
}

pub struct Osccal<'a> {
    dp: &'a Peripherals,
}

impl<'a> Osccal<'a> {
    pub fn new(dp: &'a Peripherals) -> Self {
        Self { dp }
    }
}

impl Oscillator for Osccal<'_> {
    fn trim(&self) -> u8 {
        self.dp.CPU.osccal.read().bits()
    }

    fn set_trim(&mut self, value: u8) {
        self.dp.CPU.osccal.write(|w| unsafe { w.bits(value) });
    }
}
