//! Watchdog: one second timeout, fed from the main loop.

use avr_device::attiny85::Peripherals;
use pressure_midi_core::usb::Watchdog;

/// WDRF in MCUSR.
const WDRF: u8 = 0x08;
/// WDCE | WDE: opens the four-cycle change window.
const CHANGE: u8 = 0x18;
/// WDE | WDP2 | WDP1: reset after 1 s.
const ONE_SECOND: u8 = 0x08 | 0x04 | 0x02;

#[inline(always)]
fn wdr() {
    unsafe { core::arch::asm!("wdr") };
}

/// Stop the watchdog, including one left running by a watchdog reset.
pub fn disable(dp: &Peripherals) {
    avr_device::interrupt::free(|_| {
        wdr();
        dp.CPU.mcusr.modify(|r, w| unsafe { w.bits(r.bits() & !WDRF) });
        dp.WDT.wdtcr.write(|w| unsafe { w.bits(CHANGE) });
        dp.WDT.wdtcr.write(|w| unsafe { w.bits(0) });
    });
}

pub fn enable(dp: &Peripherals) {
    avr_device::interrupt::free(|_| {
        wdr();
        dp.WDT.wdtcr.write(|w| unsafe { w.bits(CHANGE) });
        dp.WDT.wdtcr.write(|w| unsafe { w.bits(ONE_SECOND) });
    });
}

pub struct Dog;

impl Watchdog for Dog {
    fn feed(&mut self) {
        wdr();
    }
}
