//! Force sensor on PB4 (ADC2).
//!
//! The converter free-runs at clk/128 and interrupts on every result. The
//! handler runs each conversion through a [`SettleFilter`] and publishes
//! the ones it trusts for the main loop. It re-enables interrupts first:
//! INT0 has to catch a SYNC within a few bit times.

use core::cell::RefCell;

use avr_device::attiny85::Peripherals;
use avr_device::interrupt::Mutex;
use pressure_midi_core::pressure::SettleFilter;

/// MUX1: ADC2 against Vcc.
const ADMUX_ADC2: u8 = 0x02;
/// ADC2D: digital input buffer off on PB4.
const ADC2D: u8 = 0x10;
/// ADEN | ADSC | ADATE | ADIE | ADPS2..0 (clk/128).
const ADCSRA_FREE_RUNNING: u8 = 0x80 | 0x40 | 0x20 | 0x08 | 0x07;

static FILTER: Mutex<RefCell<SettleFilter>> = Mutex::new(RefCell::new(SettleFilter::new()));

pub fn init(dp: &Peripherals) {
    let adc = &dp.ADC;
    adc.admux.write(|w| unsafe { w.bits(ADMUX_ADC2) });
    adc.didr0.modify(|r, w| unsafe { w.bits(r.bits() | ADC2D) });
    // ADTS = 0: free running
    adc.adcsrb.write(|w| unsafe { w.bits(0) });
    adc.adcsra.write(|w| unsafe { w.bits(ADCSRA_FREE_RUNNING) });
}

#[export_name = "__vector_8"]
pub unsafe extern "avr-non-blocking-interrupt" fn adc_complete() {
    let dp = Peripherals::steal();
    let raw = dp.ADC.adc.read().bits();
    avr_device::interrupt::free(|cs| {
        if let Some(reading) = FILTER.borrow(cs).borrow_mut().on_conversion(raw) {
            crate::PRESSURE.publish(reading);
        }
    });
}
