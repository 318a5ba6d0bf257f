//! Status LEDs: red on PB0, green on PB3, both active high.

use avr_device::attiny85::Peripherals;
use pressure_midi_core::status::{Indicator, Led};

const RED: u8 = 0x01;
const GREEN: u8 = 0x08;

pub struct Leds<'a> {
    dp: &'a Peripherals,
}

impl<'a> Leds<'a> {
    pub fn new(dp: &'a Peripherals) -> Self {
        Self { dp }
    }

    /// Both LEDs as outputs, off.
    pub fn init(&mut self) {
        let portb = &self.dp.PORTB;
        portb.portb.modify(|r, w| unsafe { w.bits(r.bits() & !(RED | GREEN)) });
        portb.ddrb.modify(|r, w| unsafe { w.bits(r.bits() | RED | GREEN) });
    }
}

impl Indicator for Leds<'_> {
    fn set(&mut self, led: Led, on: bool) {
        let mask = match led {
            Led::Red => RED,
            Led::Green => GREEN,
        };
        // INT0 also writes PORTB, keep the update atomic
        avr_device::interrupt::free(|_| {
            self.dp.PORTB.portb.modify(|r, w| unsafe {
                if on {
                    w.bits(r.bits() | mask)
                } else {
                    w.bits(r.bits() & !mask)
                }
            });
        });
    }
}
