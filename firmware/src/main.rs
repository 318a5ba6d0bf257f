//! Pressure key firmware for the ATtiny85 (Digispark-style board, 16.5 MHz).
//!
//! - Force sensor on PB4 (ADC2), converted continuously in the background
//! - Software low-speed USB on PB1 (D-) and PB2 (D+, INT0)
//! - Red LED on PB0, green LED on PB3
//!
//! The board enumerates as a USB MIDI interface with one jack each way. It
//! plays a single note while the pad is pressed, repeats the held pressure
//! as a control change and blinks in time with MIDI clock from the host.

#![no_std]
#![no_main]
#![feature(abi_avr_interrupt)]
#![feature(asm_experimental_arch)]

mod adc;
mod led;
mod phy;
mod trim;
mod watchdog;

use avr_device::attiny85::Peripherals;
use pressure_midi_core::calibration::{Calibration, OscillatorTuner};
use pressure_midi_core::config::CPU_KHZ;
use pressure_midi_core::descriptors;
use pressure_midi_core::note::NoteMachine;
use pressure_midi_core::pressure::SharedPressure;
use pressure_midi_core::status::{self, ClockBlink};
use pressure_midi_core::usb::{Delay, DescriptorType, Sie, Table, Transport, UsbFunction, Watchdog};

use led::Leds;
use phy::UsbPins;
use trim::{EepromTrim, Osccal};
use watchdog::Dog;

/// Packet engine shared with the INT0 handler, which reaches it from
/// assembly.
static SIE: Sie = Sie::new();
/// Latest pressure reading, written by the ADC handler.
static PRESSURE: SharedPressure = SharedPressure::new();

/// Panic handler: loop until the watchdog resets us.
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

/// The MIDI function behind the USB stack.
struct Key<'a> {
    leds: Leds<'a>,
    clock: ClockBlink,
    calibration: Calibration<EepromTrim<'a>>,
    tuner: OscillatorTuner,
    oscillator: Osccal<'a>,
    frames: UsbPins<'a>,
}

impl UsbFunction for Key<'_> {
    fn descriptor(&self, kind: DescriptorType, index: u8) -> Option<Table> {
        descriptors::lookup(kind, index)
    }

    fn out_packet(&mut self, _endpoint: u8, data: &[u8]) {
        self.clock.on_transfer(data, &mut self.leds);
    }

    fn reset_ready(&mut self) {
        // Host keep-alives are the only timing reference we have
        self.calibration
            .recalibrate(&self.tuner, &mut self.oscillator, &mut self.frames);
    }
}

/// Main entry point.
#[no_mangle]
pub extern "C" fn main() -> ! {
    let dp = unsafe { Peripherals::steal() };

    // A watchdog reset leaves the watchdog running at its shortest period
    watchdog::disable(&dp);

    let mut oscillator = Osccal::new(&dp);
    let mut calibration = Calibration::new(EepromTrim::new(&dp));
    calibration.read(&mut oscillator);

    let mut leds = Leds::new(&dp);
    leds.init();
    let mut delay = Busy;
    status::boot_blink(&mut leds, &mut delay);

    // Make the host forget whatever it knew about us before a reset
    let mut pins = UsbPins::new(&dp);
    let mut dog = Dog;
    let mut transport = Transport::new(&SIE);
    transport.reconnect(&mut pins, &mut dog, &mut delay);

    adc::init(&dp);
    watchdog::enable(&dp);
    pins.init();
    unsafe { avr_device::interrupt::enable() };

    let mut key = Key {
        leds,
        clock: ClockBlink::new(),
        calibration,
        tuner: OscillatorTuner::new(),
        oscillator,
        frames: UsbPins::new(&dp),
    };
    let mut machine = NoteMachine::new();

    loop {
        dog.feed();
        transport.poll(&pins, &mut key);

        let ready = transport.interrupt_endpoint_ready();
        if let Some(event) = machine.poll(PRESSURE.load(), ready) {
            status::show_event(event, &mut key.leds);
            transport.send_interrupt(&event.to_transfer());
        }
    }
}

/// Busy-wait delay.
struct Busy;

impl Delay for Busy {
    fn delay_ms(&mut self, ms: u16) {
        delay_ms(ms);
    }
}

/// Busy-wait delay in milliseconds (approximate, at 16.5MHz).
fn delay_ms(ms: u16) {
    for _ in 0..ms {
        // 4 cycles per loop iteration
        for _ in 0..(CPU_KHZ / 4) as u16 {
            unsafe { core::arch::asm!("nop") };
        }
    }
}
