//! Status LEDs: key activity, boot blink and the MIDI clock beat.

use crate::midi::{self, MidiEvent, TIMING_CLOCK};
use crate::usb::Delay;

/// Timing clocks per beat.
pub const CLOCKS_PER_BEAT: u8 = 24;
/// Clock within the beat at which the beat LED goes dark again.
pub const BEAT_OFF_CLOCK: u8 = 11;
/// Boot blink on and off time.
pub const BOOT_BLINK_MS: u16 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Led {
    Red,
    Green,
}

/// Something that can light the two LEDs.
pub trait Indicator {
    fn set(&mut self, led: Led, on: bool);
}

/// Reflect a sent event: red for a new note, green for aftertouch, dark
/// once the note is released.
pub fn show_event(event: MidiEvent, leds: &mut impl Indicator) {
    match event {
        MidiEvent::NoteOn { .. } => leds.set(Led::Red, true),
        MidiEvent::ControlChange { .. } => leds.set(Led::Green, true),
        MidiEvent::NoteOff { .. } => {
            leds.set(Led::Red, false);
            leds.set(Led::Green, false);
        }
        MidiEvent::Realtime(_) => {}
    }
}

/// One red blink to show the firmware started.
pub fn boot_blink(leds: &mut impl Indicator, delay: &mut impl Delay) {
    leds.set(Led::Red, true);
    delay.delay_ms(BOOT_BLINK_MS);
    leds.set(Led::Red, false);
    delay.delay_ms(BOOT_BLINK_MS);
}

/// Blinks the red LED in time with MIDI clock sent by the host.
///
/// The LED lights on the first clock of every beat and goes dark on the
/// twelfth. Any other realtime message (start, stop, continue) restarts the
/// count so the next clock is a downbeat.
#[derive(Clone, Debug, Default)]
pub struct ClockBlink {
    count: u8,
}

impl ClockBlink {
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Advance on one event. Returns the new beat LED state when it changes.
    pub fn on_event(&mut self, event: MidiEvent) -> Option<bool> {
        match event {
            MidiEvent::Realtime(TIMING_CLOCK) => {
                let clock = self.count;
                self.count = (self.count + 1) % CLOCKS_PER_BEAT;
                match clock {
                    0 => Some(true),
                    BEAT_OFF_CLOCK => Some(false),
                    _ => None,
                }
            }
            MidiEvent::Realtime(_) => {
                self.count = 0;
                None
            }
            _ => None,
        }
    }

    /// Process one OUT transfer from the host.
    pub fn on_transfer(&mut self, data: &[u8], leds: &mut impl Indicator) {
        for event in midi::events(data) {
            if let Some(on) = self.on_event(event) {
                leds.set(Led::Red, on);
            }
        }
    }
}
