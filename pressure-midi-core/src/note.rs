//! Pressure to Note On / Note Off / aftertouch.

use crate::config::{AFTERTOUCH_CONTROLLER, DEBOUNCE, LOW_THRESHOLD, PITCH};
use crate::midi::{clamp_7bit, MidiEvent};

/// Debounced key state machine for a single pressure pad.
///
/// A press above the threshold starts the note; while it is held the
/// pressure is repeated as a control change. After every Note On or
/// control change the key is left alone for a recovery period counted in
/// evaluations.
///
/// The machine is only evaluated when the interrupt endpoint can take a
/// packet, so a busy endpoint postpones the recovery countdown along with
/// any transition.
#[derive(Clone, Debug)]
pub struct NoteMachine {
    pitch: u8,
    controller: u8,
    threshold: u8,
    debounce: u16,
    sounding: bool,
    recovering: u16,
}

impl NoteMachine {
    pub const fn new() -> Self {
        Self::with(PITCH, AFTERTOUCH_CONTROLLER, LOW_THRESHOLD, DEBOUNCE)
    }

    pub const fn with(pitch: u8, controller: u8, threshold: u8, debounce: u16) -> Self {
        Self {
            pitch,
            controller,
            threshold,
            debounce,
            sounding: false,
            recovering: 0,
        }
    }

    /// Run one main-loop evaluation against the latest pressure reading.
    pub fn poll(&mut self, reading: u8, endpoint_ready: bool) -> Option<MidiEvent> {
        if !endpoint_ready {
            return None;
        }
        if self.recovering > 0 {
            self.recovering -= 1;
            return None;
        }

        let pressed = reading > self.threshold;
        match (self.sounding, pressed) {
            (false, false) => None,
            (false, true) => {
                self.sounding = true;
                self.recovering = self.debounce;
                Some(MidiEvent::NoteOn {
                    note: self.pitch,
                    velocity: clamp_7bit(reading),
                })
            }
            (true, false) => {
                self.sounding = false;
                Some(MidiEvent::NoteOff { note: self.pitch })
            }
            (true, true) => {
                self.recovering = self.debounce;
                Some(MidiEvent::ControlChange {
                    controller: self.controller,
                    value: clamp_7bit(reading),
                })
            }
        }
    }

    /// True while the note is sounding.
    pub fn sounding(&self) -> bool {
        self.sounding
    }

    /// Evaluations left before the key is looked at again.
    pub fn recovering(&self) -> u16 {
        self.recovering
    }
}

impl Default for NoteMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(machine: &mut NoteMachine, readings: impl IntoIterator<Item = u8>) -> Vec<MidiEvent> {
        readings
            .into_iter()
            .filter_map(|reading| machine.poll(reading, true))
            .collect()
    }

    const NOTE_ON_50: MidiEvent = MidiEvent::NoteOn {
        note: 60,
        velocity: 50,
    };
    const NOTE_OFF: MidiEvent = MidiEvent::NoteOff { note: 60 };

    #[test]
    fn test_idle_below_threshold() {
        let mut machine = NoteMachine::new();
        for reading in 0..=LOW_THRESHOLD {
            assert_eq!(machine.poll(reading, true), None);
            assert!(!machine.sounding());
        }
    }

    #[test]
    fn test_note_on_once_per_crossing() {
        let mut machine = NoteMachine::new();
        assert_eq!(machine.poll(11, true), Some(MidiEvent::NoteOn { note: 60, velocity: 11 }));
        assert!(machine.sounding());
        assert_eq!(machine.recovering(), DEBOUNCE);
        // Held through the recovery window: decrements only
        for left in (0..DEBOUNCE).rev() {
            assert_eq!(machine.poll(200, true), None);
            assert_eq!(machine.recovering(), left);
        }
    }

    #[test]
    fn test_values_always_seven_bit() {
        for raw in 0..=1023u16 {
            let reading = (raw / 4) as u8;
            let mut machine = NoteMachine::with(60, 16, 10, 0);
            for event in run(&mut machine, [reading, reading]) {
                let packet = event.to_packet();
                assert!(packet[2] <= 127 && packet[3] <= 127);
            }
        }
    }

    #[test]
    fn test_release_after_window() {
        let mut machine = NoteMachine::with(60, 16, 10, 3);
        let events = run(&mut machine, [50, 0, 0, 0, 0, 0]);
        assert_eq!(events, vec![NOTE_ON_50, NOTE_OFF]);
        assert!(!machine.sounding());
    }

    #[test]
    fn test_aftertouch_after_window() {
        let mut machine = NoteMachine::with(60, 16, 10, 2);
        let events = run(&mut machine, [50, 50, 50, 90, 90, 90, 150]);
        assert_eq!(
            events,
            vec![
                NOTE_ON_50,
                MidiEvent::ControlChange { controller: 16, value: 90 },
                MidiEvent::ControlChange { controller: 16, value: 127 },
            ]
        );
    }

    #[test]
    fn test_press_release_scenario() {
        let mut machine = NoteMachine::new();
        let readings = [0, 0]
            .into_iter()
            .chain(core::iter::repeat(50).take(DEBOUNCE as usize + 1))
            .chain([0, 0]);
        assert_eq!(run(&mut machine, readings), vec![NOTE_ON_50, NOTE_OFF]);
    }

    #[test]
    fn test_busy_endpoint_skips_evaluation() {
        let mut machine = NoteMachine::with(60, 16, 10, 2);
        assert_eq!(machine.poll(50, false), None);
        assert!(!machine.sounding());

        assert_eq!(machine.poll(50, true), Some(NOTE_ON_50));
        // Not ready: the recovery countdown is held as well
        for _ in 0..10 {
            assert_eq!(machine.poll(0, false), None);
        }
        assert_eq!(machine.recovering(), 2);
        assert_eq!(run(&mut machine, [0, 0, 0]), vec![NOTE_OFF]);
    }
}
