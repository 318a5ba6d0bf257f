//! Print MIDI events as the key sends them.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use pressure_midi_core::midi::{self, MidiEvent, TRANSFER_SIZE};
use rusb::{DeviceHandle, GlobalContext};
use std::time::Duration;

use crate::device::EVENTS_IN;

/// How long one interrupt read waits before polling again.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Note name, middle C as C4.
pub fn note_name(note: u8) -> String {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    let octave = note as i16 / 12 - 1;
    format!("{}{}", NAMES[note as usize % 12], octave)
}

pub fn describe(event: MidiEvent) -> String {
    match event {
        MidiEvent::NoteOn { note, velocity } => {
            format!("note on   {:<4} velocity {}", note_name(note), velocity)
        }
        MidiEvent::NoteOff { note } => format!("note off  {}", note_name(note)),
        MidiEvent::ControlChange { controller, value } => {
            format!("cc {:<6} value {}", controller, value)
        }
        MidiEvent::Realtime(midi::TIMING_CLOCK) => "clock".to_string(),
        MidiEvent::Realtime(midi::START) => "start".to_string(),
        MidiEvent::Realtime(midi::STOP) => "stop".to_string(),
        MidiEvent::Realtime(status) => format!("realtime  0x{:02X}", status),
    }
}

/// Read events until the device goes away or `limit` events were seen.
pub fn run(handle: &DeviceHandle<GlobalContext>, limit: Option<usize>) -> Result<()> {
    let gauge = ProgressBar::new(127);
    gauge.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>10} [{bar:40.green/black}] {pos:>3}")
            .context("bad progress template")?
            .progress_chars("#  "),
    );
    gauge.set_message("pressure");

    let mut seen = 0usize;
    let mut buf = [0u8; TRANSFER_SIZE];
    while limit.map_or(true, |limit| seen < limit) {
        let len = match handle.read_interrupt(EVENTS_IN, &mut buf, READ_TIMEOUT) {
            Ok(len) => len,
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return Err(e).context("reading MIDI events"),
        };
        for event in midi::events(&buf[..len]) {
            seen += 1;
            match event {
                MidiEvent::ControlChange { value, .. } => gauge.set_position(value as u64),
                MidiEvent::NoteOn { velocity, .. } => {
                    gauge.set_position(velocity as u64);
                    gauge.println(describe(event));
                }
                MidiEvent::NoteOff { .. } => {
                    gauge.set_position(0);
                    gauge.println(describe(event));
                }
                MidiEvent::Realtime(_) => gauge.println(describe(event)),
            }
        }
    }
    gauge.finish_and_clear();
    Ok(())
}
