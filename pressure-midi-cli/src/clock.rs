//! Drive the key's beat LED with MIDI timing clock.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use pressure_midi_core::midi::{MidiEvent, START, STOP, TIMING_CLOCK};
use pressure_midi_core::status::CLOCKS_PER_BEAT;
use rusb::{DeviceHandle, GlobalContext};
use std::time::{Duration, Instant};

use crate::device::EVENTS_OUT;

const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Tempo range accepted on the command line.
pub const MIN_BPM: u32 = 20;
pub const MAX_BPM: u32 = 300;

/// Time between two timing clocks.
pub fn clock_interval(bpm: u32) -> Result<Duration> {
    if !(MIN_BPM..=MAX_BPM).contains(&bpm) {
        bail!("tempo {} outside {}..={} bpm", bpm, MIN_BPM, MAX_BPM);
    }
    Ok(Duration::from_secs(60) / (bpm * CLOCKS_PER_BEAT as u32))
}

fn send(handle: &DeviceHandle<GlobalContext>, status: u8) -> Result<()> {
    handle
        .write_interrupt(EVENTS_OUT, &MidiEvent::Realtime(status).to_transfer(), WRITE_TIMEOUT)
        .with_context(|| format!("sending realtime 0x{:02X}", status))?;
    Ok(())
}

/// Send START, `beats` beats of clock, then STOP.
pub fn run(handle: &DeviceHandle<GlobalContext>, bpm: u32, beats: u32) -> Result<()> {
    let interval = clock_interval(bpm)?;

    let pb = ProgressBar::new(beats as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} beats")
            .context("bad progress template")?
            .progress_chars("=> "),
    );
    pb.set_message(format!("{} bpm", bpm));

    // START resets the beat count on the key
    send(handle, START)?;
    let mut next = Instant::now();
    for _ in 0..beats {
        for _ in 0..CLOCKS_PER_BEAT {
            send(handle, TIMING_CLOCK)?;
            next += interval;
            if let Some(wait) = next.checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        }
        pb.inc(1);
    }
    send(handle, STOP)?;
    pb.finish_with_message("done");
    Ok(())
}
