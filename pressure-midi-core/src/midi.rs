//! USB-MIDI event packets.
//!
//! Every event is a 4-byte packet: cable number and code index in the first
//! byte, then the MIDI message itself. The device sends one event per 8-byte
//! interrupt transfer, zero padded.

/// Code index numbers for cable 0.
pub const CIN_NOTE_OFF: u8 = 0x08;
pub const CIN_NOTE_ON: u8 = 0x09;
pub const CIN_CONTROL_CHANGE: u8 = 0x0B;
pub const CIN_SINGLE_BYTE: u8 = 0x0F;

/// System realtime: timing clock, 24 per quarter note.
pub const TIMING_CLOCK: u8 = 0xF8;
pub const START: u8 = 0xFA;
pub const STOP: u8 = 0xFC;

/// Size of one event packet.
pub const EVENT_SIZE: usize = 4;
/// Size of the interrupt transfer carrying one event.
pub const TRANSFER_SIZE: usize = 8;

/// Clamp a reading into the 0..=127 range of a MIDI data byte.
pub fn clamp_7bit(value: u8) -> u8 {
    value.min(0x7F)
}

/// Channel 1 messages this device sends, plus the realtime messages it
/// listens for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MidiEvent {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    ControlChange { controller: u8, value: u8 },
    Realtime(u8),
}

impl MidiEvent {
    pub fn to_packet(self) -> [u8; EVENT_SIZE] {
        match self {
            Self::NoteOn { note, velocity } => {
                [CIN_NOTE_ON, 0x90, note & 0x7F, clamp_7bit(velocity)]
            }
            Self::NoteOff { note } => [CIN_NOTE_OFF, 0x80, note & 0x7F, 0x00],
            Self::ControlChange { controller, value } => {
                [CIN_CONTROL_CHANGE, 0xB0, controller & 0x7F, clamp_7bit(value)]
            }
            Self::Realtime(status) => [CIN_SINGLE_BYTE, status, 0x00, 0x00],
        }
    }

    /// The event padded to a full interrupt transfer.
    pub fn to_transfer(self) -> [u8; TRANSFER_SIZE] {
        let mut transfer = [0u8; TRANSFER_SIZE];
        transfer[..EVENT_SIZE].copy_from_slice(&self.to_packet());
        transfer
    }

    /// Decode one event packet. Channel numbers are ignored; unsupported
    /// messages give `None`.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let [header, status, data1, data2] = *packet.get(..EVENT_SIZE)? else {
            return None;
        };
        match (header & 0x0F, status & 0xF0) {
            (CIN_NOTE_ON, 0x90) => Some(Self::NoteOn {
                note: data1,
                velocity: data2,
            }),
            (CIN_NOTE_OFF, 0x80) => Some(Self::NoteOff { note: data1 }),
            (CIN_CONTROL_CHANGE, 0xB0) => Some(Self::ControlChange {
                controller: data1,
                value: data2,
            }),
            (CIN_SINGLE_BYTE, _) => Some(Self::Realtime(status)),
            _ => None,
        }
    }
}

/// Events packed in one transfer, skipping empty padding packets.
pub fn events(transfer: &[u8]) -> impl Iterator<Item = MidiEvent> + '_ {
    transfer
        .chunks_exact(EVENT_SIZE)
        .filter(|packet| packet[0] != 0)
        .filter_map(MidiEvent::parse)
}
