//! NRZI line coding with bit stuffing.
//!
//! A [`LineFrame`] holds the bus state for every bit time of one packet,
//! SYNC included, EOP excluded: `1` is J (idle), `0` is K. Levels are packed
//! LSB-first. The bit-bang PHY only ever shifts these levels in or out; all
//! coding happens here, off the critical path where possible.

use super::crc::crc16;
use super::pid::Pid;
use crate::error::LineError;

/// SYNC field, LSB-first on the wire: KJKJKJKK.
pub const SYNC: u8 = 0x80;
/// Largest packet: PID + 8 data bytes + CRC16.
pub const MAX_PACKET: usize = 11;
/// Level storage for one frame.
pub const FRAME_BYTES: usize = 16;
/// Capacity of a frame in bit times.
pub const FRAME_BITS: usize = FRAME_BYTES * 8;

/// Line levels of the SYNC field as packed by [`LineFrame`].
pub const SYNC_LEVELS: u8 = 0b0010_1010;
/// Level bytes after SYNC that identify a token: PID, address, endpoint and
/// the first CRC5 bits even with stuffing.
pub const TOKEN_IMAGE: usize = 3;

/// Bus levels of one packet.
///
/// The layout is fixed: the PHY fills `levels` and reads `bits` directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub struct LineFrame {
    bits: u8,
    levels: [u8; FRAME_BYTES],
}

impl LineFrame {
    /// Byte offset of the bit count.
    pub const BITS_OFFSET: usize = core::mem::offset_of!(Self, bits);
    /// Byte offset of the packed levels.
    pub const LEVELS_OFFSET: usize = core::mem::offset_of!(Self, levels);

    pub const fn empty() -> Self {
        Self {
            bits: 0,
            levels: [0; FRAME_BYTES],
        }
    }

    /// A frame holding only the SYNC field. The PHY receives into one of
    /// these and only ever writes the levels after SYNC.
    pub const fn synced() -> Self {
        let mut frame = Self::empty();
        frame.levels[0] = SYNC_LEVELS;
        frame.bits = 8;
        frame
    }

    /// NRZI-encode a packet with SYNC and bit stuffing, starting from idle J.
    ///
    /// Input beyond [`MAX_PACKET`] bytes does not fit in a low-speed frame
    /// and is dropped.
    pub const fn encode(packet: &[u8]) -> Self {
        let mut frame = Self::empty();
        let mut len = 0usize;
        let mut level = true;
        let mut ones = 0u8;

        let count = if packet.len() > MAX_PACKET {
            MAX_PACKET
        } else {
            packet.len()
        };

        let mut i = 0;
        while i <= count {
            let byte = if i == 0 { SYNC } else { packet[i - 1] };
            let mut b = 0;
            while b < 8 {
                if (byte >> b) & 1 != 0 {
                    ones += 1;
                } else {
                    ones = 0;
                    level = !level;
                }
                if level {
                    frame.levels[len / 8] |= 1 << (len % 8);
                }
                len += 1;

                if ones == 6 {
                    // Stuffed zero
                    ones = 0;
                    level = !level;
                    if level {
                        frame.levels[len / 8] |= 1 << (len % 8);
                    }
                    len += 1;
                }
                b += 1;
            }
            i += 1;
        }

        frame.bits = len as u8;
        frame
    }

    /// Encode a handshake packet.
    pub const fn handshake(pid: Pid) -> Self {
        Self::encode(&[pid as u8])
    }

    /// Levels of `pid` right after SYNC. No stuffing happens before the end
    /// of the PID, so this is the same byte for every packet with that PID.
    pub const fn pid_levels(pid: Pid) -> u8 {
        Self::handshake(pid).levels[1]
    }

    /// Encode a DATA0/DATA1 packet carrying up to 8 payload bytes.
    pub fn data(toggle: bool, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_PACKET - 3);
        let mut packet = [0u8; MAX_PACKET];
        packet[0] = Pid::data(toggle) as u8;
        packet[1..1 + len].copy_from_slice(&payload[..len]);
        let crc = crc16(&payload[..len]).to_le_bytes();
        packet[1 + len..3 + len].copy_from_slice(&crc);
        Self::encode(&packet[..3 + len])
    }

    /// Number of bit times in the frame.
    pub fn bits(&self) -> usize {
        self.bits as usize
    }

    /// Level at bit time `i`; `true` is J.
    pub fn level(&self, i: usize) -> bool {
        self.levels[i / 8] & (1 << (i % 8)) != 0
    }

    /// Set the number of valid bit times after the PHY filled the levels,
    /// clearing whatever it left past the end.
    pub fn set_bits(&mut self, bits: usize) {
        let bits = bits.min(FRAME_BITS);
        self.bits = bits as u8;
        let whole = bits / 8;
        if whole < FRAME_BYTES {
            self.levels[whole] &= (1u8 << (bits % 8)).wrapping_sub(1);
            for byte in &mut self.levels[whole + 1..] {
                *byte = 0;
            }
        }
    }

    /// The levels a token leaves right after SYNC. Two tokens with equal
    /// images carry the same PID, address and endpoint.
    pub const fn token_image(&self) -> [u8; TOKEN_IMAGE] {
        [self.levels[1], self.levels[2], self.levels[3]]
    }

    /// Decode the PID straight from the levels following SYNC.
    ///
    /// Bit stuffing cannot occur before the end of the PID, so this needs
    /// neither a full decode nor a buffer; the interrupt path uses it to
    /// pick a reply within the bus turnaround time.
    pub fn pid(&self) -> Option<Pid> {
        if self.bits < 16 {
            return None;
        }
        let mut prev = self.level(7);
        let mut byte = 0u8;
        for i in 0..8 {
            let level = self.level(8 + i);
            if level == prev {
                byte |= 1 << i;
            }
            prev = level;
        }
        Pid::parse(byte).ok()
    }

    /// Undo NRZI and bit stuffing. Checks and strips SYNC, returns the
    /// number of packet bytes (PID first) written to `out`.
    pub fn decode(&self, out: &mut [u8]) -> Result<usize, LineError> {
        let mut prev = true;
        let mut ones = 0u8;
        let mut byte = 0u8;
        let mut decoded = 0usize;
        let mut written = 0usize;
        let mut synced = false;

        for i in 0..self.bits() {
            let level = self.level(i);
            let bit = level == prev;
            prev = level;

            if ones == 6 {
                if bit {
                    return Err(LineError::Stuffing);
                }
                ones = 0;
                continue;
            }
            if bit {
                ones += 1;
                byte |= 1 << (decoded % 8);
            } else {
                ones = 0;
            }
            decoded += 1;

            if decoded % 8 == 0 {
                if !synced {
                    if byte != SYNC {
                        return Err(LineError::Sync);
                    }
                    synced = true;
                } else {
                    *out.get_mut(written).ok_or(LineError::Overflow)? = byte;
                    written += 1;
                }
                byte = 0;
            }
        }

        if !synced {
            return Err(LineError::Sync);
        }
        if decoded % 8 != 0 {
            return Err(LineError::Alignment);
        }
        Ok(written)
    }
}
