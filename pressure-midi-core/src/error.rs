//! Wire-level error types

use core::fmt;

/// Failure to turn sampled line levels back into packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineError {
    /// Frame does not start with the SYNC pattern
    Sync,
    /// Seven consecutive ones on the wire
    Stuffing,
    /// Decoded bit count is not a whole number of bytes
    Alignment,
    /// Packet longer than the output buffer
    Overflow,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "missing SYNC pattern"),
            Self::Stuffing => write!(f, "bit stuffing violation"),
            Self::Alignment => write!(f, "partial byte at end of packet"),
            Self::Overflow => write!(f, "packet too long"),
        }
    }
}

/// Failure to interpret decoded packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketError {
    /// PID check nibble does not match
    Pid,
    /// Packet shorter than its PID requires
    Truncated,
    /// CRC5 or CRC16 mismatch
    Crc,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid => write!(f, "invalid PID"),
            Self::Truncated => write!(f, "truncated packet"),
            Self::Crc => write!(f, "CRC mismatch"),
        }
    }
}
