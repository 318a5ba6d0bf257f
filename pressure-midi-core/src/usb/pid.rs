//! Packet identifiers and token packets.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::crc::crc5;
use crate::error::PacketError;

/// Packet identifier, as the full byte including its check nibble.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Pid {
    Out = 0xE1,
    In = 0x69,
    Sof = 0xA5,
    Setup = 0x2D,
    Data0 = 0xC3,
    Data1 = 0x4B,
    Ack = 0xD2,
    Nak = 0x5A,
    Stall = 0x1E,
}

impl Pid {
    /// Parse a PID byte, rejecting a bad check nibble or an unknown code.
    pub fn parse(byte: u8) -> Result<Self, PacketError> {
        if byte >> 4 != !byte & 0x0F {
            return Err(PacketError::Pid);
        }
        Self::from_u8(byte).ok_or(PacketError::Pid)
    }

    /// DATA0 or DATA1 for the given toggle.
    pub const fn data(toggle: bool) -> Self {
        if toggle {
            Self::Data1
        } else {
            Self::Data0
        }
    }

    pub fn is_token(self) -> bool {
        matches!(self, Self::Out | Self::In | Self::Setup)
    }
}

/// A decoded SETUP, OUT or IN token.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Token {
    pub pid: Pid,
    pub address: u8,
    pub endpoint: u8,
}

impl Token {
    pub const fn new(pid: Pid, address: u8, endpoint: u8) -> Self {
        Self {
            pid,
            address: address & 0x7F,
            endpoint: endpoint & 0x0F,
        }
    }

    /// Parse PID + address/endpoint + CRC5 from decoded packet bytes.
    pub fn parse(packet: &[u8]) -> Result<Self, PacketError> {
        let [pid, lo, hi] = *packet else {
            return Err(PacketError::Truncated);
        };
        let pid = Pid::parse(pid)?;
        if !pid.is_token() {
            return Err(PacketError::Pid);
        }
        let field = u16::from_le_bytes([lo, hi]) & 0x07FF;
        if crc5(field) != hi >> 3 {
            return Err(PacketError::Crc);
        }
        Ok(Self {
            pid,
            address: (field & 0x7F) as u8,
            endpoint: (field >> 7) as u8,
        })
    }

    /// Wire bytes for this token, CRC5 included.
    pub const fn to_bytes(&self) -> [u8; 3] {
        let field = self.address as u16 | (self.endpoint as u16) << 7;
        let crc = crc5(field);
        [
            self.pid as u8,
            field as u8,
            (field >> 8) as u8 | crc << 3,
        ]
    }
}
