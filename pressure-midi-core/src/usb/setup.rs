//! SETUP packet layout and the standard request codes.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// Layout of an 8-byte SETUP packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Direction (bit 7), type (bits 5..6) and recipient (bits 0..4).
    pub request_type: u8,
    pub request: u8,
    pub value: U16<LittleEndian>,
    pub index: U16<LittleEndian>,
    /// Bytes to transfer in the data stage. For IN requests this is the
    /// most the host will accept.
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    pub fn parse(bytes: &[u8]) -> Option<&Self> {
        LayoutVerified::<_, Self>::new(bytes).map(LayoutVerified::into_ref)
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_u8((self.request_type >> 5) & 0x03)
    }

    pub fn standard_request(&self) -> Option<Request> {
        match self.kind() {
            Some(RequestKind::Standard) => Request::from_u8(self.request),
            _ => None,
        }
    }

    /// Descriptor type and index of a GET_DESCRIPTOR request.
    pub fn descriptor(&self) -> (Option<DescriptorType>, u8) {
        let value = self.value.get();
        (DescriptorType::from_u16(value >> 8), value as u8)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Standard device requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Descriptor types, as found in the high byte of wValue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    ClassInterface = 0x24,
    ClassEndpoint = 0x25,
}
