//! USB-MIDI 1.0 descriptor tables.
//!
//! Layout follows Appendix B of the USB MIDI device class definition, with
//! the endpoints switched to 8-byte interrupt transfers since low-speed
//! devices cannot do bulk.
//!
//! On AVR every table is kept in program memory and handed out as a
//! [`Table`].

use byteorder::LittleEndian;
use zerocopy::{AsBytes, U16};

use crate::config::{DEVICE_VERSION, MAX_POWER_MA, PRODUCT_ID, VENDOR_ID};
use crate::usb::{DescriptorType, Table};

const fn le16(value: u16) -> U16<LittleEndian> {
    U16::from_bytes(u16::to_le_bytes(value))
}

const AUDIO_CLASS: u8 = 0x01;
const AUDIO_CONTROL: u8 = 0x01;
const MIDI_STREAMING: u8 = 0x03;

const HEADER: u8 = 0x01;
const MIDI_IN_JACK: u8 = 0x02;
const MIDI_OUT_JACK: u8 = 0x03;
const MS_GENERAL: u8 = 0x01;

const EMBEDDED: u8 = 0x01;
const EXTERNAL: u8 = 0x02;

const INTERRUPT: u8 = 0x03;
const POLL_INTERVAL_MS: u8 = 10;

/// Jack IDs. Host-to-device data enters through the embedded IN jack.
pub const JACK_IN_EMBEDDED: u8 = 1;
pub const JACK_IN_EXTERNAL: u8 = 2;
pub const JACK_OUT_EMBEDDED: u8 = 3;
pub const JACK_OUT_EXTERNAL: u8 = 4;

pub const STRING_MANUFACTURER: u8 = 1;
pub const STRING_PRODUCT: u8 = 2;

/// Standard device descriptor.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct DeviceDescriptor {
    length: u8,
    descriptor_type: DescriptorType,
    bcd_usb: U16<LittleEndian>,
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    max_packet_size0: u8,
    vendor: U16<LittleEndian>,
    product: U16<LittleEndian>,
    bcd_device: U16<LittleEndian>,
    manufacturer_s: u8,
    product_s: u8,
    serial_s: u8,
    num_configurations: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct ConfigurationDescriptor {
    length: u8,
    descriptor_type: DescriptorType,
    /// Length of the whole configuration, this descriptor included
    total_length: U16<LittleEndian>,
    num_interfaces: u8,
    configuration_value: u8,
    configuration_s: u8,
    attributes: u8,
    /// In units of 2 mA
    max_power: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct InterfaceDescriptor {
    length: u8,
    descriptor_type: DescriptorType,
    interface_number: u8,
    alternate_setting: u8,
    num_endpoints: u8,
    interface_class: u8,
    interface_subclass: u8,
    interface_protocol: u8,
    interface_s: u8,
}

/// Class-specific Audio Control interface header.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct AudioControlHeader {
    length: u8,
    descriptor_type: DescriptorType,
    subtype: u8,
    bcd_adc: U16<LittleEndian>,
    total_length: U16<LittleEndian>,
    in_collection: u8,
    interface: u8,
}

/// Class-specific MIDI Streaming interface header.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct MidiStreamingHeader {
    length: u8,
    descriptor_type: DescriptorType,
    subtype: u8,
    bcd_msc: U16<LittleEndian>,
    /// Class-specific descriptors of the interface, this header included
    total_length: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct MidiInJack {
    length: u8,
    descriptor_type: DescriptorType,
    subtype: u8,
    jack_type: u8,
    jack_id: u8,
    jack_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct MidiOutJack {
    length: u8,
    descriptor_type: DescriptorType,
    subtype: u8,
    jack_type: u8,
    jack_id: u8,
    num_input_pins: u8,
    source_id: u8,
    source_pin: u8,
    jack_s: u8,
}

/// Endpoint descriptor in the 9-byte audio class form.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct AudioEndpoint {
    length: u8,
    descriptor_type: DescriptorType,
    endpoint_address: u8,
    attributes: u8,
    max_packet_size: U16<LittleEndian>,
    interval: u8,
    refresh: u8,
    synch_address: u8,
}

/// Class-specific MIDI Streaming endpoint, binding it to one jack.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct MidiEndpoint {
    length: u8,
    descriptor_type: DescriptorType,
    subtype: u8,
    num_jacks: u8,
    jack_id: u8,
}

/// The full configuration as returned for GET_DESCRIPTOR(Configuration).
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct MidiConfiguration {
    configuration: ConfigurationDescriptor,
    control_interface: InterfaceDescriptor,
    control_header: AudioControlHeader,
    streaming_interface: InterfaceDescriptor,
    streaming_header: MidiStreamingHeader,
    in_jacks: [MidiInJack; 2],
    out_jacks: [MidiOutJack; 2],
    out_endpoint: AudioEndpoint,
    out_endpoint_jacks: MidiEndpoint,
    in_endpoint: AudioEndpoint,
    in_endpoint_jacks: MidiEndpoint,
}

const CONFIGURATION_LEN: usize = core::mem::size_of::<MidiConfiguration>();
const STREAMING_CLASS_LEN: usize = CONFIGURATION_LEN
    - core::mem::size_of::<ConfigurationDescriptor>()
    - 2 * core::mem::size_of::<InterfaceDescriptor>()
    - core::mem::size_of::<AudioControlHeader>();

const _: () = assert!(core::mem::size_of::<DeviceDescriptor>() == 18);
const _: () = assert!(CONFIGURATION_LEN == 101);

#[cfg_attr(target_arch = "avr", link_section = ".progmem.data")]
pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    length: core::mem::size_of::<DeviceDescriptor>() as u8,
    descriptor_type: DescriptorType::Device,
    bcd_usb: le16(0x0110),
    // Class is given per interface
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: 8,
    vendor: le16(VENDOR_ID),
    product: le16(PRODUCT_ID),
    bcd_device: le16(DEVICE_VERSION),
    manufacturer_s: STRING_MANUFACTURER,
    product_s: STRING_PRODUCT,
    serial_s: 0,
    num_configurations: 1,
};

const fn in_jack(jack_type: u8, jack_id: u8) -> MidiInJack {
    MidiInJack {
        length: core::mem::size_of::<MidiInJack>() as u8,
        descriptor_type: DescriptorType::ClassInterface,
        subtype: MIDI_IN_JACK,
        jack_type,
        jack_id,
        jack_s: 0,
    }
}

const fn out_jack(jack_type: u8, jack_id: u8, source_id: u8) -> MidiOutJack {
    MidiOutJack {
        length: core::mem::size_of::<MidiOutJack>() as u8,
        descriptor_type: DescriptorType::ClassInterface,
        subtype: MIDI_OUT_JACK,
        jack_type,
        jack_id,
        num_input_pins: 1,
        source_id,
        source_pin: 1,
        jack_s: 0,
    }
}

const fn endpoint(endpoint_address: u8) -> AudioEndpoint {
    AudioEndpoint {
        length: core::mem::size_of::<AudioEndpoint>() as u8,
        descriptor_type: DescriptorType::Endpoint,
        endpoint_address,
        attributes: INTERRUPT,
        max_packet_size: le16(8),
        interval: POLL_INTERVAL_MS,
        refresh: 0,
        synch_address: 0,
    }
}

const fn endpoint_jack(jack_id: u8) -> MidiEndpoint {
    MidiEndpoint {
        length: core::mem::size_of::<MidiEndpoint>() as u8,
        descriptor_type: DescriptorType::ClassEndpoint,
        subtype: MS_GENERAL,
        num_jacks: 1,
        jack_id,
    }
}

const fn interface(number: u8, endpoints: u8, subclass: u8) -> InterfaceDescriptor {
    InterfaceDescriptor {
        length: core::mem::size_of::<InterfaceDescriptor>() as u8,
        descriptor_type: DescriptorType::Interface,
        interface_number: number,
        alternate_setting: 0,
        num_endpoints: endpoints,
        interface_class: AUDIO_CLASS,
        interface_subclass: subclass,
        interface_protocol: 0,
        interface_s: 0,
    }
}

#[cfg_attr(target_arch = "avr", link_section = ".progmem.data")]
pub static CONFIGURATION: MidiConfiguration = MidiConfiguration {
    configuration: ConfigurationDescriptor {
        length: core::mem::size_of::<ConfigurationDescriptor>() as u8,
        descriptor_type: DescriptorType::Configuration,
        total_length: le16(CONFIGURATION_LEN as u16),
        num_interfaces: 2,
        configuration_value: 1,
        configuration_s: 0,
        // Bus powered
        attributes: 0x80,
        max_power: MAX_POWER_MA / 2,
    },
    control_interface: interface(0, 0, AUDIO_CONTROL),
    control_header: AudioControlHeader {
        length: core::mem::size_of::<AudioControlHeader>() as u8,
        descriptor_type: DescriptorType::ClassInterface,
        subtype: HEADER,
        bcd_adc: le16(0x0100),
        total_length: le16(core::mem::size_of::<AudioControlHeader>() as u16),
        in_collection: 1,
        interface: 1,
    },
    streaming_interface: interface(1, 2, MIDI_STREAMING),
    streaming_header: MidiStreamingHeader {
        length: core::mem::size_of::<MidiStreamingHeader>() as u8,
        descriptor_type: DescriptorType::ClassInterface,
        subtype: HEADER,
        bcd_msc: le16(0x0100),
        total_length: le16(STREAMING_CLASS_LEN as u16),
    },
    in_jacks: [
        in_jack(EMBEDDED, JACK_IN_EMBEDDED),
        in_jack(EXTERNAL, JACK_IN_EXTERNAL),
    ],
    out_jacks: [
        out_jack(EMBEDDED, JACK_OUT_EMBEDDED, JACK_IN_EXTERNAL),
        out_jack(EXTERNAL, JACK_OUT_EXTERNAL, JACK_IN_EMBEDDED),
    ],
    out_endpoint: endpoint(0x01),
    out_endpoint_jacks: endpoint_jack(JACK_IN_EMBEDDED),
    in_endpoint: endpoint(0x81),
    in_endpoint_jacks: endpoint_jack(JACK_OUT_EMBEDDED),
};

/// Build a string descriptor from ASCII text.
const fn string<const N: usize>(text: &str) -> [u8; N] {
    let bytes = text.as_bytes();
    assert!(N == 2 + 2 * bytes.len());
    let mut out = [0u8; N];
    out[0] = N as u8;
    out[1] = DescriptorType::String as u8;
    let mut i = 0;
    while i < bytes.len() {
        out[2 + 2 * i] = bytes[i];
        i += 1;
    }
    out
}

/// Supported languages: US English only.
#[cfg_attr(target_arch = "avr", link_section = ".progmem.data")]
pub static LANGUAGES: [u8; 4] = [4, DescriptorType::String as u8, 0x09, 0x04];
#[cfg_attr(target_arch = "avr", link_section = ".progmem.data")]
pub static MANUFACTURER: [u8; 28] = string("pressure-midi");
#[cfg_attr(target_arch = "avr", link_section = ".progmem.data")]
pub static PRODUCT: [u8; 26] = string("Pressure Key");

/// Table for a GET_DESCRIPTOR request.
pub fn lookup(kind: DescriptorType, index: u8) -> Option<Table> {
    let bytes: &'static [u8] = match (kind, index) {
        (DescriptorType::Device, 0) => DEVICE.as_bytes(),
        (DescriptorType::Configuration, 0) => CONFIGURATION.as_bytes(),
        (DescriptorType::String, 0) => &LANGUAGES,
        (DescriptorType::String, STRING_MANUFACTURER) => &MANUFACTURER,
        (DescriptorType::String, STRING_PRODUCT) => &PRODUCT,
        _ => return None,
    };
    // SAFETY: all of the statics above are in program memory on AVR
    Some(unsafe { Table::new(bytes) })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_BYTES: [u8; 18] = [
        0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0xC0, 0x16, 0xE4, 0x05, 0x00, 0x01,
        0x01, 0x02, 0x00, 0x01,
    ];

    #[rustfmt::skip]
    const CONFIGURATION_BYTES: [u8; 101] = [
        9, 2, 101, 0, 2, 1, 0, 0x80, 50,
        9, 4, 0, 0, 0, 1, 1, 0, 0,
        9, 0x24, 1, 0x00, 0x01, 9, 0, 1, 1,
        9, 4, 1, 0, 2, 1, 3, 0, 0,
        7, 0x24, 1, 0x00, 0x01, 65, 0,
        6, 0x24, 2, 1, 1, 0,
        6, 0x24, 2, 2, 2, 0,
        9, 0x24, 3, 1, 3, 1, 2, 1, 0,
        9, 0x24, 3, 2, 4, 1, 1, 1, 0,
        9, 5, 0x01, 3, 8, 0, 10, 0, 0,
        5, 0x25, 1, 1, 1,
        9, 5, 0x81, 3, 8, 0, 10, 0, 0,
        5, 0x25, 1, 1, 3,
    ];

    #[test]
    fn test_device_descriptor_bytes() {
        assert_eq!(DEVICE.as_bytes(), &DEVICE_BYTES);
    }

    #[test]
    fn test_configuration_descriptor_bytes() {
        let bytes = CONFIGURATION.as_bytes();
        assert_eq!(bytes.len(), 101);
        assert_eq!(&bytes[2..4], &[101, 0]);
        assert_eq!(bytes, &CONFIGURATION_BYTES[..]);
    }

    fn table(kind: DescriptorType, index: u8) -> Option<Vec<u8>> {
        lookup(kind, index).map(|table| table.iter().collect())
    }

    #[test]
    fn test_string_descriptors() {
        let product = table(DescriptorType::String, STRING_PRODUCT).unwrap();
        assert_eq!(product[0] as usize, product.len());
        assert_eq!(product[1], 3);
        assert_eq!(&product[2..6], &[b'P', 0, b'r', 0]);
        assert_eq!(table(DescriptorType::String, 0), Some(vec![4, 3, 0x09, 0x04]));
    }

    #[test]
    fn test_lookup() {
        assert_eq!(table(DescriptorType::Device, 0), Some(DEVICE_BYTES.to_vec()));
        assert_eq!(
            lookup(DescriptorType::Configuration, 0).map(|table| table.len()),
            Some(101)
        );
        assert_eq!(table(DescriptorType::String, 7), None);
        assert_eq!(table(DescriptorType::Device, 1), None);
        assert_eq!(table(DescriptorType::Endpoint, 0), None);
    }
}
