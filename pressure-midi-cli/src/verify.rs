//! Compare descriptors read from a device with the tables it was built with.

use std::fmt;

/// First point where a device's descriptor departs from the expected bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Mismatch {
    /// Same length up to `offset`, different byte there.
    Byte { offset: usize, expected: u8, actual: u8 },
    /// Identical prefix, different length.
    Length { expected: usize, actual: usize },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Byte {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "offset {}: expected 0x{:02X}, device sent 0x{:02X}",
                offset, expected, actual
            ),
            Mismatch::Length { expected, actual } => {
                write!(f, "expected {} bytes, device sent {}", expected, actual)
            }
        }
    }
}

pub fn first_difference(expected: &[u8], actual: &[u8]) -> Option<Mismatch> {
    let differing = expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a);
    if let Some(offset) = differing {
        return Some(Mismatch::Byte {
            offset,
            expected: expected[offset],
            actual: actual[offset],
        });
    }
    if expected.len() != actual.len() {
        return Some(Mismatch::Length {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    None
}

/// Hex dump, 16 bytes per line.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(line, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
            format!("{:04X}: {}", line * 16, hex.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pressure_midi_core::descriptors;
    use pressure_midi_core::usb::DescriptorType;

    fn table(kind: DescriptorType) -> Vec<u8> {
        descriptors::lookup(kind, 0).unwrap().iter().collect()
    }

    fn device_table() -> Vec<u8> {
        table(DescriptorType::Device)
    }

    #[test]
    fn test_identical() {
        let table = device_table();
        assert_eq!(first_difference(&table, &table), None);
    }

    #[test]
    fn test_byte_difference() {
        let table = device_table();
        let mut read = table.clone();
        // bcdDevice low byte
        read[12] ^= 0x01;
        let mismatch = first_difference(&table, &read).unwrap();
        assert_eq!(
            mismatch,
            Mismatch::Byte {
                offset: 12,
                expected: table[12],
                actual: table[12] ^ 0x01
            }
        );
        assert!(mismatch.to_string().starts_with("offset 12:"));
    }

    #[test]
    fn test_short_read() {
        let table = table(DescriptorType::Configuration);
        let mismatch = first_difference(&table, &table[..9]).unwrap();
        assert_eq!(
            mismatch,
            Mismatch::Length {
                expected: 101,
                actual: 9
            }
        );
        assert_eq!(mismatch.to_string(), "expected 101 bytes, device sent 9");
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(&[0x12, 0x01, 0x10, 0x01, 0, 0, 0, 8, 0xC0, 0x16, 0xE4, 0x05, 0, 1, 1, 2, 0, 1]);
        assert_eq!(
            dump,
            "0000: 12 01 10 01 00 00 00 08 C0 16 E4 05 00 01 01 02\n0010: 00 01"
        );
    }
}
