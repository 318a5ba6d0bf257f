//! USB token and data CRCs.
//!
//! Both are computed LSB-first over the bits as they appear on the wire, so
//! the reflected polynomials are used and the result can be appended as-is.

/// CRC5 over the 11-bit address/endpoint field of a token packet.
pub const fn crc5(field: u16) -> u8 {
    let mut crc: u8 = 0x1F;
    let mut i = 0;
    while i < 11 {
        let bit = ((field >> i) & 1) as u8;
        let feedback = (crc ^ bit) & 1;
        crc >>= 1;
        if feedback != 0 {
            crc ^= 0x14; // x^5 + x^2 + 1, reflected
        }
        i += 1;
    }
    !crc & 0x1F
}

/// CRC16 over a data packet payload. Sent low byte first.
pub const fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let mut i = 0;
    while i < data.len() {
        crc ^= data[i] as u16;
        let mut b = 0;
        while b < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001; // x^16 + x^15 + x^2 + 1, reflected
            } else {
                crc >>= 1;
            }
            b += 1;
        }
        i += 1;
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc5_address_zero() {
        // SETUP to address 0, endpoint 0 goes out as 2D 00 10
        assert_eq!(crc5(0), 0x02);
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0xB4C8);
    }

    #[test]
    fn test_crc16_empty_payload() {
        // Zero-length DATA packets carry 00 00
        assert_eq!(crc16(&[]), 0x0000);
    }
}
