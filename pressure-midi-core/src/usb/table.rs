//! Constant byte tables served over EP0.
//!
//! On AVR the tables live in program memory, which ordinary loads cannot
//! reach; every byte goes through `lpm`. Elsewhere a table is a plain slice.

/// A read-only byte table, possibly in program memory.
#[derive(Clone, Copy, Debug)]
pub struct Table {
    bytes: &'static [u8],
}

impl Table {
    /// Wrap a table.
    ///
    /// # Safety
    ///
    /// On AVR, `bytes` must be a static placed in `.progmem.data`.
    pub const unsafe fn new(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }

    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The first `len` bytes, or all of them.
    pub fn truncate(self, len: usize) -> Self {
        Self {
            bytes: &self.bytes[..len.min(self.bytes.len())],
        }
    }

    /// Copy bytes from the front into `out`; returns the table of the bytes
    /// that did not fit.
    pub fn read_into(self, out: &mut [u8]) -> (usize, Self) {
        let count = out.len().min(self.bytes.len());
        let (head, rest) = self.bytes.split_at(count);
        for (slot, byte) in out.iter_mut().zip(head) {
            *slot = load(byte);
        }
        (count, Self { bytes: rest })
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        self.bytes.iter().map(load)
    }
}

#[cfg(not(target_arch = "avr"))]
impl From<&'static [u8]> for Table {
    fn from(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }
}

#[cfg(target_arch = "avr")]
fn load(byte: &u8) -> u8 {
    let value: u8;
    // SAFETY: tables are built from program memory statics only
    unsafe {
        core::arch::asm!(
            "lpm {0}, Z",
            out(reg) value,
            in("Z") byte as *const u8,
            options(pure, readonly, nostack, preserves_flags),
        );
    }
    value
}

#[cfg(not(target_arch = "avr"))]
fn load(byte: &u8) -> u8 {
    *byte
}

#[cfg(test)]
mod tests {
    use super::*;

    static BYTES: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

    #[test]
    fn test_read_into() {
        let table = Table::from(&BYTES[..]);
        let mut chunk = [0u8; 8];
        let (count, rest) = table.read_into(&mut chunk);
        assert_eq!(count, 8);
        assert_eq!(chunk, [0, 1, 2, 3, 4, 5, 6, 7]);
        let (count, rest) = rest.read_into(&mut chunk);
        assert_eq!(count, 2);
        assert_eq!(&chunk[..2], &[8, 9]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_truncate() {
        let table = Table::from(&BYTES[..]);
        assert_eq!(table.truncate(4).iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(table.truncate(64).len(), 10);
    }
}
