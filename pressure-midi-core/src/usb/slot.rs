//! Single-packet handoff between the USB interrupt and the main loop.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const FULL: u8 = 1;

/// One buffer plus an ownership flag.
///
/// While EMPTY the producer owns the buffer, while FULL the consumer does.
/// Only the owner touches the contents and ownership changes with a single
/// atomic store, so no critical section is needed. There must be exactly one
/// producer and one consumer.
///
/// The state byte comes first and the buffer right after it, so the slot
/// can be handled from assembly as well.
#[repr(C)]
pub struct PacketSlot<T> {
    state: AtomicU8,
    buffer: UnsafeCell<T>,
}

// SAFETY: access to `buffer` is serialized by `state`, see above.
unsafe impl<T: Send> Sync for PacketSlot<T> {}

impl<T> PacketSlot<T> {
    /// Byte offset of the state, `0` when empty.
    pub const STATE: usize = core::mem::offset_of!(Self, state);
    /// Byte offset of the buffer.
    pub const BUFFER: usize = core::mem::offset_of!(Self, buffer);
}

impl<T: Copy> PacketSlot<T> {
    pub const fn new(init: T) -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            buffer: UnsafeCell::new(init),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) == EMPTY
    }

    /// Producer side: store a value. Returns false if the consumer still
    /// holds the previous one.
    pub fn fill(&self, value: T) -> bool {
        if !self.is_empty() {
            return false;
        }
        // SAFETY: EMPTY, producer owns the buffer
        unsafe { *self.buffer.get() = value };
        self.state.store(FULL, Ordering::Release);
        true
    }

    /// Consumer side: read the value without giving the buffer back.
    pub fn peek(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: FULL, consumer owns the buffer
        Some(unsafe { *self.buffer.get() })
    }

    /// Consumer side: hand the buffer back to the producer.
    pub fn release(&self) {
        self.state.store(EMPTY, Ordering::Release);
    }

    /// Consumer side: read the value and release the buffer.
    pub fn take(&self) -> Option<T> {
        let value = self.peek()?;
        self.release();
        Some(value)
    }
}
