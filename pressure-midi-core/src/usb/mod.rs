//! Software USB low-speed device stack.
//!
//! The stack is split along the only concurrency boundary the device has:
//!
//! - [`Sie`] runs inside the pin-change interrupt, once per transaction on
//!   the bus. It answers tokens from frames prepared in advance and never
//!   does anything that could miss the bus turnaround window.
//! - [`Transport`] runs from the main loop. It parses SETUP requests, serves
//!   descriptors and encodes outgoing frames for the interrupt to pick up.
//!
//! They talk through [`PacketSlot`]s and a tagged SETUP buffer.

pub mod crc;
pub mod device;
pub mod line;
pub mod pid;
pub mod setup;
pub mod sie;
pub mod slot;
pub mod table;

pub use device::{Transport, UsbFunction};
pub use line::{LineFrame, FRAME_BYTES, SYNC_LEVELS};
pub use pid::{Pid, Token};
pub use setup::{DescriptorType, SetupPacket};
pub use sie::{DataReply, InReply, Received, Sie, Transaction};
pub use slot::PacketSlot;
pub use table::Table;

/// Pull-up control and reset detection.
pub trait Bus {
    /// Release the data lines so the D- pull-up announces a low-speed device.
    fn attach(&mut self);
    /// Hold the data lines at SE0 so the host sees a disconnect.
    fn detach(&mut self);
    /// True while the host holds the bus in reset (SE0).
    fn in_reset(&self) -> bool;
}

/// Drives a frame onto the bus, followed by EOP.
pub trait Transmit {
    fn transmit(&mut self, frame: &LineFrame);
}

pub trait Watchdog {
    fn feed(&mut self);
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u16);
}
