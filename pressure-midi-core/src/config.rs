//! Compile-time configuration for the single-key device.

/// USB vendor ID (shared obdev.at VID).
pub const VENDOR_ID: u16 = 0x16C0;
/// USB product ID (shared obdev.at PID for MIDI class devices).
pub const PRODUCT_ID: u16 = 0x05E4;
/// Device release number, BCD.
pub const DEVICE_VERSION: u16 = 0x0100;
/// Bus current draw in mA.
pub const MAX_POWER_MA: u8 = 100;

/// Readings above this count as a press.
pub const LOW_THRESHOLD: u8 = 10;
/// Ready-polls that must pass after a Note On or aftertouch before the
/// key is evaluated again.
pub const DEBOUNCE: u16 = 10_000;
/// Note number sent for the key (middle C).
pub const PITCH: u8 = 60;
/// Controller number used for aftertouch.
pub const AFTERTOUCH_CONTROLLER: u8 = 16;

/// Conversions discarded before each trusted ADC reading.
pub const ADC_SETTLE_CONVERSIONS: u16 = 300;

/// Detach hold time during the reconnect dance, in watchdog-fed steps.
pub const DISCONNECT_STEPS: u8 = 40;
/// Length of one detach step in ms.
pub const DISCONNECT_STEP_MS: u16 = 15;
/// Settle time after re-attaching, in ms.
pub const CONNECT_SETTLE_MS: u16 = 100;

/// CPU clock in kHz; the USB bit timing needs exactly this.
pub const CPU_KHZ: u32 = 16_500;
