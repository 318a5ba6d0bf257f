use anyhow::{bail, Context, Result};
use pressure_midi_core::config::{PRODUCT_ID, VENDOR_ID};
use pressure_midi_core::usb::DescriptorType;
use rusb::{Device, DeviceHandle, Direction, GlobalContext, Recipient, RequestType};
use std::time::Duration;

/// MIDI streaming interface; both MIDI endpoints hang off it.
pub const STREAMING_INTERFACE: u8 = 1;
/// Interrupt IN endpoint carrying events from the key.
pub const EVENTS_IN: u8 = 0x81;
/// Interrupt OUT endpoint the key listens on.
pub const EVENTS_OUT: u8 = 0x01;

/// USB control transfer timeout.
const USB_TIMEOUT: Duration = Duration::from_secs(2);

/// GET_DESCRIPTOR
const GET_DESCRIPTOR: u8 = 0x06;

/// Where a key sits on the bus.
pub struct Found {
    pub bus: u8,
    pub address: u8,
    pub version: rusb::Version,
}

fn is_key(device: &Device<GlobalContext>) -> Result<bool> {
    let desc = device
        .device_descriptor()
        .context("failed to read device descriptor")?;
    Ok(desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID)
}

/// List every connected pressure key.
pub fn detect() -> Result<Vec<Found>> {
    let devices = rusb::devices().context("failed to enumerate USB devices")?;
    let mut found = Vec::new();
    for device in devices.iter() {
        if !is_key(&device)? {
            continue;
        }
        let desc = device
            .device_descriptor()
            .context("failed to read device descriptor")?;
        found.push(Found {
            bus: device.bus_number(),
            address: device.address(),
            version: desc.device_version(),
        });
    }
    Ok(found)
}

/// Open the first pressure key found.
pub fn open_device() -> Result<DeviceHandle<GlobalContext>> {
    let devices = rusb::devices().context("failed to enumerate USB devices")?;
    for device in devices.iter() {
        if is_key(&device)? {
            let handle = device
                .open()
                .context("failed to open the key (may need root/sudo or udev rules)")?;
            return Ok(handle);
        }
    }
    bail!(
        "no pressure key found ({:04X}:{:04X}). Is it plugged in?",
        VENDOR_ID,
        PRODUCT_ID
    );
}

/// Claim the streaming interface, taking it from the kernel MIDI driver
/// where the platform allows.
pub fn claim_streaming(handle: &mut DeviceHandle<GlobalContext>) -> Result<()> {
    // Not supported everywhere; claiming reports the real problem
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle
        .claim_interface(STREAMING_INTERFACE)
        .context("failed to claim the MIDI streaming interface")?;
    Ok(())
}

/// Read a whole descriptor with GET_DESCRIPTOR.
pub fn read_descriptor(
    handle: &DeviceHandle<GlobalContext>,
    kind: DescriptorType,
    index: u8,
) -> Result<Vec<u8>> {
    let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
    let value = (kind as u16) << 8 | index as u16;
    let language = if kind == DescriptorType::String && index != 0 {
        0x0409
    } else {
        0
    };
    let mut buf = vec![0u8; 255];
    let len = handle
        .read_control(request_type, GET_DESCRIPTOR, value, language, &mut buf, USB_TIMEOUT)
        .with_context(|| format!("GET_DESCRIPTOR {:?} {} failed", kind, index))?;
    buf.truncate(len);
    Ok(buf)
}
