//! Drives the device stack the way a host controller would: line-level
//! packets into the interrupt engine, the main loop in between.

use pressure_midi_core::descriptors;
use pressure_midi_core::midi::{self, MidiEvent, TIMING_CLOCK};
use pressure_midi_core::note::NoteMachine;
use pressure_midi_core::status::{self, ClockBlink, Indicator, Led};
use pressure_midi_core::usb::{
    Bus, DescriptorType, LineFrame, Pid, Sie, Table, Token, Transmit, Transport, UsbFunction,
};

#[derive(Default)]
struct Wire {
    sent: Vec<LineFrame>,
}

impl Transmit for Wire {
    fn transmit(&mut self, frame: &LineFrame) {
        self.sent.push(*frame);
    }
}

struct Line {
    reset: bool,
}

impl Bus for Line {
    fn attach(&mut self) {}
    fn detach(&mut self) {}
    fn in_reset(&self) -> bool {
        self.reset
    }
}

#[derive(Default)]
struct Panel {
    red: bool,
    green: bool,
}

impl Indicator for Panel {
    fn set(&mut self, led: Led, on: bool) {
        match led {
            Led::Red => self.red = on,
            Led::Green => self.green = on,
        }
    }
}

#[derive(Default)]
struct App {
    blink: ClockBlink,
    panel: Panel,
    resets: u32,
}

impl UsbFunction for App {
    fn descriptor(&self, kind: DescriptorType, index: u8) -> Option<Table> {
        descriptors::lookup(kind, index)
    }

    fn out_packet(&mut self, _endpoint: u8, data: &[u8]) {
        self.blink.on_transfer(data, &mut self.panel);
    }

    fn reset_ready(&mut self) {
        self.resets += 1;
    }
}

/// The firmware main loop without the hardware.
struct Device {
    sie: &'static Sie,
    transport: Transport<'static>,
    app: App,
    line: Line,
    machine: NoteMachine,
}

impl Device {
    fn new() -> Self {
        let sie: &'static Sie = Box::leak(Box::new(Sie::new()));
        Self {
            sie,
            transport: Transport::new(sie),
            app: App::default(),
            line: Line { reset: false },
            machine: NoteMachine::new(),
        }
    }

    fn run(&mut self, reading: u8) {
        self.transport.poll(&self.line, &mut self.app);
        let ready = self.transport.interrupt_endpoint_ready();
        if let Some(event) = self.machine.poll(reading, ready) {
            status::show_event(event, &mut self.app.panel);
            self.transport.send_interrupt(&event.to_transfer());
        }
    }
}

struct Host {
    device: Device,
    wire: Wire,
    address: u8,
    out_toggle: bool,
}

impl Host {
    fn new() -> Self {
        Self {
            device: Device::new(),
            wire: Wire::default(),
            address: 0,
            out_toggle: false,
        }
    }

    /// A device that has been given address 3 and configured.
    fn configured() -> Self {
        let mut host = Self::new();
        host.control_out([0x00, 0x05, 3, 0, 0, 0, 0, 0]);
        host.address = 3;
        host.control_out([0x00, 0x09, 1, 0, 0, 0, 0, 0]);
        assert!(host.device.transport.configured());
        host
    }

    fn token(&self, pid: Pid, endpoint: u8) -> LineFrame {
        LineFrame::encode(&Token::new(pid, self.address, endpoint).to_bytes())
    }

    /// Put one packet on the bus and decode the device's reply, if any.
    fn exchange(&mut self, frame: LineFrame) -> Option<(Pid, Vec<u8>)> {
        let before = self.wire.sent.len();
        self.device.sie.service(&frame, &mut self.wire);
        let reply = self.wire.sent.get(before)?;
        let mut bytes = [0u8; 11];
        let len = reply.decode(&mut bytes).ok()?;
        let pid = Pid::parse(bytes[0]).ok()?;
        let payload = match pid {
            Pid::Data0 | Pid::Data1 => bytes[1..len - 2].to_vec(),
            _ => Vec::new(),
        };
        Some((pid, payload))
    }

    fn handshake(&mut self, frame: LineFrame) -> Option<Pid> {
        self.exchange(frame).map(|(pid, _)| pid)
    }

    fn setup(&mut self, request: [u8; 8]) {
        let token = self.token(Pid::Setup, 0);
        assert_eq!(self.exchange(token), None);
        assert_eq!(
            self.handshake(LineFrame::data(false, &request)),
            Some(Pid::Ack)
        );
    }

    /// One IN transaction, ACKing data.
    fn read_once(&mut self, endpoint: u8) -> Option<(Pid, Vec<u8>)> {
        let token = self.token(Pid::In, endpoint);
        let reply = self.exchange(token)?;
        if matches!(reply.0, Pid::Data0 | Pid::Data1) {
            assert_eq!(self.exchange(LineFrame::handshake(Pid::Ack)), None);
        }
        Some(reply)
    }

    /// IN transaction, letting the main loop run until the device stops
    /// NAKing.
    fn read(&mut self, endpoint: u8) -> Result<(Pid, Vec<u8>), Pid> {
        for _ in 0..8 {
            self.device.run(0);
            match self.read_once(endpoint) {
                Some((Pid::Nak, _)) => continue,
                Some((pid @ (Pid::Data0 | Pid::Data1), data)) => return Ok((pid, data)),
                Some((pid, _)) => return Err(pid),
                None => return Err(Pid::Nak),
            }
        }
        Err(Pid::Nak)
    }

    fn control_in(&mut self, request: [u8; 8]) -> Vec<u8> {
        self.setup(request);
        let length = u16::from_le_bytes([request[6], request[7]]) as usize;
        let mut data = Vec::new();
        let mut expected = Pid::Data1;
        loop {
            let (pid, chunk) = self.read(0).unwrap();
            assert_eq!(pid, expected);
            expected = if pid == Pid::Data1 {
                Pid::Data0
            } else {
                Pid::Data1
            };
            let short = chunk.len() < 8;
            data.extend(chunk);
            if short || data.len() >= length {
                break;
            }
        }

        // Status stage
        let token = self.token(Pid::Out, 0);
        self.exchange(token);
        assert_eq!(self.handshake(LineFrame::data(true, &[])), Some(Pid::Ack));
        self.device.run(0);
        data
    }

    fn control_out(&mut self, request: [u8; 8]) {
        self.setup(request);
        assert_eq!(self.read(0), Ok((Pid::Data1, Vec::new())));
    }

    /// OUT transaction without giving the main loop a turn.
    fn send(&mut self, endpoint: u8, data: &[u8]) -> Option<Pid> {
        let token = self.token(Pid::Out, endpoint);
        self.exchange(token);
        let frame = LineFrame::data(self.out_toggle, data);
        let reply = self.handshake(frame);
        if reply == Some(Pid::Ack) {
            self.out_toggle = !self.out_toggle;
        }
        reply
    }

    fn write(&mut self, endpoint: u8, data: &[u8]) {
        assert_eq!(self.send(endpoint, data), Some(Pid::Ack));
        self.device.run(0);
    }
}

fn table(kind: DescriptorType, index: u8) -> Vec<u8> {
    descriptors::lookup(kind, index).unwrap().iter().collect()
}

#[test]
fn test_enumeration() {
    let mut host = Host::new();

    // First device descriptor read at the default address, 64 bytes asked
    let device = host.control_in([0x80, 0x06, 0, 1, 0, 0, 64, 0]);
    assert_eq!(device, table(DescriptorType::Device, 0));
    assert_eq!(device.len(), 18);

    host.control_out([0x00, 0x05, 7, 0, 0, 0, 0, 0]);
    host.address = 7;
    assert_eq!(host.device.sie.address(), 7);

    let device = host.control_in([0x80, 0x06, 0, 1, 0, 0, 18, 0]);
    assert_eq!(device, table(DescriptorType::Device, 0));

    let header = host.control_in([0x80, 0x06, 0, 2, 0, 0, 9, 0]);
    assert_eq!(&header[2..4], &[101, 0]);

    let configuration = host.control_in([0x80, 0x06, 0, 2, 0, 0, 0xFF, 0]);
    assert_eq!(configuration.len(), 101);
    assert_eq!(configuration, table(DescriptorType::Configuration, 0));

    let languages = host.control_in([0x80, 0x06, 0, 3, 0, 0, 0xFF, 0]);
    assert_eq!(languages, vec![4, 3, 0x09, 0x04]);
    let product = host.control_in([0x80, 0x06, 2, 3, 0x09, 0x04, 0xFF, 0]);
    assert_eq!(product, table(DescriptorType::String, 2));

    assert!(!host.device.transport.interrupt_endpoint_ready());
    host.control_out([0x00, 0x09, 1, 0, 0, 0, 0, 0]);
    assert!(host.device.transport.interrupt_endpoint_ready());
    assert_eq!(host.control_in([0x80, 0x08, 0, 0, 0, 0, 1, 0]), vec![1]);
}

#[test]
fn test_old_address_ignored() {
    let mut host = Host::configured();
    host.address = 0;
    let token = host.token(Pid::In, 0);
    assert_eq!(host.exchange(token), None);
}

#[test]
fn test_unsupported_requests_stall() {
    let mut host = Host::configured();

    // Vendor request
    host.setup([0xC0, 0x01, 0, 0, 0, 0, 8, 0]);
    assert_eq!(host.read(0), Err(Pid::Stall));

    // Device qualifier is high-speed only
    host.setup([0x80, 0x06, 0, 6, 0, 0, 10, 0]);
    assert_eq!(host.read(0), Err(Pid::Stall));

    // Stall clears on the next SETUP
    assert_eq!(host.control_in([0x80, 0x00, 0, 0, 0, 0, 2, 0]), vec![0, 0]);
}

#[test]
fn test_setup_while_out_data_unread() {
    let mut host = Host::configured();
    let clock = MidiEvent::Realtime(TIMING_CLOCK).to_transfer();

    // The main loop has not picked up this packet yet
    assert_eq!(host.send(1, &clock), Some(Pid::Ack));
    assert_eq!(host.send(1, &clock), Some(Pid::Nak));

    // A SETUP is still accepted and answered
    assert_eq!(host.control_in([0x80, 0x08, 0, 0, 0, 0, 1, 0]), vec![1]);
    assert!(host.device.app.panel.red);
    assert_eq!(host.send(1, &clock), Some(Pid::Ack));
}

#[test]
fn test_bus_reset_returns_to_default_address() {
    let mut host = Host::configured();
    host.device.line.reset = true;
    host.device.run(0);
    host.device.line.reset = false;
    host.device.run(0);

    assert_eq!(host.device.app.resets, 1);
    assert_eq!(host.device.sie.address(), 0);
    assert!(!host.device.transport.configured());

    host.address = 0;
    let device = host.control_in([0x80, 0x06, 0, 1, 0, 0, 18, 0]);
    assert_eq!(device.len(), 18);
}

#[test]
fn test_press_and_release() {
    let mut host = Host::configured();
    host.device.machine = NoteMachine::with(60, 16, 10, 4);

    let mut events = Vec::new();
    let mut pids = Vec::new();
    for reading in [0, 0, 50, 50, 50, 50, 50, 0, 0, 0] {
        host.device.run(reading);
        if let Some((pid @ (Pid::Data0 | Pid::Data1), data)) = host.read_once(1) {
            pids.push(pid);
            events.extend(midi::events(&data));
        }
        if reading == 50 && events.len() == 1 {
            assert!(host.device.app.panel.red);
        }
    }

    assert_eq!(
        events,
        vec![
            MidiEvent::NoteOn {
                note: 60,
                velocity: 50
            },
            MidiEvent::NoteOff { note: 60 },
        ]
    );
    assert_eq!(pids, vec![Pid::Data0, Pid::Data1]);
    assert!(!host.device.app.panel.red && !host.device.app.panel.green);
}

#[test]
fn test_aftertouch_while_held() {
    let mut host = Host::configured();
    host.device.machine = NoteMachine::with(60, 16, 10, 1);

    let mut events = Vec::new();
    for reading in [30, 30, 200, 200] {
        host.device.run(reading);
        if let Some((_, data)) = host.read_once(1) {
            events.extend(midi::events(&data));
        }
    }
    assert_eq!(
        events,
        vec![
            MidiEvent::NoteOn {
                note: 60,
                velocity: 30
            },
            MidiEvent::ControlChange {
                controller: 16,
                value: 127
            },
        ]
    );
    assert!(host.device.app.panel.green);
}

#[test]
fn test_unread_endpoint_holds_state() {
    let mut host = Host::configured();
    host.device.machine = NoteMachine::with(60, 16, 10, 4);

    host.device.run(50);
    assert!(host.device.machine.sounding());
    // Host is not polling: nothing is evaluated
    for _ in 0..20 {
        host.device.run(0);
    }
    assert_eq!(host.device.machine.recovering(), 4);
    assert!(!host.device.transport.interrupt_endpoint_ready());

    let (_, data) = host.read_once(1).unwrap();
    assert_eq!(
        midi::events(&data).collect::<Vec<_>>(),
        vec![MidiEvent::NoteOn {
            note: 60,
            velocity: 50
        }]
    );
    assert!(host.device.transport.interrupt_endpoint_ready());
}

#[test]
fn test_clock_blink() {
    let mut host = Host::configured();
    let clock = MidiEvent::Realtime(TIMING_CLOCK).to_transfer();

    host.write(1, &clock);
    assert!(host.device.app.panel.red);
    for _ in 1..11 {
        host.write(1, &clock);
    }
    assert!(host.device.app.panel.red);
    host.write(1, &clock);
    assert!(!host.device.app.panel.red);
    for _ in 12..24 {
        host.write(1, &clock);
    }
    assert!(!host.device.app.panel.red);
    host.write(1, &clock);
    assert!(host.device.app.panel.red);
}
