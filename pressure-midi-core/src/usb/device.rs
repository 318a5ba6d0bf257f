//! Main-loop side of the USB stack: connection sequencing, control transfers
//! and the interrupt IN endpoint.

use super::line::LineFrame;
use super::setup::{DescriptorType, Direction, Request, RequestKind, SetupPacket};
use super::sie::{Received, Sie};
use super::table::Table;
use super::{Bus, Delay, Watchdog};
use crate::config::{CONNECT_SETTLE_MS, DISCONNECT_STEPS, DISCONNECT_STEP_MS};

/// Max packet size of every endpoint on a low-speed device.
pub const MAX_PACKET_SIZE: usize = 8;

/// Endpoint number of the interrupt endpoint pair.
pub const INTERRUPT_ENDPOINT: u8 = 1;

/// Hooks the application provides to the transport.
pub trait UsbFunction {
    /// Descriptor table for GET_DESCRIPTOR, `None` stalls the request.
    fn descriptor(&self, kind: DescriptorType, index: u8) -> Option<Table>;

    /// Data received on an OUT endpoint other than EP0.
    fn out_packet(&mut self, endpoint: u8, data: &[u8]) {
        let _ = (endpoint, data);
    }

    /// Bus reset finished; the host is about to enumerate.
    fn reset_ready(&mut self) {}
}

/// EP0 state between SETUP and the end of its data stage.
#[derive(Clone, Copy, Debug)]
enum Control {
    Idle,
    /// Descriptor bytes still to send, one packet per poll
    DataIn {
        remaining: Table,
        toggle: bool,
        /// End with a short packet even if `remaining` runs out on a
        /// packet boundary
        short: bool,
    },
    /// A single DATA1 reply of up to two bytes; empty for a status stage
    Reply { data: [u8; 2], len: u8 },
    /// Status stage of SET_ADDRESS
    Address(u8),
    Stall,
}

impl Control {
    const fn status() -> Self {
        Self::Reply {
            data: [0; 2],
            len: 0,
        }
    }

    /// Reply with at most `requested` bytes of `bytes`.
    fn reply(bytes: &[u8], requested: u16) -> Self {
        let mut data = [0; 2];
        let len = bytes.len().min(data.len()).min(requested as usize);
        data[..len].copy_from_slice(&bytes[..len]);
        Self::Reply {
            data,
            len: len as u8,
        }
    }

    fn data_in(table: Table, requested: u16) -> Self {
        let requested = requested as usize;
        let remaining = table.truncate(requested);
        Self::DataIn {
            remaining,
            toggle: true,
            short: remaining.len() < requested && remaining.len() % MAX_PACKET_SIZE == 0,
        }
    }
}

/// Poll-driven half of the device stack.
pub struct Transport<'a> {
    sie: &'a Sie,
    control: Control,
    /// SETUP the control state belongs to
    tag: u8,
    configuration: u8,
    ep1_toggle: bool,
    in_reset: bool,
}

impl<'a> Transport<'a> {
    pub const fn new(sie: &'a Sie) -> Self {
        Self {
            sie,
            control: Control::Idle,
            tag: 0,
            configuration: 0,
            ep1_toggle: false,
            in_reset: false,
        }
    }

    /// Announce the device to the host.
    pub fn connect(&mut self, bus: &mut impl Bus) {
        bus.attach();
    }

    /// Drop off the bus and forget all host-assigned state.
    pub fn disconnect(&mut self, bus: &mut impl Bus) {
        bus.detach();
        self.reset();
    }

    /// Force the host to re-enumerate: stay detached long enough for any
    /// host to notice, then attach and let the bus settle. The watchdog is
    /// fed throughout.
    pub fn reconnect(
        &mut self,
        bus: &mut impl Bus,
        watchdog: &mut impl Watchdog,
        delay: &mut impl Delay,
    ) {
        self.disconnect(bus);
        for _ in 0..DISCONNECT_STEPS {
            watchdog.feed();
            delay.delay_ms(DISCONNECT_STEP_MS);
        }
        self.connect(bus);

        let mut settle = CONNECT_SETTLE_MS;
        while settle > 0 {
            let step = settle.min(DISCONNECT_STEP_MS);
            watchdog.feed();
            delay.delay_ms(step);
            settle -= step;
        }
        watchdog.feed();
    }

    /// Service the bus. Handles at most one received packet and stages at
    /// most one control frame per call.
    pub fn poll(&mut self, bus: &impl Bus, function: &mut impl UsbFunction) {
        if bus.in_reset() {
            if !self.in_reset {
                self.in_reset = true;
                self.reset();
            }
            return;
        }
        if self.in_reset {
            self.in_reset = false;
            #[cfg(feature = "defmt")]
            defmt::debug!("usb: reset done");
            function.reset_ready();
        }

        if let Some(rx) = self.sie.take_received(self.tag) {
            self.handle(rx, function);
        }
        self.stage();
    }

    /// True when the host has configured the device and the previous
    /// interrupt IN packet was picked up.
    pub fn interrupt_endpoint_ready(&self) -> bool {
        self.configuration != 0 && self.sie.interrupt_idle()
    }

    /// Queue one packet on the interrupt IN endpoint. Dropped when the
    /// endpoint is not ready.
    pub fn send_interrupt(&mut self, packet: &[u8; MAX_PACKET_SIZE]) {
        if !self.interrupt_endpoint_ready() {
            return;
        }
        if self.sie.queue_interrupt(LineFrame::data(self.ep1_toggle, packet)) {
            self.ep1_toggle = !self.ep1_toggle;
        }
    }

    pub fn configured(&self) -> bool {
        self.configuration != 0
    }

    fn reset(&mut self) {
        self.sie.reset();
        self.control = Control::Idle;
        self.configuration = 0;
        self.ep1_toggle = false;
    }

    fn handle(&mut self, rx: Received, function: &mut impl UsbFunction) {
        if rx.setup {
            self.tag = rx.tag;
            self.control = match SetupPacket::parse(rx.payload()) {
                Some(setup) => self.setup(setup, &*function),
                None => Control::Stall,
            };
        } else if rx.endpoint == INTERRUPT_ENDPOINT && self.configured() {
            function.out_packet(rx.endpoint, rx.payload());
        }
        // EP0 OUT: status stage or class request data, nothing to do
    }

    fn setup(&mut self, setup: &SetupPacket, function: &impl UsbFunction) -> Control {
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "usb: setup {=u8:#x} {=u8:#x} {=u16:#x}",
            setup.request_type,
            setup.request,
            setup.value.get()
        );

        match setup.kind() {
            Some(RequestKind::Standard) => self.standard(setup, function),
            // Audio class requests carry nothing this device acts on
            Some(RequestKind::Class) => Control::status(),
            _ => Control::Stall,
        }
    }

    fn standard(&mut self, setup: &SetupPacket, function: &impl UsbFunction) -> Control {
        let Some(request) = setup.standard_request() else {
            return Control::Stall;
        };
        let value = setup.value.get();
        let length = setup.length.get();

        match (setup.direction(), request) {
            (Direction::In, Request::GetDescriptor) => {
                let (kind, index) = setup.descriptor();
                match kind.and_then(|kind| function.descriptor(kind, index)) {
                    Some(table) => Control::data_in(table, length),
                    None => Control::Stall,
                }
            }
            (Direction::Out, Request::SetAddress) => Control::Address(value as u8),
            (Direction::Out, Request::SetConfiguration) => match value {
                0 | 1 => {
                    self.configuration = value as u8;
                    self.ep1_toggle = false;
                    self.sie.reset_out_toggle();
                    Control::status()
                }
                _ => Control::Stall,
            },
            (Direction::In, Request::GetConfiguration) => {
                Control::reply(&[self.configuration], length)
            }
            (Direction::In, Request::GetStatus) => Control::reply(&[0, 0], length),
            (Direction::In, Request::GetInterface) if self.configured() => {
                Control::reply(&[0], length)
            }
            (Direction::Out, Request::SetInterface) if value == 0 => Control::status(),
            (Direction::Out, Request::ClearFeature) => {
                // ENDPOINT_HALT on EP1 restarts both toggles
                if setup.request_type & 0x1F == 0x02
                    && setup.index.get() as u8 & 0x0F == INTERRUPT_ENDPOINT
                {
                    self.ep1_toggle = false;
                    self.sie.reset_out_toggle();
                }
                Control::status()
            }
            (Direction::Out, Request::SetFeature) => Control::status(),
            _ => Control::Stall,
        }
    }

    /// Hand the next EP0 frame to the interrupt once the previous one has
    /// been acknowledged.
    fn stage(&mut self) {
        if !self.sie.control_idle() {
            return;
        }
        match self.control {
            Control::Idle => {}
            Control::Stall => {
                self.sie.stall_control(self.tag);
                self.control = Control::Idle;
            }
            Control::Reply { data, len } => {
                let frame = LineFrame::data(true, &data[..len as usize]);
                if self.sie.stage_control(self.tag, frame) {
                    self.control = Control::Idle;
                }
            }
            Control::Address(address) => {
                if self.sie.stage_address(self.tag, address) {
                    self.control = Control::Idle;
                }
            }
            Control::DataIn {
                remaining,
                toggle,
                short,
            } => {
                let mut chunk = [0u8; MAX_PACKET_SIZE];
                let (len, rest) = remaining.read_into(&mut chunk);
                if !self.sie.stage_control(self.tag, LineFrame::data(toggle, &chunk[..len])) {
                    return;
                }
                let done = len < MAX_PACKET_SIZE || (rest.is_empty() && !short);
                self.control = if done {
                    Control::Idle
                } else {
                    Control::DataIn {
                        remaining: rest,
                        toggle: !toggle,
                        short,
                    }
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::pid::{Pid, Token};
    use crate::usb::Transmit;

    struct Host {
        sent: Vec<LineFrame>,
    }

    impl Transmit for Host {
        fn transmit(&mut self, frame: &LineFrame) {
            self.sent.push(*frame);
        }
    }

    struct Line {
        reset: bool,
        attached: bool,
    }

    impl Bus for Line {
        fn attach(&mut self) {
            self.attached = true;
        }
        fn detach(&mut self) {
            self.attached = false;
        }
        fn in_reset(&self) -> bool {
            self.reset
        }
    }

    static TABLE: [u8; 16] = [
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
    ];

    struct Function {
        resets: u8,
        out: Vec<Vec<u8>>,
    }

    impl UsbFunction for Function {
        fn descriptor(&self, kind: DescriptorType, _index: u8) -> Option<Table> {
            match kind {
                DescriptorType::Device => Some(Table::from(&TABLE[..10])),
                DescriptorType::Configuration => Some(Table::from(&TABLE[..])),
                _ => None,
            }
        }

        fn out_packet(&mut self, _endpoint: u8, data: &[u8]) {
            self.out.push(data.to_vec());
        }

        fn reset_ready(&mut self) {
            self.resets += 1;
        }
    }

    struct Rig {
        sie: &'static Sie,
        host: Host,
        line: Line,
        function: Function,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                sie: Box::leak(Box::new(Sie::new())),
                host: Host { sent: Vec::new() },
                line: Line {
                    reset: false,
                    attached: true,
                },
                function: Function {
                    resets: 0,
                    out: Vec::new(),
                },
            }
        }

        fn packet(&mut self, frame: LineFrame) -> Option<LineFrame> {
            let before = self.host.sent.len();
            self.sie.service(&frame, &mut self.host);
            self.host.sent.get(before).copied()
        }

        fn setup(&mut self, transport: &mut Transport, request: [u8; 8]) {
            self.setup_bytes(transport, &request);
        }

        fn setup_bytes(&mut self, transport: &mut Transport, request: &[u8]) {
            self.packet(LineFrame::encode(&Token::new(Pid::Setup, 0, 0).to_bytes()));
            self.packet(LineFrame::data(false, request));
            transport.poll(&self.line, &mut self.function);
        }

        fn configure(&mut self, transport: &mut Transport) {
            self.setup(transport, [0x00, 9, 1, 0, 0, 0, 0, 0]);
            assert_eq!(self.read(transport), Ok(vec![]));
        }

        /// Queue one event and let the host read it from EP1.
        fn interrupt_pid(&mut self, transport: &mut Transport) -> Option<Pid> {
            transport.send_interrupt(&[0x0B, 0xB0, 16, 64, 0, 0, 0, 0]);
            let in1 = LineFrame::encode(&Token::new(Pid::In, 0, 1).to_bytes());
            let reply = self.packet(in1)?;
            self.packet(LineFrame::handshake(Pid::Ack));
            reply.pid()
        }

        /// Read one IN packet on EP0, ACKing it. Returns the payload, or
        /// the handshake PID the device answered with.
        fn read(&mut self, transport: &mut Transport) -> Result<Vec<u8>, Pid> {
            transport.poll(&self.line, &mut self.function);
            let token = LineFrame::encode(&Token::new(Pid::In, 0, 0).to_bytes());
            let reply = self.packet(token).ok_or(Pid::Nak)?;
            let mut bytes = [0u8; 11];
            let len = reply.decode(&mut bytes).map_err(|_| Pid::Nak)?;
            match Pid::parse(bytes[0]) {
                Ok(Pid::Data0 | Pid::Data1) => {
                    self.packet(LineFrame::handshake(Pid::Ack));
                    Ok(bytes[1..len - 2].to_vec())
                }
                Ok(pid) => Err(pid),
                Err(_) => Err(Pid::Nak),
            }
        }
    }

    #[test]
    fn test_descriptor_truncated_to_length() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x80, 6, 0, 2, 0, 0, 9, 0]);
        assert_eq!(rig.read(&mut transport), Ok(TABLE[..8].to_vec()));
        assert_eq!(rig.read(&mut transport), Ok(vec![8]));
        assert_eq!(rig.read(&mut transport), Err(Pid::Nak));
    }

    #[test]
    fn test_descriptor_zero_length_packet() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x80, 6, 0, 2, 0, 0, 64, 0]);
        assert_eq!(rig.read(&mut transport), Ok(TABLE[..8].to_vec()));
        assert_eq!(rig.read(&mut transport), Ok(TABLE[8..].to_vec()));
        assert_eq!(rig.read(&mut transport), Ok(vec![]));
        assert_eq!(rig.read(&mut transport), Err(Pid::Nak));
    }

    #[test]
    fn test_short_descriptor_has_no_extra_packet() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x80, 6, 0, 1, 0, 0, 64, 0]);
        assert_eq!(rig.read(&mut transport), Ok(TABLE[..8].to_vec()));
        assert_eq!(rig.read(&mut transport), Ok(TABLE[8..10].to_vec()));
        assert_eq!(rig.read(&mut transport), Err(Pid::Nak));
    }

    #[test]
    fn test_unknown_descriptor_stalls() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x80, 6, 0, 3, 0, 0, 64, 0]);
        assert_eq!(rig.read(&mut transport), Err(Pid::Stall));
    }

    #[test]
    fn test_vendor_request_stalls() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0xC0, 1, 0, 0, 0, 0, 4, 0]);
        assert_eq!(rig.read(&mut transport), Err(Pid::Stall));
    }

    #[test]
    fn test_class_request_gets_empty_status() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x21, 0x0A, 0, 0, 0, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![]));
    }

    #[test]
    fn test_configuration() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        assert!(!transport.interrupt_endpoint_ready());

        rig.setup(&mut transport, [0x00, 9, 1, 0, 0, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![]));
        assert!(transport.configured());
        assert!(transport.interrupt_endpoint_ready());

        rig.setup(&mut transport, [0x80, 8, 0, 0, 0, 0, 1, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![1]));

        rig.setup(&mut transport, [0x00, 9, 2, 0, 0, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Err(Pid::Stall));
        assert!(transport.configured());
    }

    #[test]
    fn test_get_status() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x80, 0, 0, 0, 0, 0, 2, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![0, 0]));
    }

    #[test]
    fn test_reply_truncated_to_length() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x80, 0, 0, 0, 0, 0, 1, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![0]));

        rig.setup(&mut transport, [0x80, 8, 0, 0, 0, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![]));
    }

    #[test]
    fn test_short_setup_stalls() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup_bytes(&mut transport, &[0x80, 6, 0, 1, 0, 0]);
        assert_eq!(rig.read(&mut transport), Err(Pid::Stall));

        // The next request starts clean
        rig.setup(&mut transport, [0x80, 6, 0, 1, 0, 0, 64, 0]);
        assert_eq!(rig.read(&mut transport), Ok(TABLE[..8].to_vec()));
    }

    #[test]
    fn test_interface_alternate_settings() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.configure(&mut transport);

        rig.setup(&mut transport, [0x01, 11, 1, 0, 1, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Err(Pid::Stall));
        rig.setup(&mut transport, [0x01, 11, 0, 0, 1, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![]));

        rig.setup(&mut transport, [0x81, 10, 0, 0, 1, 0, 1, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![0]));
    }

    #[test]
    fn test_get_interface_needs_configuration() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x81, 10, 0, 0, 1, 0, 1, 0]);
        assert_eq!(rig.read(&mut transport), Err(Pid::Stall));
    }

    #[test]
    fn test_clear_halt_restarts_interrupt_toggle() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.configure(&mut transport);
        assert_eq!(rig.interrupt_pid(&mut transport), Some(Pid::Data0));

        // CLEAR_FEATURE(ENDPOINT_HALT) on EP1 IN
        rig.setup(&mut transport, [0x02, 1, 0, 0, 0x81, 0, 0, 0]);
        assert_eq!(rig.read(&mut transport), Ok(vec![]));
        assert_eq!(rig.interrupt_pid(&mut transport), Some(Pid::Data0));
        assert_eq!(rig.interrupt_pid(&mut transport), Some(Pid::Data1));
    }

    #[test]
    fn test_interrupt_toggles() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.configure(&mut transport);

        for expected in [Pid::Data0, Pid::Data1, Pid::Data0] {
            assert_eq!(rig.interrupt_pid(&mut transport), Some(expected));
            assert!(transport.interrupt_endpoint_ready());
        }
    }

    #[test]
    fn test_out_packets_reach_function() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        let out1 = LineFrame::encode(&Token::new(Pid::Out, 0, 1).to_bytes());

        // Ignored until configured
        rig.packet(out1);
        rig.packet(LineFrame::data(false, &[0x0F, 0xF8, 0, 0]));
        transport.poll(&rig.line, &mut rig.function);
        assert!(rig.function.out.is_empty());

        rig.setup(&mut transport, [0x00, 9, 1, 0, 0, 0, 0, 0]);
        rig.read(&mut transport).unwrap();
        rig.packet(out1);
        rig.packet(LineFrame::data(false, &[0x0F, 0xF8, 0, 0]));
        transport.poll(&rig.line, &mut rig.function);
        assert_eq!(rig.function.out, vec![vec![0x0F, 0xF8, 0, 0]]);
    }

    #[test]
    fn test_bus_reset() {
        let mut rig = Rig::new();
        let mut transport = Transport::new(rig.sie);
        rig.setup(&mut transport, [0x00, 9, 1, 0, 0, 0, 0, 0]);
        rig.read(&mut transport).unwrap();

        rig.line.reset = true;
        transport.poll(&rig.line, &mut rig.function);
        transport.poll(&rig.line, &mut rig.function);
        assert!(!transport.configured());
        assert_eq!(rig.function.resets, 0);

        rig.line.reset = false;
        transport.poll(&rig.line, &mut rig.function);
        assert_eq!(rig.function.resets, 1);
    }

    #[derive(Default)]
    struct Clock {
        now: u32,
        feeds: Vec<u32>,
        detached_at: Option<u32>,
        attached_at: Option<u32>,
    }

    struct TimedLine<'c>(&'c core::cell::RefCell<Clock>);

    impl Bus for TimedLine<'_> {
        fn attach(&mut self) {
            let mut clock = self.0.borrow_mut();
            clock.attached_at = Some(clock.now);
        }
        fn detach(&mut self) {
            let mut clock = self.0.borrow_mut();
            clock.detached_at = Some(clock.now);
        }
        fn in_reset(&self) -> bool {
            false
        }
    }

    impl Watchdog for TimedLine<'_> {
        fn feed(&mut self) {
            let mut clock = self.0.borrow_mut();
            let now = clock.now;
            clock.feeds.push(now);
        }
    }

    impl Delay for TimedLine<'_> {
        fn delay_ms(&mut self, ms: u16) {
            self.0.borrow_mut().now += ms as u32;
        }
    }

    #[test]
    fn test_reconnect_timing() {
        let sie = Sie::new();
        let mut transport = Transport::new(&sie);
        let clock = core::cell::RefCell::new(Clock::default());
        let mut bus = TimedLine(&clock);
        let mut watchdog = TimedLine(&clock);
        let mut delay = TimedLine(&clock);

        transport.reconnect(&mut bus, &mut watchdog, &mut delay);

        let clock = clock.into_inner();
        let detached = clock.detached_at.unwrap();
        let attached = clock.attached_at.unwrap();
        assert!(attached - detached >= 300);
        assert_eq!(attached - detached, 600);
        assert!(clock.now >= attached + 100);
        assert!(clock
            .feeds
            .windows(2)
            .all(|pair| pair[1] - pair[0] <= 15));
        assert_eq!(clock.feeds.first(), Some(&detached));
        assert_eq!(clock.feeds.last(), Some(&clock.now));
    }
}
