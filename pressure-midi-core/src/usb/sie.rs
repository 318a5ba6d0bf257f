//! Interrupt-side engine.
//!
//! Everything here has to keep up with the bus. A transaction is answered
//! in three steps:
//!
//! 1. Recognise the token by comparing its first level bytes with the
//!    images of the five tokens this device takes part in.
//! 2. Pick the handshake or IN frame from state the main loop prepared.
//! 3. After the reply is on the wire, decode and store the DATA packet or
//!    release the acknowledged slot.
//!
//! The AVR PHY does steps 1 and 2 in assembly between two packets and calls
//! back into [`Sie::data_accepted`] and [`Sie::in_acknowledged`] for step 3,
//! reading the rest of the state through [`layout`]. [`Sie::service`] runs
//! the same three steps for a PHY that hands over one packet at a time.

use core::cell::UnsafeCell;
use core::sync::atomic::{compiler_fence, AtomicBool, AtomicU8, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::crc::crc16;
use super::line::{LineFrame, MAX_PACKET, TOKEN_IMAGE};
use super::pid::{Pid, Token};
use super::slot::PacketSlot;
use super::Transmit;

const NONE: u8 = 0xFF;

/// Number of endpoints implemented (EP0 control, EP1 interrupt).
pub const ENDPOINTS: u8 = 2;

/// Bytes in the data stage of a SETUP transaction.
const SETUP_SIZE: usize = 8;

/// Shortest frame that can hold a token: SYNC plus 24 bits.
const TOKEN_BITS: usize = 32;

/// Transactions the device takes part in, in the order the interrupt tries
/// their token images. Event endpoint polls come first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Transaction {
    In1 = 0,
    In0 = 1,
    Out1 = 2,
    Out0 = 3,
    Setup = 4,
}

/// Number of token images.
pub const TRANSACTIONS: usize = 5;

impl Transaction {
    const ALL: [Self; TRANSACTIONS] = [Self::In1, Self::In0, Self::Out1, Self::Out0, Self::Setup];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::from_u8(index)
    }

    pub const fn pid(self) -> Pid {
        match self {
            Self::In1 | Self::In0 => Pid::In,
            Self::Out1 | Self::Out0 => Pid::Out,
            Self::Setup => Pid::Setup,
        }
    }

    pub const fn endpoint(self) -> u8 {
        match self {
            Self::In1 | Self::Out1 => 1,
            _ => 0,
        }
    }

    const fn image(self, address: u8) -> [u8; TOKEN_IMAGE] {
        LineFrame::encode(&Token::new(self.pid(), address, self.endpoint()).to_bytes())
            .token_image()
    }
}

const fn token_images(address: u8) -> [[u8; TOKEN_IMAGE]; TRANSACTIONS] {
    let mut images = [[0; TOKEN_IMAGE]; TRANSACTIONS];
    let mut i = 0;
    while i < TRANSACTIONS {
        images[i] = Transaction::ALL[i].image(address);
        i += 1;
    }
    images
}

/// SETUP tags skip [`NONE`] so a cleared stall never matches one.
const fn next_tag(tag: u8) -> u8 {
    if tag >= NONE - 1 {
        0
    } else {
        tag + 1
    }
}

/// A DATA packet accepted after SETUP or OUT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub struct Received {
    /// Data stage of a SETUP token
    pub setup: bool,
    pub endpoint: u8,
    /// Tag of the latest SETUP at the time of reception
    pub tag: u8,
    pub len: u8,
    pub data: [u8; 8],
}

impl Received {
    const fn empty() -> Self {
        Self {
            setup: false,
            endpoint: 0,
            tag: 0,
            len: 0,
            data: [0; 8],
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// An EP0 IN frame, tagged with the SETUP it answers.
#[derive(Clone, Copy)]
#[repr(C)]
struct Staged {
    tag: u8,
    /// Address to switch to once the host acknowledges the frame
    address: u8,
    frame: LineFrame,
}

/// Answer to an IN token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InReply {
    Frame(LineFrame),
    Nak,
    Stall,
}

/// Handshake for the DATA packet of a SETUP or OUT transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataReply {
    /// ACK and keep the payload
    Accept,
    /// ACK without keeping the payload: a retransmission sent because the
    /// host missed our ACK, or EP0 OUT data, which the device never uses
    Discard,
    /// NAK, the main loop has not picked up the previous packet
    Busy,
    Stall,
}

impl DataReply {
    pub const fn pid(self) -> Pid {
        match self {
            Self::Accept | Self::Discard => Pid::Ack,
            Self::Busy => Pid::Nak,
            Self::Stall => Pid::Stall,
        }
    }
}

/// Serial interface engine state shared between the bus interrupt and the
/// main loop.
///
/// Every field has a single writer during normal operation and the
/// interrupt cannot be preempted by the main loop, so plain loads and
/// stores suffice. [`Sie::reset`] is the exception and must only run while
/// the host holds the bus in reset, when no packets arrive.
#[repr(C)]
pub struct Sie {
    tokens: UnsafeCell<[[u8; TOKEN_IMAGE]; TRANSACTIONS]>,
    address: AtomicU8,
    /// Tag of the latest SETUP. Marks EP0 frames and guards `setup`.
    setups: AtomicU8,
    /// Tag of the request whose data and status stages get STALL
    stalled: AtomicU8,
    /// Expected data toggle of the EP1 OUT endpoint
    out_toggle: AtomicBool,
    setup_len: AtomicU8,
    setup: UnsafeCell<[u8; SETUP_SIZE]>,
    received: PacketSlot<Received>,
    ep0_in: PacketSlot<Staged>,
    ep1_in: PacketSlot<LineFrame>,
    /// Transaction the next DATA packet belongs to, for `service`
    expect: AtomicU8,
    /// Transaction whose IN frame waits for the host's ACK, for `service`
    awaiting: AtomicU8,
}

// SAFETY: `tokens` is written only by the interrupt and by `reset`, see
// above. `setup` is written only by the interrupt and read under the
// `setups` tag check in `take_received`.
unsafe impl Sync for Sie {}

/// Byte offsets into [`Sie`] for code that reaches it from assembly.
pub mod layout {
    use core::mem::offset_of;

    use super::{LineFrame, PacketSlot, Received, Sie, Staged};

    pub const TOKENS: usize = offset_of!(Sie, tokens);
    pub const SETUPS: usize = offset_of!(Sie, setups);
    pub const STALLED: usize = offset_of!(Sie, stalled);
    pub const OUT_TOGGLE: usize = offset_of!(Sie, out_toggle);
    pub const RECEIVED: usize = offset_of!(Sie, received) + PacketSlot::<Received>::STATE;
    pub const EP0_IN: usize = offset_of!(Sie, ep0_in) + PacketSlot::<Staged>::STATE;
    pub const EP0_IN_TAG: usize =
        offset_of!(Sie, ep0_in) + PacketSlot::<Staged>::BUFFER + offset_of!(Staged, tag);
    pub const EP0_IN_FRAME: usize =
        offset_of!(Sie, ep0_in) + PacketSlot::<Staged>::BUFFER + offset_of!(Staged, frame);
    pub const EP1_IN: usize = offset_of!(Sie, ep1_in) + PacketSlot::<LineFrame>::STATE;
    pub const EP1_IN_FRAME: usize = offset_of!(Sie, ep1_in) + PacketSlot::<LineFrame>::BUFFER;
}

impl Sie {
    pub const fn new() -> Self {
        Self {
            tokens: UnsafeCell::new(token_images(0)),
            address: AtomicU8::new(0),
            setups: AtomicU8::new(0),
            stalled: AtomicU8::new(NONE),
            out_toggle: AtomicBool::new(false),
            setup_len: AtomicU8::new(0),
            setup: UnsafeCell::new([0; SETUP_SIZE]),
            received: PacketSlot::new(Received::empty()),
            ep0_in: PacketSlot::new(Staged {
                tag: 0,
                address: NONE,
                frame: LineFrame::empty(),
            }),
            ep1_in: PacketSlot::new(LineFrame::empty()),
            expect: AtomicU8::new(NONE),
            awaiting: AtomicU8::new(NONE),
        }
    }

    /// Handle one packet received from the bus.
    pub fn service(&self, rx: &LineFrame, tx: &mut impl Transmit) {
        let Some(pid) = rx.pid() else {
            return;
        };
        match pid {
            Pid::Setup | Pid::Out | Pid::In => {
                self.expect.store(NONE, Ordering::Relaxed);
                self.awaiting.store(NONE, Ordering::Relaxed);
                let Some(transaction) = self.transaction(rx) else {
                    return;
                };
                if pid != Pid::In {
                    self.expect.store(transaction as u8, Ordering::Relaxed);
                    return;
                }
                match self.answer_in(transaction) {
                    InReply::Frame(frame) => {
                        tx.transmit(&frame);
                        self.awaiting.store(transaction as u8, Ordering::Relaxed);
                    }
                    InReply::Nak => tx.transmit(&LineFrame::handshake(Pid::Nak)),
                    InReply::Stall => tx.transmit(&LineFrame::handshake(Pid::Stall)),
                }
            }
            Pid::Data0 | Pid::Data1 => {
                let expect = self.expect.load(Ordering::Relaxed);
                self.expect.store(NONE, Ordering::Relaxed);
                let Some(transaction) = Transaction::from_index(expect) else {
                    return;
                };
                // The handshake goes out first; decoding does not fit in
                // the turnaround.
                let reply = self.data_reply(transaction, rx);
                tx.transmit(&LineFrame::handshake(reply.pid()));
                if reply == DataReply::Accept {
                    self.data_accepted(transaction, rx);
                }
            }
            Pid::Ack => {
                let awaiting = self.awaiting.load(Ordering::Relaxed);
                self.awaiting.store(NONE, Ordering::Relaxed);
                if let Some(transaction) = Transaction::from_index(awaiting) {
                    self.in_acknowledged(transaction);
                }
            }
            Pid::Sof | Pid::Nak | Pid::Stall => {}
        }
    }

    /// The transaction a token starts, if this device takes part in it.
    pub fn transaction(&self, rx: &LineFrame) -> Option<Transaction> {
        if rx.bits() < TOKEN_BITS {
            return None;
        }
        let image = rx.token_image();
        // SAFETY: only this context writes the images outside of bus reset
        let tokens = unsafe { &*self.tokens.get() };
        let index = tokens.iter().position(|token| *token == image)?;
        Transaction::from_index(index as u8)
    }

    /// Reply to an IN token. Drops an EP0 frame left over from an earlier
    /// request.
    pub fn answer_in(&self, transaction: Transaction) -> InReply {
        if transaction.endpoint() != 0 {
            return self.ep1_in.peek().map_or(InReply::Nak, InReply::Frame);
        }
        if self.control_stalled() {
            return InReply::Stall;
        }
        match self.ep0_in.peek() {
            Some(staged) if staged.tag == self.setups.load(Ordering::Relaxed) => {
                InReply::Frame(staged.frame)
            }
            Some(_) => {
                self.ep0_in.release();
                InReply::Nak
            }
            None => InReply::Nak,
        }
    }

    /// Handshake for the DATA packet in `rx`. A SETUP is always accepted.
    pub fn data_reply(&self, transaction: Transaction, rx: &LineFrame) -> DataReply {
        match transaction {
            Transaction::Setup => DataReply::Accept,
            Transaction::Out0 if self.control_stalled() => DataReply::Stall,
            Transaction::Out0 => DataReply::Discard,
            _ => {
                let toggle = self.out_toggle.load(Ordering::Relaxed);
                if rx.token_image()[0] != LineFrame::pid_levels(Pid::data(toggle)) {
                    DataReply::Discard
                } else if !self.received.is_empty() {
                    DataReply::Busy
                } else {
                    DataReply::Accept
                }
            }
        }
    }

    /// Store the DATA packet in `rx` after it was acknowledged with
    /// [`DataReply::Accept`].
    ///
    /// A SETUP always replaces the previous one and cancels whatever EP0
    /// still had queued for it. A SETUP that does not decode to eight bytes
    /// is stored short so the main loop stalls it. OUT data with a bad CRC
    /// is dropped.
    pub fn data_accepted(&self, transaction: Transaction, rx: &LineFrame) {
        let payload = data_payload(rx);
        match transaction {
            Transaction::Setup => {
                let (data, len) = payload.unwrap_or(([0; 8], 0));
                // SAFETY: the main loop copies `setup` only under the tag check
                unsafe { *self.setup.get() = data };
                self.setup_len.store(len, Ordering::Relaxed);
                self.stalled.store(NONE, Ordering::Relaxed);
                self.ep0_in.release();
                let tag = next_tag(self.setups.load(Ordering::Relaxed));
                self.setups.store(tag, Ordering::Release);
            }
            Transaction::Out1 => {
                let toggle = rx.pid() == Some(Pid::Data1);
                self.out_toggle.store(!toggle, Ordering::Relaxed);
                if let Some((data, len)) = payload {
                    self.received.fill(Received {
                        setup: false,
                        endpoint: transaction.endpoint(),
                        tag: self.setups.load(Ordering::Relaxed),
                        len,
                        data,
                    });
                }
            }
            _ => {}
        }
    }

    /// The host acknowledged the frame sent for an IN transaction.
    pub fn in_acknowledged(&self, transaction: Transaction) {
        match transaction {
            Transaction::In0 => {
                if let Some(staged) = self.ep0_in.peek() {
                    self.ep0_in.release();
                    if staged.address != NONE {
                        self.set_address(staged.address);
                    }
                }
            }
            Transaction::In1 => self.ep1_in.release(),
            _ => {}
        }
    }

    fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::Relaxed);
        // SAFETY: called from the interrupt or during bus reset only
        unsafe { *self.tokens.get() = token_images(address) };
    }

    fn control_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed) == self.setups.load(Ordering::Relaxed)
    }

    /// Current device address.
    pub fn address(&self) -> u8 {
        self.address.load(Ordering::Relaxed)
    }

    /// Return to the default state: address 0, all slots empty.
    ///
    /// Only call while the bus is in reset.
    pub fn reset(&self) {
        self.stalled.store(NONE, Ordering::Relaxed);
        self.expect.store(NONE, Ordering::Relaxed);
        self.awaiting.store(NONE, Ordering::Relaxed);
        self.out_toggle.store(false, Ordering::Relaxed);
        self.received.release();
        self.ep0_in.release();
        self.ep1_in.release();
        self.set_address(0);
    }

    /// Next packet for the main loop: a SETUP newer than the one tagged
    /// `handled`, otherwise OUT data.
    pub fn take_received(&self, handled: u8) -> Option<Received> {
        loop {
            let tag = self.setups.load(Ordering::Acquire);
            if tag == handled {
                break;
            }
            // SAFETY: a SETUP arriving during the copy changes the tag and
            // the copy is thrown away
            let data = unsafe { core::ptr::read_volatile(self.setup.get()) };
            let len = self.setup_len.load(Ordering::Relaxed);
            compiler_fence(Ordering::SeqCst);
            if self.setups.load(Ordering::Acquire) == tag {
                return Some(Received {
                    setup: true,
                    endpoint: 0,
                    tag,
                    len,
                    data,
                });
            }
        }
        self.received.take()
    }

    /// Tag of the latest SETUP.
    pub fn setup_tag(&self) -> u8 {
        self.setups.load(Ordering::Acquire)
    }

    /// Queue the next EP0 IN frame for the request identified by `tag`.
    pub fn stage_control(&self, tag: u8, frame: LineFrame) -> bool {
        self.ep0_in.fill(Staged {
            tag,
            address: NONE,
            frame,
        })
    }

    /// Queue the status stage of SET_ADDRESS; the address takes effect once
    /// the host acknowledges it.
    pub fn stage_address(&self, tag: u8, address: u8) -> bool {
        self.ep0_in.fill(Staged {
            tag,
            address: address & 0x7F,
            frame: LineFrame::data(true, &[]),
        })
    }

    /// Answer the rest of the request identified by `tag` with STALL.
    pub fn stall_control(&self, tag: u8) {
        self.stalled.store(tag, Ordering::Relaxed);
    }

    /// True when no EP0 IN frame is waiting for the host.
    pub fn control_idle(&self) -> bool {
        self.ep0_in.is_empty()
    }

    /// Queue an EP1 IN frame.
    pub fn queue_interrupt(&self, frame: LineFrame) -> bool {
        self.ep1_in.fill(frame)
    }

    /// True when the last EP1 IN frame was acknowledged.
    pub fn interrupt_idle(&self) -> bool {
        self.ep1_in.is_empty()
    }

    /// Expect DATA0 next on the EP1 OUT endpoint.
    pub fn reset_out_toggle(&self) {
        self.out_toggle.store(false, Ordering::Relaxed);
    }
}

impl Default for Sie {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of a DATA packet with a good CRC16.
fn data_payload(rx: &LineFrame) -> Option<([u8; 8], u8)> {
    let mut packet = [0u8; MAX_PACKET];
    let len = rx.decode(&mut packet).ok()?;
    if len < 3 {
        return None;
    }
    let payload = &packet[1..len - 2];
    if crc16(payload).to_le_bytes() != [packet[len - 2], packet[len - 1]] {
        return None;
    }
    let mut data = [0u8; 8];
    data[..payload.len()].copy_from_slice(payload);
    Some((data, payload.len() as u8))
}
