//! Bit-banged low-speed USB on PB1 (D-) and PB2 (D+).
//!
//! Low speed runs at 1.5 Mbit/s, which is 11 CPU cycles per bit at
//! 16.5 MHz. The first K of a SYNC field raises D+ and enters INT0. From
//! there the handler below runs a whole transaction without leaving the
//! interrupt:
//!
//! - receive the token, compare its first level bytes with the token images
//!   in [`Sie`](pressure_midi_core::usb::Sie)
//! - IN: send the staged frame, NAK or STALL, then wait for the host's ACK
//! - SETUP/OUT: receive the DATA packet and answer with a handshake
//!
//! Decoding, CRC checks and every other state change happen afterwards in
//! [`usb_data`] and [`usb_in_acked`], still inside the interrupt but after
//! the bus has gone quiet.
//!
//! Every receive and transmit loop is cycle counted; the offsets in the
//! comments are CPU cycles from the sample (`in`) or drive (`out`) of the
//! current bit. Receiving resynchronises twice per byte: a bit with probes
//! at +3 and +8 notes whether the next edge came early or late and the bit
//! after it is shortened or lengthened by one cycle.

use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::mem::offset_of;

use avr_device::attiny85::Peripherals;
use pressure_midi_core::calibration::FrameTimer;
use pressure_midi_core::usb::sie::layout;
use pressure_midi_core::usb::{Bus, LineFrame, Pid, Transaction, FRAME_BYTES, SYNC_LEVELS};

/// D- on PB1. High is J at low speed.
pub const D_MINUS: u8 = 0x02;
/// D+ on PB2, also INT0.
pub const D_PLUS: u8 = 0x04;
const LINES: u8 = D_MINUS | D_PLUS;

/// INT0 bit in GIMSK and GIFR.
const INT0: u8 = 0x40;
/// ISC01 | ISC00: INT0 on rising edge.
const RISING_EDGE: u8 = 0x03;

/// Consecutive SE0 samples the main loop needs to call it a bus reset.
/// A single EOP is two bit times, well below this.
const RESET_SAMPLES: u8 = 20;

/// I/O addresses for `in`, `out`, `sbic` and `sbis`.
mod io {
    pub const PINB: u8 = 0x16;
    pub const DDRB: u8 = 0x17;
    pub const PORTB: u8 = 0x18;
    pub const GIFR: u8 = 0x3A;
    pub const SREG: u8 = 0x3F;
}

/// Three-cycle delay loop passes between the host's EOP and our SYNC.
const TURNAROUND_LOOPS: u8 = 5;

/// Packet buffers the assembly works on.
#[repr(C)]
struct Phy {
    /// Last packet received, SYNC preset
    rx: LineFrame,
    /// SYNC and PID levels of the handshake going out
    handshake: [u8; 2],
}

#[repr(transparent)]
struct SharedPhy(UnsafeCell<Phy>);

// SAFETY: only touched from INT0, which does not nest.
unsafe impl Sync for SharedPhy {}

static USB_PHY: SharedPhy = SharedPhy(UnsafeCell::new(Phy {
    rx: LineFrame::synced(),
    handshake: [SYNC_LEVELS, 0],
}));

const RX_LEVELS: usize = offset_of!(Phy, rx) + LineFrame::LEVELS_OFFSET;
const HANDSHAKE: usize = offset_of!(Phy, handshake);

/// A DATA packet was acknowledged with the levels left in `USB_PHY.rx`.
extern "C" fn usb_data(transaction: u8, bits: u8) {
    let Some(transaction) = Transaction::from_index(transaction) else {
        return;
    };
    // SAFETY: called from INT0 once the assembly is done with the buffer
    let rx = unsafe { &mut (*USB_PHY.0.get()).rx };
    rx.set_bits(bits as usize);
    crate::SIE.data_accepted(transaction, rx);
}

/// The host acknowledged an IN frame.
extern "C" fn usb_in_acked(transaction: u8) {
    if let Some(transaction) = Transaction::from_index(transaction) {
        crate::SIE.in_acknowledged(transaction);
    }
}

extern "C" {
    /// Loop counts from the end of one SE0 to the start of the next, zero
    /// when the bus stays silent or in reset. Runs with interrupts off.
    fn usb_measure_frame() -> u16;
}

global_asm!("
.section .text.usb_phy,\"ax\",@progbits

; INT0: one transaction. Everything up to the hooks only uses the registers
; saved here.
.global __vector_1
.type __vector_1,function
__vector_1:
    push r18
    in r18, {sreg}
    push r18
    push r19
    push r20
    push r21
    push r22
    push r23
    push r24
    push r25
    push r26
    push r27

    rcall usb_rx_frame
    cpi r23, 32
    brlo usb_ignore

    ; Tokens sharing a PID share the first image byte
    lds r18, {phy}+{rx_levels}+1
    lds r19, {phy}+{rx_levels}+2
    lds r20, {phy}+{rx_levels}+3

    lds r21, {sie}+{tokens}+3*{setup}
    cp r21, r18
    brne usb_token_out
    lds r21, {sie}+{tokens}+3*{setup}+1
    cp r21, r19
    brne usb_ignore
    lds r21, {sie}+{tokens}+3*{setup}+2
    cp r21, r20
    brne usb_ignore
    ldi r22, {setup}
    rjmp usb_data_stage

usb_token_out:
    lds r21, {sie}+{tokens}+3*{out1}
    cp r21, r18
    brne usb_token_in
    lds r21, {sie}+{tokens}+3*{out1}+1
    cp r21, r19
    brne 1f
    lds r21, {sie}+{tokens}+3*{out1}+2
    cp r21, r20
    brne 1f
    ldi r22, {out1}
    rjmp usb_data_stage
1:  lds r21, {sie}+{tokens}+3*{out0}+1
    cp r21, r19
    brne usb_ignore
    lds r21, {sie}+{tokens}+3*{out0}+2
    cp r21, r20
    brne usb_ignore
    ldi r22, {out0}
    rjmp usb_data_stage
usb_ignore:
    rjmp usb_done

usb_token_in:
    lds r21, {sie}+{tokens}+3*{in1}
    cp r21, r18
    brne usb_ignore
    lds r21, {sie}+{tokens}+3*{in1}+1
    cp r21, r19
    brne 1f
    lds r21, {sie}+{tokens}+3*{in1}+2
    cp r21, r20
    brne 1f
    ldi r22, {in1}
    rjmp usb_in1
1:  lds r21, {sie}+{tokens}+3*{in0}+1
    cp r21, r19
    brne usb_ignore
    lds r21, {sie}+{tokens}+3*{in0}+2
    cp r21, r20
    brne usb_ignore
    ldi r22, {in0}

    ; EP0 IN: STALL a stalled request, drop a frame staged for an older one
    lds r20, {sie}+{setups}
    lds r21, {sie}+{stalled}
    cp r21, r20
    breq usb_send_stall
    lds r21, {sie}+{ep0_in}
    tst r21
    breq usb_send_nak
    lds r21, {sie}+{ep0_in_tag}
    cp r21, r20
    breq 1f
    clr r21
    sts {sie}+{ep0_in}, r21
    rjmp usb_send_nak
1:  ldi r26, lo8({sie}+{ep0_in_frame}+{levels})
    ldi r27, hi8({sie}+{ep0_in_frame}+{levels})
    lds r23, {sie}+{ep0_in_frame}+{bits}
    rjmp usb_send_frame

usb_in1:
    lds r21, {sie}+{ep1_in}
    tst r21
    breq usb_send_nak
    ldi r26, lo8({sie}+{ep1_in_frame}+{levels})
    ldi r27, hi8({sie}+{ep1_in_frame}+{levels})
    lds r23, {sie}+{ep1_in_frame}+{bits}

usb_send_frame:
    rcall usb_tx_frame
    rcall usb_rx_frame
    cpi r23, 16
    brlo usb_done
    lds r21, {phy}+{rx_levels}+1
    cpi r21, {ack}
    brne usb_done
    rjmp usb_call_acked

usb_send_ack:
    ldi r21, {ack}
    rjmp usb_send_handshake
usb_send_nak:
    ldi r21, {nak}
    rjmp usb_send_handshake
usb_send_stall:
    ldi r21, {stall}
usb_send_handshake:
    rcall usb_tx_handshake

usb_done:
    ldi r21, {int0}
    out {gifr}, r21
usb_exit:
    pop r27
    pop r26
    pop r25
    pop r24
    pop r23
    pop r22
    pop r21
    pop r20
    pop r19
    pop r18
    out {sreg}, r18
    pop r18
    reti

; SETUP and OUT: r22 holds the transaction
usb_data_stage:
    rcall usb_rx_frame
    cpi r23, 32
    brlo usb_done
    mov r25, r23
    lds r21, {phy}+{rx_levels}+1
    cpi r21, {data1}
    breq 1f
    cpi r21, {data0}
    brne usb_done
1:  cpi r22, {setup}
    breq usb_accept
    cpi r22, {out0}
    brne usb_out1

    ; EP0 OUT carries nothing the device keeps
    lds r20, {sie}+{setups}
    lds r19, {sie}+{stalled}
    cp r19, r20
    breq usb_send_stall
    rjmp usb_send_ack

usb_out1:
    ldi r19, {data0}
    lds r20, {sie}+{out_toggle}
    tst r20
    breq 2f
    ldi r19, {data1}
2:  cp r21, r19
    brne usb_send_ack
    lds r20, {sie}+{received}
    tst r20
    brne usb_send_nak
usb_accept:
    ldi r21, {ack}
    rcall usb_tx_handshake

; Packets arriving during a hook must enter INT0 again, so the flag is
; cleared before the call.
usb_call_data:
    ldi r21, {int0}
    out {gifr}, r21
    push r0
    push r1
    push r30
    push r31
    clr r1
    mov r24, r22
    mov r22, r25
    rcall {usb_data}
    rjmp 1f
usb_call_acked:
    ldi r21, {int0}
    out {gifr}, r21
    push r0
    push r1
    push r30
    push r31
    clr r1
    mov r24, r22
    rcall {usb_in_acked}
1:  pop r31
    pop r30
    pop r1
    pop r0
    rjmp usb_exit

; Receive one packet into USB_PHY.rx. Returns the bit count including SYNC
; in r23, zero on timeout or overflow. Clobbers r18-r21, r24, X.
usb_rx_frame:
    ldi r21, 0
1:  sbic {pinb}, 1
    rjmp 2f
    dec r21
    brne 1b
    rjmp usb_rx_none
2:  sbis {pinb}, 1
    rjmp 3f
    dec r21
    brne 2b
    rjmp usb_rx_none
    ; K edge seen by the read at R, 5 cycles of uncertainty
3:  ldi r26, lo8({phy}+{rx_levels}+1)   ; R+3
    ldi r27, hi8({phy}+{rx_levels}+1)
    ldi r24, {frame_bytes}-1
    rjmp .+0
    rjmp .+0
    rjmp .+0
    nop
    in r18, {pinb}                      ; R+13, middle of the next bit
    sbrc r18, 1
    rjmp 2b                             ; J: not the KK closing SYNC yet
    rjmp .+0                            ; R+16
    rjmp .+0
    rjmp .+0
    rjmp usb_rx_loop                    ; first PID sample at R+24

usb_rx_se0_0:
    ldi r23, 0
    rjmp usb_rx_eop
usb_rx_se0_1:
    ldi r23, 1
    rjmp usb_rx_eop
usb_rx_se0_2:
    ldi r23, 2
    rjmp usb_rx_eop
usb_rx_se0_3:
    ldi r23, 3
    rjmp usb_rx_eop

usb_rx_loop:
    ; bit 0
    in r18, {pinb}          ; 0
    bst r18, 1
    bld r20, 0
    andi r18, {lines}
    breq usb_rx_se0_0       ; 4
    rjmp .+0
    rjmp .+0
    rjmp .+0
    ; bit 1: probe for the edge after it
    in r18, {pinb}          ; 0
    bst r18, 1
    bld r20, 1
    in r19, {pinb}          ; 3, early probe
    eor r19, r18
    andi r18, {lines}
    breq usb_rx_se0_1       ; 6
    nop
    in r21, {pinb}          ; 8, late probe
    rjmp .+0
    ; bit 2: 10 cycles after an early edge, 12 after a late one
    in r18, {pinb}          ; 0
    bst r18, 1
    bld r20, 2
    eor r21, r18
    andi r18, {lines}
    breq usb_rx_se0_2       ; 5
    sbrs r19, 1
    rjmp .+0
    sbrc r21, 1
    rjmp .+0
    ; bit 3
    in r18, {pinb}
    bst r18, 1
    bld r20, 3
    andi r18, {lines}
    breq usb_rx_se0_3
    rjmp .+0
    rjmp .+0
    rjmp .+0
    ; bit 4
    in r18, {pinb}
    bst r18, 1
    bld r20, 4
    andi r18, {lines}
    breq usb_rx_se0_4
    rjmp .+0
    rjmp .+0
    rjmp .+0
    ; bit 5: probe
    in r18, {pinb}
    bst r18, 1
    bld r20, 5
    in r19, {pinb}
    eor r19, r18
    andi r18, {lines}
    breq usb_rx_se0_5
    nop
    in r21, {pinb}
    rjmp .+0
    ; bit 6: resolve
    in r18, {pinb}
    bst r18, 1
    bld r20, 6
    eor r21, r18
    andi r18, {lines}
    breq usb_rx_se0_6
    sbrs r19, 1
    rjmp .+0
    sbrc r21, 1
    rjmp .+0
    ; bit 7: store
    in r18, {pinb}          ; 0
    bst r18, 1
    bld r20, 7
    andi r18, {lines}
    breq usb_rx_se0_7       ; 4
    st X+, r20              ; 5
    dec r24                 ; 7
    breq usb_rx_none        ; 8
    rjmp usb_rx_loop        ; 9

usb_rx_se0_4:
    ldi r23, 4
    rjmp usb_rx_eop
usb_rx_se0_5:
    ldi r23, 5
    rjmp usb_rx_eop
usb_rx_se0_6:
    ldi r23, 6
    rjmp usb_rx_eop
usb_rx_se0_7:
    ldi r23, 7
usb_rx_eop:
    st X, r20
    subi r26, lo8({phy}+{rx_levels})
    lsl r26
    lsl r26
    lsl r26
    add r23, r26
    ret
usb_rx_none:
    clr r23
    ret

; Send SYNC and the PID levels in r21.
usb_tx_handshake:
    sts {phy}+{handshake}+1, r21
    ldi r26, lo8({phy}+{handshake})
    ldi r27, hi8({phy}+{handshake})
    ldi r23, 16

; Send r23 bit times of levels from X, then EOP. Waits for the host's EOP
; to end first. Clobbers r18-r21, r23, X.
usb_tx_frame:
    ldi r21, 0
1:  sbic {pinb}, 1
    rjmp 2f
    dec r21
    brne 1b
2:  ldi r21, {turnaround}
3:  dec r21
    brne 3b
    in r19, {portb}
    andi r19, {not_lines}
    mov r18, r19
    ori r19, {d_minus}      ; J
    ori r18, {d_plus}       ; K
    out {portb}, r19
    in r21, {ddrb}
    ori r21, {lines}
    out {ddrb}, r21
    ld r20, X+
usb_tx_loop:
    ; bits 0-6
    mov r21, r18            ; 0
    sbrc r20, 0
    mov r21, r19
    out {portb}, r21        ; 3
    dec r23
    brne 1f                 ; 5
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    mov r21, r18
    sbrc r20, 1
    mov r21, r19
    out {portb}, r21
    dec r23
    brne 1f
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    mov r21, r18
    sbrc r20, 2
    mov r21, r19
    out {portb}, r21
    dec r23
    brne 1f
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    mov r21, r18
    sbrc r20, 3
    mov r21, r19
    out {portb}, r21
    dec r23
    brne 1f
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    mov r21, r18
    sbrc r20, 4
    mov r21, r19
    out {portb}, r21
    dec r23
    brne 1f
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    mov r21, r18
    sbrc r20, 5
    mov r21, r19
    out {portb}, r21
    dec r23
    brne 1f
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    mov r21, r18
    sbrc r20, 6
    mov r21, r19
    out {portb}, r21
    dec r23
    brne 1f
    rjmp usb_tx_eop
1:  rjmp .+0
    rjmp .+0
    ; bit 7 loads the next byte
    mov r21, r18            ; 0
    sbrc r20, 7
    mov r21, r19
    out {portb}, r21        ; 3
    ld r20, X+
    dec r23
    brne 1f                 ; 7
    rjmp usb_tx_eop7
1:  rjmp usb_tx_loop        ; 9

usb_tx_eop:                 ; 8
    rjmp .+0
usb_tx_eop7:                ; 10
    mov r21, r19
    andi r21, {not_d_minus}
    rjmp .+0
    out {portb}, r21        ; 14, SE0 for two bit times
    ldi r21, 7
4:  dec r21
    brne 4b
    out {portb}, r19        ; 36, J for one
    ldi r21, 3
5:  dec r21
    brne 5b
    in r21, {ddrb}
    andi r21, {not_lines}
    out {ddrb}, r21         ; 48, the pull-up holds J
    andi r19, {not_lines}
    out {portb}, r19
    ; Our own K edges latched INT0
    ldi r21, {int0}
    out {gifr}, r21
    ret

; Seven cycles per count, MEASURE_LOOP_CYCLES in the calibration.
.global usb_measure_frame
.type usb_measure_frame,function
usb_measure_frame:
    clr r24
    clr r25
1:  in r18, {pinb}
    andi r18, {lines}
    breq 2f
    adiw r24, 1
    brne 1b
    ret
2:  in r18, {pinb}
    andi r18, {lines}
    brne 3f
    adiw r24, 1
    brne 2b
    ret
3:  clr r24
    clr r25
4:  in r18, {pinb}
    andi r18, {lines}
    breq 5f
    adiw r24, 1
    brne 4b
5:  ret
",
    sie = sym crate::SIE,
    phy = sym USB_PHY,
    usb_data = sym usb_data,
    usb_in_acked = sym usb_in_acked,
    pinb = const io::PINB,
    ddrb = const io::DDRB,
    portb = const io::PORTB,
    gifr = const io::GIFR,
    sreg = const io::SREG,
    int0 = const INT0,
    lines = const LINES,
    d_minus = const D_MINUS,
    d_plus = const D_PLUS,
    not_lines = const !LINES,
    not_d_minus = const !D_MINUS,
    turnaround = const TURNAROUND_LOOPS,
    frame_bytes = const FRAME_BYTES,
    rx_levels = const RX_LEVELS,
    handshake = const HANDSHAKE,
    levels = const LineFrame::LEVELS_OFFSET,
    bits = const LineFrame::BITS_OFFSET,
    tokens = const layout::TOKENS,
    setups = const layout::SETUPS,
    stalled = const layout::STALLED,
    out_toggle = const layout::OUT_TOGGLE,
    received = const layout::RECEIVED,
    ep0_in = const layout::EP0_IN,
    ep0_in_tag = const layout::EP0_IN_TAG,
    ep0_in_frame = const layout::EP0_IN_FRAME,
    ep1_in = const layout::EP1_IN,
    ep1_in_frame = const layout::EP1_IN_FRAME,
    in1 = const Transaction::In1 as u8,
    in0 = const Transaction::In0 as u8,
    out1 = const Transaction::Out1 as u8,
    out0 = const Transaction::Out0 as u8,
    setup = const Transaction::Setup as u8,
    ack = const LineFrame::pid_levels(Pid::Ack),
    nak = const LineFrame::pid_levels(Pid::Nak),
    stall = const LineFrame::pid_levels(Pid::Stall),
    data0 = const LineFrame::pid_levels(Pid::Data0),
    data1 = const LineFrame::pid_levels(Pid::Data1),
);

pub struct UsbPins<'a> {
    dp: &'a Peripherals,
}

impl<'a> UsbPins<'a> {
    pub fn new(dp: &'a Peripherals) -> Self {
        Self { dp }
    }

    /// Arm INT0 on the rising edge of D+. The 1k5 pull-up on D- is
    /// external, so the pins stay inputs without pull-ups.
    pub fn init(&mut self) {
        let portb = &self.dp.PORTB;
        portb.ddrb.modify(|r, w| unsafe { w.bits(r.bits() & !LINES) });
        portb.portb.modify(|r, w| unsafe { w.bits(r.bits() & !LINES) });

        self.dp
            .CPU
            .mcucr
            .modify(|r, w| unsafe { w.bits(r.bits() | RISING_EDGE) });
        self.dp.EXINT.gifr.write(|w| unsafe { w.bits(INT0) });
        self.dp
            .EXINT
            .gimsk
            .modify(|r, w| unsafe { w.bits(r.bits() | INT0) });
    }

    #[inline(always)]
    fn lines(&self) -> u8 {
        self.dp.PORTB.pinb.read().bits() & LINES
    }
}

impl Bus for UsbPins<'_> {
    fn attach(&mut self) {
        self.dp
            .PORTB
            .ddrb
            .modify(|r, w| unsafe { w.bits(r.bits() & !LINES) });
    }

    fn detach(&mut self) {
        let portb = &self.dp.PORTB;
        portb.portb.modify(|r, w| unsafe { w.bits(r.bits() & !LINES) });
        portb.ddrb.modify(|r, w| unsafe { w.bits(r.bits() | LINES) });
    }

    fn in_reset(&self) -> bool {
        (0..RESET_SAMPLES).all(|_| self.lines() == 0)
    }
}

impl FrameTimer for UsbPins<'_> {
    /// Loop counts from the end of one keep-alive SE0 to the start of the
    /// next, with interrupts off. Zero when the bus is silent.
    fn measure_frame(&mut self) -> u16 {
        // SAFETY: plain register reads, clobbers only what the C ABI allows
        avr_device::interrupt::free(|_| unsafe { usb_measure_frame() })
    }
}
