//! Cyclic transfer programs
//!
//! A cyclic program moves `periods` periods of `period_bytes` each, signalling
//! an event after every period, then rewinds its addresses and starts over. It
//! never ends on its own; stop the channel to end the transfer.
//!
//! ```text
//!     MOV   CCR, control
//! restart:
//!     MOV   SAR, source
//!     MOV   DAR, destination
//!     LP    LC0, periods        ; split into 256 iteration loops as needed
//!       FLUSHP                  ; peripheral transfers only
//!       LP  LC1, bursts         ; split into 256 iteration loops as needed
//!         WFP / LD[P] / ST[P]
//!       LPEND
//!       MOV CCR, dregs control  ; only for a partial burst
//!       ...
//!       MOV CCR, control
//!       SEV event
//!     LPEND
//!     LPEND restart             ; forever
//!     END
//! ```

use crate::instruction::{Cond, Instruction, LoopCounter, MoveTarget, Request, Wait, MAX_LOOP_ITERATIONS};
use crate::{Error, Result};

/// Channel control register (`CCR`) value
///
/// Source and destination share one burst shape. The shape can be changed with
/// [`burst`](ControlWord::burst), which is how a program shortens the final,
/// partial burst of a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlWord(u32);

const SRC_INC: u32 = 1 << 0;
const SRC_BURST_SIZE_SHIFT: u32 = 1;
const SRC_BURST_LEN_SHIFT: u32 = 4;
const SRC_PROT_SHIFT: u32 = 8;
const SRC_CACHE_SHIFT: u32 = 11;
const DST_INC: u32 = 1 << 14;
const DST_BURST_SIZE_SHIFT: u32 = 15;
const DST_BURST_LEN_SHIFT: u32 = 18;
const DST_PROT_SHIFT: u32 = 22;
const DST_CACHE_SHIFT: u32 = 25;
const SWAP_SHIFT: u32 = 28;

const BURST_SIZE_MASK: u32 = 0x7;
const BURST_LEN_MASK: u32 = 0xF;
const PROT_PRIVILEGED: u32 = 1 << 0;
const PROT_NONSECURE: u32 = 1 << 1;

impl ControlWord {
    /// A control word with every field zero: fixed addresses, single byte beats
    pub const fn new() -> Self {
        ControlWord(0)
    }

    /// Wrap a raw `CCR` value
    pub const fn from_raw(raw: u32) -> Self {
        ControlWord(raw)
    }

    /// Returns the raw `CCR` value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Select which addresses increment after each beat
    pub const fn increment(self, source: bool, destination: bool) -> Self {
        let mut raw = self.0 & !(SRC_INC | DST_INC);
        if source {
            raw |= SRC_INC;
        }
        if destination {
            raw |= DST_INC;
        }
        ControlWord(raw)
    }

    /// Set the burst shape for both sides
    ///
    /// `size` is the beat size in bytes, and must be a power of two up to 16.
    /// `length` is the number of beats, `1..=16`.
    pub const fn burst(self, size: u32, length: u32) -> Self {
        let size = size.trailing_zeros() & BURST_SIZE_MASK;
        let length = length.wrapping_sub(1) & BURST_LEN_MASK;
        let raw = self.0
            & !(BURST_SIZE_MASK << SRC_BURST_SIZE_SHIFT
                | BURST_SIZE_MASK << DST_BURST_SIZE_SHIFT
                | BURST_LEN_MASK << SRC_BURST_LEN_SHIFT
                | BURST_LEN_MASK << DST_BURST_LEN_SHIFT);
        ControlWord(
            raw | size << SRC_BURST_SIZE_SHIFT
                | size << DST_BURST_SIZE_SHIFT
                | length << SRC_BURST_LEN_SHIFT
                | length << DST_BURST_LEN_SHIFT,
        )
    }

    /// Set the AXI protection for both sides
    pub const fn protection(self, privileged: bool, nonsecure: bool) -> Self {
        let mut prot = 0;
        if privileged {
            prot |= PROT_PRIVILEGED;
        }
        if nonsecure {
            prot |= PROT_NONSECURE;
        }
        let raw = self.0 & !(0x7 << SRC_PROT_SHIFT | 0x7 << DST_PROT_SHIFT);
        ControlWord(raw | prot << SRC_PROT_SHIFT | prot << DST_PROT_SHIFT)
    }

    /// Set the AXI cache control bits for both sides
    pub const fn cache(self, bits: u8) -> Self {
        let bits = bits as u32 & 0x7;
        let raw = self.0 & !(0x7 << SRC_CACHE_SHIFT | 0x7 << DST_CACHE_SHIFT);
        ControlWord(raw | bits << SRC_CACHE_SHIFT | bits << DST_CACHE_SHIFT)
    }

    /// Set the endian swap size field
    pub const fn swap(self, bits: u8) -> Self {
        let raw = self.0 & !(0x7 << SWAP_SHIFT);
        ControlWord(raw | (bits as u32 & 0x7) << SWAP_SHIFT)
    }

    /// Beat size, in bytes
    pub const fn burst_size(self) -> u32 {
        1 << ((self.0 >> SRC_BURST_SIZE_SHIFT) & BURST_SIZE_MASK)
    }

    /// Beats per burst
    pub const fn burst_length(self) -> u32 {
        ((self.0 >> SRC_BURST_LEN_SHIFT) & BURST_LEN_MASK) + 1
    }

    /// Bytes per burst
    pub const fn burst_bytes(self) -> u32 {
        self.burst_size() * self.burst_length()
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Memory to memory, paced by the controller alone
    MemoryToMemory,
    /// Memory into a peripheral FIFO, paced by the peripheral's requests
    MemoryToPeripheral { peripheral: u8 },
    /// A peripheral FIFO into memory, paced by the peripheral's requests
    PeripheralToMemory { peripheral: u8 },
}

impl Direction {
    /// The peripheral request interface that paces this transfer
    pub const fn peripheral(self) -> Option<u8> {
        match self {
            Direction::MemoryToMemory => None,
            Direction::MemoryToPeripheral { peripheral }
            | Direction::PeripheralToMemory { peripheral } => Some(peripheral),
        }
    }

    /// Apply this direction's address increment policy to `control`
    ///
    /// Peripheral FIFOs sit at a fixed address.
    pub const fn control(self, control: ControlWord) -> ControlWord {
        match self {
            Direction::MemoryToMemory => control.increment(true, true),
            Direction::MemoryToPeripheral { .. } => control.increment(true, false),
            Direction::PeripheralToMemory { .. } => control.increment(false, true),
        }
    }
}

/// A cyclic transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferSpec {
    /// Channel control for whole bursts
    pub control: ControlWord,
    pub direction: Direction,
    /// Bus address of the source
    pub source: u32,
    /// Bus address of the destination
    pub destination: u32,
    /// Bytes per period
    pub period_bytes: u32,
    /// Periods before the addresses rewind
    pub periods: u32,
}

impl TransferSpec {
    /// Number of whole bursts in one period
    pub const fn bursts(&self) -> u32 {
        self.period_bytes / self.control.burst_bytes()
    }

    /// Bytes left over after the whole bursts of a period
    pub const fn dregs_bytes(&self) -> u32 {
        self.period_bytes % self.control.burst_bytes()
    }
}

/// Emits instructions into an optional buffer
///
/// Without a buffer the assembler only counts bytes. Programs are assembled
/// twice through the same code: once to size, once to write.
struct Assembler<'a> {
    out: Option<&'a mut [u8]>,
    offset: usize,
}

impl<'a> Assembler<'a> {
    fn measure() -> Self {
        Assembler {
            out: None,
            offset: 0,
        }
    }

    fn new(out: &'a mut [u8]) -> Self {
        Assembler {
            out: Some(out),
            offset: 0,
        }
    }

    fn emit(&mut self, insn: Instruction) {
        let offset = self.offset;
        let out = self.out.as_deref_mut().map(|out| &mut out[offset..]);
        self.offset += insn.encode(out);
    }

    /// Emit `body` inside a hardware loop of `iterations`
    fn counted<F>(&mut self, counter: LoopCounter, iterations: u16, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.emit(Instruction::Loop {
            counter,
            iterations,
        });
        let start = self.offset;
        body(self)?;
        let jump = self.jump_to(start)?;
        self.emit(Instruction::LoopEnd {
            counter,
            cond: Cond::Always,
            jump,
        });
        Ok(())
    }

    /// Emit `body` `count` times, split into loops of at most 256 iterations
    fn repeat<F>(&mut self, counter: LoopCounter, count: u32, mut body: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        let full = count / u32::from(MAX_LOOP_ITERATIONS);
        let rest = (count % u32::from(MAX_LOOP_ITERATIONS)) as u16;
        for _ in 0..full {
            self.counted(counter, MAX_LOOP_ITERATIONS, &mut body)?;
        }
        if rest > 0 {
            self.counted(counter, rest, &mut body)?;
        }
        Ok(())
    }

    fn jump_to(&self, start: usize) -> Result<u8> {
        u8::try_from(self.offset - start).map_err(|_| Error::ProgramTooLarge)
    }
}

/// One peripheral-paced or memory-to-memory beat group
fn transfer(asm: &mut Assembler, direction: Direction, request: Request) {
    let wait = match request {
        Request::Single => Wait::Single,
        Request::Burst => Wait::Burst,
    };
    match direction {
        Direction::MemoryToMemory => {
            asm.emit(Instruction::Load(Cond::Always));
            asm.emit(Instruction::Store(Cond::Always));
        }
        Direction::MemoryToPeripheral { peripheral } => {
            asm.emit(Instruction::WaitForPeripheral { wait, peripheral });
            asm.emit(Instruction::Load(Cond::Always));
            asm.emit(Instruction::StorePeripheral {
                request,
                peripheral,
            });
        }
        Direction::PeripheralToMemory { peripheral } => {
            asm.emit(Instruction::WaitForPeripheral { wait, peripheral });
            asm.emit(Instruction::LoadPeripheral {
                request,
                peripheral,
            });
            asm.emit(Instruction::Store(Cond::Always));
        }
    }
}

/// The bytes of a period that don't fill a burst
///
/// Whole beats move in one shortened burst. Bytes short of a whole beat move as
/// single byte beats. The control word is restored afterwards.
fn dregs(asm: &mut Assembler, spec: &TransferSpec) {
    let dregs = spec.dregs_bytes();
    if dregs == 0 {
        return;
    }
    let size = spec.control.burst_size();
    let beats = dregs / size;
    let tail = dregs % size;
    if beats > 0 {
        asm.emit(Instruction::Move {
            target: MoveTarget::Control,
            value: spec.control.burst(size, beats).raw(),
        });
        transfer(asm, spec.direction, Request::Burst);
    }
    if tail > 0 {
        asm.emit(Instruction::Move {
            target: MoveTarget::Control,
            value: spec.control.burst(1, tail).raw(),
        });
        transfer(asm, spec.direction, Request::Burst);
    }
    asm.emit(Instruction::Move {
        target: MoveTarget::Control,
        value: spec.control.raw(),
    });
}

fn period(asm: &mut Assembler, spec: &TransferSpec, event: u8) -> Result<()> {
    if let Some(peripheral) = spec.direction.peripheral() {
        asm.emit(Instruction::FlushPeripheral { peripheral });
    }
    asm.repeat(LoopCounter::One, spec.bursts(), |asm| {
        transfer(asm, spec.direction, Request::Burst);
        Ok(())
    })?;
    dregs(asm, spec);
    asm.emit(Instruction::SignalEvent { event });
    Ok(())
}

fn cyclic(asm: &mut Assembler, spec: &TransferSpec, event: u8) -> Result<()> {
    asm.emit(Instruction::Move {
        target: MoveTarget::Control,
        value: spec.control.raw(),
    });
    let restart = asm.offset;
    asm.emit(Instruction::Move {
        target: MoveTarget::Source,
        value: spec.source,
    });
    asm.emit(Instruction::Move {
        target: MoveTarget::Destination,
        value: spec.destination,
    });
    asm.repeat(LoopCounter::Zero, spec.periods, |asm| {
        period(asm, spec, event)
    })?;
    let jump = asm.jump_to(restart)?;
    asm.emit(Instruction::LoopForever {
        counter: LoopCounter::One,
        jump,
    });
    asm.emit(Instruction::End);
    Ok(())
}

fn validate(spec: &TransferSpec) -> Result<()> {
    if spec.periods == 0 || spec.period_bytes == 0 {
        return Err(Error::InvalidTransfer);
    }
    Ok(())
}

/// Returns the size of the cyclic program for `spec`, signalling `event`
pub fn measure(spec: &TransferSpec, event: u8) -> Result<usize> {
    validate(spec)?;
    let mut asm = Assembler::measure();
    cyclic(&mut asm, spec, event)?;
    Ok(asm.offset)
}

/// Write the cyclic program for `spec` into `out`, signalling `event` after
/// every period
///
/// Returns the program size. `out` is untouched if the program doesn't fit.
pub fn write(spec: &TransferSpec, event: u8, out: &mut [u8]) -> Result<usize> {
    let size = measure(spec, event)?;
    if size > out.len() {
        return Err(Error::ProgramTooLarge);
    }
    let mut asm = Assembler::new(out);
    cyclic(&mut asm, spec, event)?;
    debug_assert_eq!(asm.offset, size);
    Ok(asm.offset)
}
