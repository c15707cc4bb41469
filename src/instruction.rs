//! PL330 instruction encoding
//!
//! Every instruction knows its own byte encoding. The same [`Instruction::encode`]
//! call sizes an instruction (no output buffer) and writes it (with an output
//! buffer), so a program measured before emission always has the emitted length.

/// Longest encoding of any instruction, in bytes
pub const MAX_INSTRUCTION_LEN: usize = 6;

/// Request condition attached to loads, stores and loop ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Cond {
    /// Execute unconditionally
    Always,
    /// Execute only for a single request
    Single,
    /// Execute only for a burst request
    Burst,
}

impl Cond {
    /// `bs` and `x` bits
    const fn bits(self) -> u8 {
        match self {
            Cond::Always => 0b00,
            Cond::Single => 0b01,
            Cond::Burst => 0b11,
        }
    }
}

/// Request type named by peripheral loads and stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    /// Single request
    Single,
    /// Burst request
    Burst,
}

/// What a wait-for-peripheral instruction waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wait {
    /// Wait for a single request
    Single,
    /// Wait for a burst request
    Burst,
    /// Wait for whatever the peripheral asks for
    Peripheral,
}

/// Loop counter register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoopCounter {
    /// `LC0`
    Zero,
    /// `LC1`
    One,
}

/// Destination of a move-immediate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MoveTarget {
    /// Source address register, `SAR`
    Source,
    /// Channel control register, `CCR`
    Control,
    /// Destination address register, `DAR`
    Destination,
}

/// Address register targeted by add-halfword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressRegister {
    /// `SAR`
    Source,
    /// `DAR`
    Destination,
}

/// Maximum iterations of a single hardware loop
pub const MAX_LOOP_ITERATIONS: u16 = 256;

/// One PL330 instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instruction {
    /// `DMAEND`
    End,
    /// `DMAKILL`
    Kill,
    /// `DMANOP`
    Nop,
    /// `DMARMB`
    ReadBarrier,
    /// `DMAWMB`
    WriteBarrier,
    /// `DMALD[S|B]`
    Load(Cond),
    /// `DMALDP<S|B>`
    LoadPeripheral { request: Request, peripheral: u8 },
    /// `DMAST[S|B]`
    Store(Cond),
    /// `DMASTP<S|B>`
    StorePeripheral { request: Request, peripheral: u8 },
    /// `DMASTZ`
    StoreZero,
    /// `DMAWFP`
    WaitForPeripheral { wait: Wait, peripheral: u8 },
    /// `DMAFLUSHP`
    FlushPeripheral { peripheral: u8 },
    /// `DMALP`, `iterations` in `1..=256`
    Loop { counter: LoopCounter, iterations: u16 },
    /// `DMALPEND[S|B]`, jumping `jump` bytes backwards
    LoopEnd {
        counter: LoopCounter,
        cond: Cond,
        jump: u8,
    },
    /// `DMALPEND` closing a `DMALPFE`, jumping `jump` bytes backwards
    LoopForever { counter: LoopCounter, jump: u8 },
    /// `DMAMOV`
    Move { target: MoveTarget, value: u32 },
    /// `DMAADDH`
    AddHalfword { register: AddressRegister, value: u16 },
    /// `DMASEV`
    SignalEvent { event: u8 },
    /// `DMAWFE`
    WaitForEvent { event: u8, invalidate: bool },
    /// `DMAGO`, only executable by the manager
    Go {
        channel: u8,
        address: u32,
        nonsecure: bool,
    },
}

impl Instruction {
    fn assemble(&self) -> ([u8; MAX_INSTRUCTION_LEN], usize) {
        let mut b = [0u8; MAX_INSTRUCTION_LEN];
        let len = match *self {
            Instruction::End => {
                b[0] = 0x00;
                1
            }
            Instruction::Kill => {
                b[0] = 0x01;
                1
            }
            Instruction::Nop => {
                b[0] = 0x18;
                1
            }
            Instruction::ReadBarrier => {
                b[0] = 0x12;
                1
            }
            Instruction::WriteBarrier => {
                b[0] = 0x13;
                1
            }
            Instruction::Load(cond) => {
                b[0] = 0x04 | cond.bits();
                1
            }
            Instruction::Store(cond) => {
                b[0] = 0x08 | cond.bits();
                1
            }
            Instruction::StoreZero => {
                b[0] = 0x0C;
                1
            }
            Instruction::LoadPeripheral {
                request,
                peripheral,
            } => {
                b[0] = 0x25 | ((request == Request::Burst) as u8) << 1;
                b[1] = peripheral << 3;
                2
            }
            Instruction::StorePeripheral {
                request,
                peripheral,
            } => {
                b[0] = 0x29 | ((request == Request::Burst) as u8) << 1;
                b[1] = peripheral << 3;
                2
            }
            Instruction::WaitForPeripheral { wait, peripheral } => {
                b[0] = 0x30
                    | match wait {
                        Wait::Single => 0b00,
                        Wait::Peripheral => 0b01,
                        Wait::Burst => 0b10,
                    };
                b[1] = peripheral << 3;
                2
            }
            Instruction::FlushPeripheral { peripheral } => {
                b[0] = 0x35;
                b[1] = peripheral << 3;
                2
            }
            Instruction::Loop {
                counter,
                iterations,
            } => {
                b[0] = 0x20 | (counter as u8) << 1;
                b[1] = iterations.wrapping_sub(1) as u8;
                2
            }
            Instruction::LoopEnd {
                counter,
                cond,
                jump,
            } => {
                b[0] = 0x38 | (counter as u8) << 2 | cond.bits();
                b[1] = jump;
                2
            }
            Instruction::LoopForever { counter, jump } => {
                b[0] = 0x28 | (counter as u8) << 2;
                b[1] = jump;
                2
            }
            Instruction::Move { target, value } => {
                b[0] = 0xBC;
                b[1] = match target {
                    MoveTarget::Source => 0,
                    MoveTarget::Control => 1,
                    MoveTarget::Destination => 2,
                };
                b[2..6].copy_from_slice(&value.to_le_bytes());
                6
            }
            Instruction::AddHalfword { register, value } => {
                b[0] = 0x54 | ((register == AddressRegister::Destination) as u8) << 1;
                b[1..3].copy_from_slice(&value.to_le_bytes());
                3
            }
            Instruction::SignalEvent { event } => {
                b[0] = 0x34;
                b[1] = event << 3;
                2
            }
            Instruction::WaitForEvent { event, invalidate } => {
                b[0] = 0x36;
                b[1] = event << 3 | (invalidate as u8) << 1;
                2
            }
            Instruction::Go {
                channel,
                address,
                nonsecure,
            } => {
                b[0] = 0xA0 | (nonsecure as u8) << 1;
                b[1] = channel & 0x7;
                b[2..6].copy_from_slice(&address.to_le_bytes());
                6
            }
        };
        (b, len)
    }

    /// Returns the encoded size of this instruction, in bytes
    pub fn size(&self) -> usize {
        self.encode(None)
    }

    /// Encode the instruction into `out`, returning the number of bytes it occupies
    ///
    /// When `out` is `None`, nothing is written but the size is still returned.
    ///
    /// ```
    /// use pl330_dma::instruction::Instruction;
    ///
    /// let mut buffer = [0u8; 6];
    /// let written = Instruction::SignalEvent { event: 3 }.encode(Some(&mut buffer));
    /// assert_eq!(written, 2);
    /// assert_eq!(&buffer[..2], &[0x34, 0x18]);
    /// assert_eq!(Instruction::SignalEvent { event: 3 }.encode(None), 2);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than the encoded instruction.
    pub fn encode(&self, out: Option<&mut [u8]>) -> usize {
        let (bytes, len) = self.assemble();
        if let Some(out) = out {
            out[..len].copy_from_slice(&bytes[..len]);
        }
        len
    }

    /// Decode the instruction at the start of `bytes`
    ///
    /// Returns the instruction and its size, or `None` if the bytes do not start
    /// with an instruction this driver emits.
    pub fn decode(bytes: &[u8]) -> Option<(Instruction, usize)> {
        let op = *bytes.first()?;
        let arg = |n: usize| bytes.get(n).copied();
        let word = |from: usize| -> Option<u32> {
            let b = bytes.get(from..from + 4)?;
            Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        let cond = |bits: u8| match bits & 0b11 {
            0b00 => Some(Cond::Always),
            0b01 => Some(Cond::Single),
            0b11 => Some(Cond::Burst),
            _ => None,
        };
        let counter = |bit: bool| {
            if bit {
                LoopCounter::One
            } else {
                LoopCounter::Zero
            }
        };

        let insn = match op {
            0x00 => Instruction::End,
            0x01 => Instruction::Kill,
            0x18 => Instruction::Nop,
            0x12 => Instruction::ReadBarrier,
            0x13 => Instruction::WriteBarrier,
            0x04 | 0x05 | 0x07 => Instruction::Load(cond(op)?),
            0x08 | 0x09 | 0x0B => Instruction::Store(cond(op)?),
            0x0C => Instruction::StoreZero,
            0x25 | 0x27 => Instruction::LoadPeripheral {
                request: if op & 0b10 != 0 {
                    Request::Burst
                } else {
                    Request::Single
                },
                peripheral: arg(1)? >> 3,
            },
            0x29 | 0x2B => Instruction::StorePeripheral {
                request: if op & 0b10 != 0 {
                    Request::Burst
                } else {
                    Request::Single
                },
                peripheral: arg(1)? >> 3,
            },
            0x30..=0x32 => Instruction::WaitForPeripheral {
                wait: match op & 0b11 {
                    0b00 => Wait::Single,
                    0b01 => Wait::Peripheral,
                    _ => Wait::Burst,
                },
                peripheral: arg(1)? >> 3,
            },
            0x35 => Instruction::FlushPeripheral {
                peripheral: arg(1)? >> 3,
            },
            0x20 | 0x22 => Instruction::Loop {
                counter: counter(op & 0b10 != 0),
                iterations: u16::from(arg(1)?) + 1,
            },
            0x38..=0x3F if op & 0b11 != 0b10 => Instruction::LoopEnd {
                counter: counter(op & 0b100 != 0),
                cond: cond(op)?,
                jump: arg(1)?,
            },
            0x28 | 0x2C => Instruction::LoopForever {
                counter: counter(op & 0b100 != 0),
                jump: arg(1)?,
            },
            0xBC => Instruction::Move {
                target: match arg(1)? {
                    0 => MoveTarget::Source,
                    1 => MoveTarget::Control,
                    2 => MoveTarget::Destination,
                    _ => return None,
                },
                value: word(2)?,
            },
            0x54 | 0x56 => Instruction::AddHalfword {
                register: if op & 0b10 != 0 {
                    AddressRegister::Destination
                } else {
                    AddressRegister::Source
                },
                value: u16::from_le_bytes([arg(1)?, arg(2)?]),
            },
            0x34 => Instruction::SignalEvent {
                event: arg(1)? >> 3,
            },
            0x36 => {
                let a = arg(1)?;
                Instruction::WaitForEvent {
                    event: a >> 3,
                    invalidate: a & 0b10 != 0,
                }
            }
            0xA0 | 0xA2 => Instruction::Go {
                channel: arg(1)? & 0x7,
                address: word(2)?,
                nonsecure: op & 0b10 != 0,
            },
            _ => return None,
        };
        let len = insn.size();
        Some((insn, len))
    }
}

/// Iterate over the instructions in `program`
///
/// Stops at the first byte sequence that does not decode.
pub fn disassemble(program: &[u8]) -> impl Iterator<Item = (usize, Instruction)> + '_ {
    let mut offset = 0;
    core::iter::from_fn(move || {
        let (insn, len) = Instruction::decode(program.get(offset..)?)?;
        let at = offset;
        offset += len;
        Some((at, insn))
    })
}
