//! DMA errors and fault status

use crate::state::ChannelState;
use core::fmt::{self, Debug, Display};

/// Errors returned by the PL330 driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No free channel, a full notification table, or a microcode region that
    /// cannot hold every channel's program
    ResourceExhausted,
    /// The channel is out of range, or it belongs to another controller
    InvalidHandle,
    /// The controller stayed busy, or a thread never reached the expected
    /// state, within the bounded wait
    Timeout,
    /// The channel is in a state that the operation cannot start from
    UnsupportedState(ChannelState),
    /// The channel is still running, or not yet stopped
    Busy,
    /// The transfer cannot be expressed on this controller
    InvalidTransfer,
    /// The program does not fit the microcode slab, or a loop spans more
    /// than a backwards jump can reach
    ProgramTooLarge,
    /// The controller has not been initialized
    NotInitialized,
    /// The registration does not exist on this channel
    NotRegistered,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => f.write_str("insufficient DMA resources"),
            Error::InvalidHandle => f.write_str("invalid DMA channel handle"),
            Error::Timeout => f.write_str("timed out waiting on the DMA controller"),
            Error::UnsupportedState(state) => {
                write!(f, "cannot start a DMA channel in state {state:?}")
            }
            Error::Busy => f.write_str("DMA channel is running"),
            Error::InvalidTransfer => f.write_str("invalid DMA transfer"),
            Error::ProgramTooLarge => f.write_str("DMA program too large"),
            Error::NotInitialized => f.write_str("DMA controller not initialized"),
            Error::NotRegistered => f.write_str("no such DMA notification"),
        }
    }
}

/// A wrapper around a PL330 fault type value
///
/// The wrapper contains a copy of a thread's fault type register (`FTR` for
/// channels, `FTRD` for the manager) at the point of a fault. It may be printed
/// to understand why the thread faulted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// The raw fault type
    ftr: u32,
}

impl Fault {
    pub(crate) const fn new(ftr: u32) -> Self {
        Fault { ftr }
    }
    /// Returns the raw fault type value
    pub const fn raw(self) -> u32 {
        self.ftr
    }
}

impl Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DMA_FTR({:#010X})", self.ftr)
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,
             "DMA_FTR: LOCKUP {lockup} DBG {dbg} DATA_READ {dr} DATA_WRITE {dw} INSTR_FETCH {fetch} ST_DATA {st} MFIFO {mfifo} RDWR {rdwr} PERIPH {periph} EVENT {event} OPERAND {operand} UNDEF {undef}",
             lockup = (self.ftr >> 31) & 0x1,
             dbg = (self.ftr >> 30) & 0x1,
             dr = (self.ftr >> 18) & 0x1,
             dw = (self.ftr >> 17) & 0x1,
             fetch = (self.ftr >> 16) & 0x1,
             st = (self.ftr >> 13) & 0x1,
             mfifo = (self.ftr >> 12) & 0x1,
             rdwr = (self.ftr >> 7) & 0x1,
             periph = (self.ftr >> 6) & 0x1,
             event = (self.ftr >> 5) & 0x1,
             operand = (self.ftr >> 1) & 0x1,
             undef = self.ftr & 0x1,
         )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Fault {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DMA_FTR({=u32:#010X})", self.ftr)
    }
}
