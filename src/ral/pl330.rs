//! PL330 register blocks and fields

use super::{RORegister, RWRegister, WORegister};

/// Maximum number of DMA channels implemented by any PL330
pub const MAX_CHANNELS: usize = 8;

macro_rules! fields {
    ($($name:ident: $offset:expr, $width:expr;)+) => {
        $(
            pub mod $name {
                pub const offset: u32 = $offset;
                pub const mask: u32 = (((1u64 << $width) - 1) << $offset) as u32;
                pub mod R {}
                pub mod W {}
                pub mod RW {}
            }
        )+
    };
}

/// PL330 registers, relative to the controller base address.
#[repr(C)]
pub struct RegisterBlock {
    /// DMA Manager Status Register
    pub DSR: RORegister<u32>,
    /// DMA Program Counter Register
    pub DPC: RORegister<u32>,
    _reserved0: [u32; 6],
    /// Interrupt Enable Register
    pub INTEN: RWRegister<u32>,
    /// Event-Interrupt Raw Status Register
    pub ES: RORegister<u32>,
    /// Interrupt Status Register
    pub INTMIS: RORegister<u32>,
    /// Interrupt Clear Register
    pub INTCLR: WORegister<u32>,
    /// Fault Status DMA Manager Register
    pub FSRD: RORegister<u32>,
    /// Fault Status DMA Channel Register
    pub FSRC: RORegister<u32>,
    /// Fault Type DMA Manager Register
    pub FTRD: RORegister<u32>,
    _reserved1: [u32; 1],
    /// Fault Type DMA Channel Registers
    pub FTR: [RORegister<u32>; MAX_CHANNELS],
    _reserved2: [u32; 40],
    /// Channel Status and Program Counter Registers
    pub CS: [thread::StatusRegisters; MAX_CHANNELS],
    _reserved3: [u32; 176],
    /// Channel address, control and loop counter registers
    pub CH: [thread::ChannelRegisters; MAX_CHANNELS],
    _reserved4: [u32; 512],
    /// Debug Status Register
    pub DBGSTATUS: RORegister<u32>,
    /// Debug Command Register
    pub DBGCMD: WORegister<u32>,
    /// Debug Instruction-0 Register
    pub DBGINST0: WORegister<u32>,
    /// Debug Instruction-1 Register
    pub DBGINST1: WORegister<u32>,
    _reserved5: [u32; 60],
    /// Configuration Register 0
    pub CR0: RORegister<u32>,
    /// Configuration Register 1
    pub CR1: RORegister<u32>,
    /// Configuration Register 2
    pub CR2: RORegister<u32>,
    /// Configuration Register 3
    pub CR3: RORegister<u32>,
    /// Configuration Register 4
    pub CR4: RORegister<u32>,
    /// DMA Configuration Register
    pub CRD: RORegister<u32>,
    _reserved6: [u32; 26],
    /// Watchdog Register
    pub WD: RWRegister<u32>,
    _reserved7: [u32; 87],
    /// Peripheral Identification Registers
    pub PERIPH_ID: [RORegister<u32>; 4],
    /// Component Identification Registers
    pub PCELL_ID: [RORegister<u32>; 4],
}

// Did I calculate my reservations correctly?
const _: () = assert!(core::mem::offset_of!(RegisterBlock, INTEN) == 0x020);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, FTR) == 0x040);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, CS) == 0x100);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, CH) == 0x400);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, DBGSTATUS) == 0xD00);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, CR0) == 0xE00);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, WD) == 0xE80);
const _: () = assert!(core::mem::offset_of!(RegisterBlock, PERIPH_ID) == 0xFE0);
const _: () = assert!(core::mem::size_of::<RegisterBlock>() == 0x1000);

pub mod DSR {
    fields! {
        STATUS: 0, 4;
        DNS: 9, 1;
    }
}

pub mod DBGSTATUS {
    fields! {
        BUSY: 0, 1;
    }
}

pub mod DBGINST0 {
    fields! {
        THREAD: 0, 1;
        CHANNEL: 8, 3;
        INSN_BYTE0: 16, 8;
        INSN_BYTE1: 24, 8;
    }
}

pub mod CR0 {
    fields! {
        PERIPH_REQ: 0, 1;
        NUM_CHNLS: 4, 3;
        NUM_PERIPH_REQ: 12, 5;
        NUM_EVENTS: 17, 5;
    }
}

pub mod CRD {
    fields! {
        DATA_WIDTH: 0, 3;
        DATA_BUFFER_DEP: 20, 10;
    }
}

/// Per-channel register clusters.
pub mod thread {
    use super::{RORegister, RWRegister};

    /// Channel status cluster, repeated at an 8 byte stride.
    #[repr(C)]
    pub struct StatusRegisters {
        /// Channel Status Register
        pub CSR: RORegister<u32>,
        /// Channel Program Counter Register
        pub CPC: RORegister<u32>,
    }

    /// Channel address cluster, repeated at a 32 byte stride.
    #[repr(C)]
    pub struct ChannelRegisters {
        /// Source Address Register
        pub SAR: RORegister<u32>,
        /// Destination Address Register
        pub DAR: RORegister<u32>,
        /// Channel Control Register
        pub CCR: RORegister<u32>,
        /// Loop Counter 0 Register
        pub LC0: RORegister<u32>,
        /// Loop Counter 1 Register
        pub LC1: RORegister<u32>,
        _reserved: [RWRegister<u32>; 3],
    }

    const _: () = assert!(core::mem::size_of::<StatusRegisters>() == 0x08);
    const _: () = assert!(core::mem::size_of::<ChannelRegisters>() == 0x20);

    pub mod CSR {
        fields! {
            STATUS: 0, 4;
        }
    }
}
