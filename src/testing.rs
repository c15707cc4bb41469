//! Test doubles: plain memory behind the register layout, and a counting delay

use crate::ral::pl330::RegisterBlock;
use core::cell::UnsafeCell;
use std::boxed::Box;

/// Register offsets used by tests
pub mod offset {
    pub const DSR: usize = 0x000;
    pub const INTEN: usize = 0x020;
    pub const ES: usize = 0x024;
    pub const INTCLR: usize = 0x02C;
    pub const FSRD: usize = 0x030;
    pub const FSRC: usize = 0x034;
    pub const FTRD: usize = 0x038;
    pub const DBGSTATUS: usize = 0xD00;
    pub const DBGCMD: usize = 0xD04;
    pub const DBGINST0: usize = 0xD08;
    pub const DBGINST1: usize = 0xD0C;
    pub const CR0: usize = 0xE00;
    pub const CRD: usize = 0xE14;

    pub const fn ftr(channel: usize) -> usize {
        0x040 + channel * 4
    }
    pub const fn csr(channel: usize) -> usize {
        0x100 + channel * 8
    }
    pub const fn cpc(channel: usize) -> usize {
        0x104 + channel * 8
    }
    pub const fn sar(channel: usize) -> usize {
        0x400 + channel * 0x20
    }
    pub const fn dar(channel: usize) -> usize {
        0x404 + channel * 0x20
    }
}

/// Sentinel left in write-only registers to detect writes
pub const UNWRITTEN: u32 = 0xDEAD_BEEF;

/// A register file that is only memory
///
/// Hardware never changes a value on its own, so tests set status registers
/// to the state they want the driver to observe.
#[repr(C, align(4096))]
pub struct FakeRegisters([UnsafeCell<u32>; 1024]);

impl FakeRegisters {
    pub fn new() -> Box<Self> {
        let fake = Box::new(FakeRegisters(core::array::from_fn(|_| UnsafeCell::new(0))));
        for reg in [
            offset::INTCLR,
            offset::DBGCMD,
            offset::DBGINST0,
            offset::DBGINST1,
        ] {
            fake.set(reg, UNWRITTEN);
        }
        fake
    }

    /// A fake with `channels` channels, `events` events, 32 peripherals and a 32-bit bus
    pub fn with_channels(channels: u32, events: u32) -> &'static Self {
        let fake = Box::leak(Self::new());
        fake.set(
            offset::CR0,
            (channels - 1) << 4 | 31 << 12 | (events - 1) << 17 | 1,
        );
        fake.set(offset::CRD, 2 | 7 << 20);
        fake
    }

    pub fn set(&self, offset: usize, value: u32) {
        // Safety: in bounds, aligned, and tests are single threaded per fake.
        unsafe { core::ptr::write_volatile(self.0[offset / 4].get(), value) }
    }

    pub fn get(&self, offset: usize) -> u32 {
        // Safety: see set.
        unsafe { core::ptr::read_volatile(self.0[offset / 4].get()) }
    }

    pub fn registers(&self) -> &RegisterBlock {
        // Safety: same size, every register is a u32 cell.
        unsafe { &*self.as_ptr().cast() }
    }

    pub fn as_ptr(&self) -> *const () {
        (self as *const Self).cast()
    }
}

// Safety: tests access a fake from one thread at a time.
unsafe impl Sync for FakeRegisters {}

/// Delay that returns immediately, and counts requested microseconds
#[derive(Default)]
pub struct CountingDelay {
    pub ns: u64,
}

impl embedded_hal::delay::DelayNs for CountingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.ns += u64::from(ns);
    }
}

/// Leak a zeroed microcode region of `len` bytes
pub fn microcode(len: usize) -> &'static mut [u8] {
    Box::leak(std::vec![0u8; len].into_boxed_slice())
}

/// Delay that runs `script` with the number of delays so far, letting tests
/// change registers while the driver waits
pub struct ScriptedDelay<F: FnMut(u32)> {
    pub calls: u32,
    script: F,
}

impl<F: FnMut(u32)> ScriptedDelay<F> {
    pub fn new(script: F) -> Self {
        ScriptedDelay { calls: 0, script }
    }
}

impl<F: FnMut(u32)> embedded_hal::delay::DelayNs for ScriptedDelay<F> {
    fn delay_ns(&mut self, _: u32) {
        self.calls += 1;
        (self.script)(self.calls);
    }
}
