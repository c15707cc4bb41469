//! Cyclic DMA driver for the ARM PrimeCell PL330 DMA controller
//!
//! `pl330-dma` streams audio-style ring buffers between memory and
//! peripheral FIFOs. It provides
//!
//! - an encoder for the PL330 instruction set, and a decoder for inspecting
//!   programs
//! - a program builder that turns a cyclic transfer into a looping microcode
//!   program, signaling an event after each period
//! - channel allocation and a start/stop state machine driven through the
//!   controller's debug interface
//! - a two level interrupt path that turns channel events into period
//!   notifications, and a [`NextPeriod`] future
//!
//! The driver doesn't own the DMA-visible memory. You provide one region of
//! microcode memory, at least [`MICROCODE_BYTES`] per channel, and its bus
//! address. You also supply a [`DelayNs`](embedded_hal::delay::DelayNs)
//! implementation for the driver's bounded waits.
//!
//! ```no_run
//! use pl330_dma::{Config, Direction, Pl330};
//! # struct Delay;
//! # impl embedded_hal::delay::DelayNs for Delay { fn delay_ns(&mut self, _: u32) {} }
//!
//! static DMA: Pl330<8> = unsafe { Pl330::new(0xF800_3000 as *const ()) };
//! # fn microcode() -> &'static mut [u8] { unimplemented!() }
//! # fn microcode_bus_address() -> u32 { 0 }
//!
//! fn on_period(channel: usize, context: usize) {
//!     // Refill the half of the ring that was just played
//! }
//!
//! DMA.init(microcode(), microcode_bus_address(), Config::new()).unwrap();
//! let mut channel = DMA.channel(None).unwrap();
//! channel.register_notification(on_period, 0, None).unwrap();
//!
//! // Safety: the ring buffer and the FIFO outlive the transfer.
//! unsafe {
//!     channel.submit_cyclic(
//!         Direction::MemoryToPeripheral { peripheral: 3 },
//!         0x2000_0000,
//!         0xE000_1030,
//!         4096,
//!         1024,
//!         &mut Delay,
//!     )
//! }
//! .unwrap();
//! ```
//!
//! ### License
//!
//! Licensed under either of
//!
//! - [Apache License, Version 2.0](http://www.apache.org/licenses/LICENSE-2.0) ([LICENSE-APACHE](./LICENSE-APACHE))
//! - [MIT License](http://opensource.org/licenses/MIT) ([LICENSE-MIT](./LICENSE-MIT))
//!
//! at your option.
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![cfg_attr(not(test), no_std)]

/// Log at `$level` if the driver's `$filter` allows it
macro_rules! log_at {
    ($filter:expr, $level:ident, $($arg:tt)+) => {
        if log::Level::$level <= $filter {
            log::log!(target: "pl330", log::Level::$level, $($arg)+);
        }
    };
}

mod channel;
mod config;
mod error;
pub mod instruction;
mod interrupt;
pub mod program;
mod ral;
pub mod state;
#[cfg(test)]
mod testing;
mod thread;

pub use channel::{Channel, ThreadRegisters};
pub use config::{Config, DeviceConfig, DEBUG_TIMEOUT_US, MICROCODE_BYTES};
pub use error::{Error, Fault};
pub use interrupt::{Callback, NextPeriod, Owner, RegistrationId, MAX_REGISTRATIONS};
pub use program::{ControlWord, Direction, TransferSpec};
pub use state::{ChannelState, ManagerState};

use crate::{
    channel::{Microcode, Request},
    interrupt::{SharedSlot, FREE_SLOT},
    ral::{pl330, Static},
    state::{ThreadId, ThreadState},
    thread::Thread,
};
use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::delay::DelayNs;

/// A DMA result
pub type Result<T> = core::result::Result<T, Error>;

/// Controller-wide state, established by [`Pl330::init`]
struct Controller {
    device: Option<DeviceConfig>,
    config: Config,
    /// Channels usable on this controller
    available: usize,
    /// The microcode region, as address and length
    region: Option<(usize, usize)>,
}

impl Controller {
    const fn new() -> Self {
        Controller {
            device: None,
            config: Config::new(),
            available: 0,
            region: None,
        }
    }

    fn thread(&self, registers: Static<pl330::RegisterBlock>, id: ThreadId) -> Thread {
        Thread {
            id,
            event: match id {
                ThreadId::Channel(channel) => Some(channel),
                ThreadId::Manager => None,
            },
            registers,
            nonsecure: self.device.is_some_and(|device| device.nonsecure),
            log_level: self.config.log_level,
        }
    }
}

/// A PL330 DMA controller
///
/// `CHANNELS` is the number of channels the driver manages, at most eight. The
/// driver uses fewer if the controller has fewer channels or events. Channel
/// `n` signals event `n`.
///
/// `Pl330` is designed to be a `static`, shared by the code that allocates
/// channels and the DMA interrupt handler.
pub struct Pl330<const CHANNELS: usize> {
    registers: Static<pl330::RegisterBlock>,
    controller: Mutex<RefCell<Controller>>,
    slots: [SharedSlot; CHANNELS],
}

// Safety: registers are accessed with single reads and writes, or within
// critical sections. All other state is behind critical section mutexes.
unsafe impl<const CHANNELS: usize> Sync for Pl330<CHANNELS> {}

impl<const CHANNELS: usize> Pl330<CHANNELS> {
    /// Create a driver for the controller at `registers`
    ///
    /// The driver is unusable until [`init`](Pl330::init).
    ///
    /// # Safety
    ///
    /// `registers` must point at the PL330's register block. Only one `Pl330`
    /// should exist for each controller.
    ///
    /// # Panics
    ///
    /// Panics if `CHANNELS` is greater than eight. In a `static`, this fails
    /// to compile.
    pub const unsafe fn new(registers: *const ()) -> Self {
        assert!(CHANNELS <= pl330::MAX_CHANNELS);
        Pl330 {
            registers: Static(registers.cast()),
            controller: Mutex::new(RefCell::new(Controller::new())),
            slots: [FREE_SLOT; CHANNELS],
        }
    }

    /// Read the controller configuration, and divide `microcode` among the
    /// channels
    ///
    /// `bus_address` is the address at which the controller sees the start of
    /// `microcode`. Channel `n` uses the [`MICROCODE_BYTES`] bytes at offset
    /// `n * MICROCODE_BYTES`.
    ///
    /// Fails if the controller is already initialized, if the burst shape in
    /// `config` doesn't suit the controller's bus, or if `microcode` is too
    /// small for every usable channel.
    pub fn init(
        &self,
        microcode: &'static mut [u8],
        bus_address: u32,
        config: Config,
    ) -> Result<DeviceConfig> {
        let device = DeviceConfig::read(&self.registers);
        if !config.is_supported_by(&device) {
            log_at!(
                config.log_level,
                Error,
                "burst of {} x {} bytes unsupported on a {} bit bus",
                config.burst_length,
                config.burst_size,
                device.data_bus_width
            );
            return Err(Error::InvalidTransfer);
        }
        let available = CHANNELS
            .min(device.channels.into())
            .min(device.events.into());
        if microcode.len() < available * MICROCODE_BYTES {
            return Err(Error::ResourceExhausted);
        }

        critical_section::with(|cs| {
            let mut controller = self.controller.borrow_ref_mut(cs);
            if controller.device.is_some() {
                return Err(Error::Busy);
            }

            controller.region = Some((microcode.as_mut_ptr() as usize, microcode.len()));
            let mut rest = microcode;
            for (index, slot) in self.slots.iter().take(available).enumerate() {
                let (slab, tail) = core::mem::take(&mut rest).split_at_mut(MICROCODE_BYTES);
                rest = tail;
                let address = bus_address + (index * MICROCODE_BYTES) as u32;
                let mut slot = slot.borrow_ref_mut(cs);
                slot.microcode = Some(Microcode::new(slab, address));
                slot.notifications.clear(cs);
            }
            controller.device = Some(device);
            controller.config = config;
            controller.available = available;
            Ok(())
        })?;

        log_at!(
            config.log_level,
            Info,
            "PL330 {:#010X}: {} channels, {} peripherals, {} events, using {} channels",
            device.peripheral_id,
            device.channels,
            device.peripherals,
            device.events,
            available
        );
        Ok(device)
    }

    /// Returns the controller configuration read by [`init`](Pl330::init)
    pub fn device(&self) -> Option<DeviceConfig> {
        critical_section::with(|cs| self.controller.borrow_ref(cs).device)
    }

    /// Allocate a channel
    ///
    /// With `Some(index)`, allocate that channel. Otherwise, allocate the lowest
    /// numbered free channel.
    pub fn channel(&'static self, index: Option<usize>) -> Result<Channel> {
        critical_section::with(|cs| {
            let controller = self.controller.borrow_ref(cs);
            let device = controller.device.ok_or(Error::NotInitialized)?;
            let candidates = match index {
                Some(index) if index < controller.available => index..index + 1,
                Some(_) => return Err(Error::InvalidHandle),
                None => 0..controller.available,
            };

            for index in candidates {
                let slot = &self.slots[index];
                let Some(microcode) = slot.borrow_ref_mut(cs).microcode.take() else {
                    continue;
                };
                return Ok(Channel {
                    index,
                    thread: controller.thread(self.registers, ThreadId::Channel(index as u8)),
                    request: Request {
                        microcode,
                        transfer: None,
                        running: false,
                    },
                    slot,
                    control: controller.config.control(),
                    peripherals: device.peripherals,
                });
            }
            Err(Error::ResourceExhausted)
        })
    }

    /// Return a channel to the controller
    ///
    /// The channel's notifications are removed. Fails, handing back the channel,
    /// if it's still running or if it came from another controller.
    pub fn release(&self, channel: Channel) -> core::result::Result<(), (Error, Channel)> {
        let ours = self
            .slots
            .get(channel.index)
            .is_some_and(|slot| core::ptr::eq(slot, channel.slot));
        if !ours {
            return Err((Error::InvalidHandle, channel));
        }
        if channel.is_running() {
            return Err((Error::Busy, channel));
        }

        let Channel { index, request, .. } = channel;
        critical_section::with(|cs| {
            let mut slot = self.slots[index].borrow_ref_mut(cs);
            slot.notifications.clear(cs);
            slot.microcode = Some(request.microcode);
        });
        Ok(())
    }

    fn manager(&self) -> Thread {
        critical_section::with(|cs| {
            self.controller
                .borrow_ref(cs)
                .thread(self.registers, ThreadId::Manager)
        })
    }

    /// Returns the manager thread's state
    pub fn manager_state(&self) -> ManagerState {
        match self.manager().state() {
            ThreadState::Manager(state) => state,
            ThreadState::Channel(_) => ManagerState::Invalid,
        }
    }

    /// Kill the manager thread, unless it's already stopped
    pub fn stop_manager<D: DelayNs>(&self, delay: &mut D) -> Result<()> {
        self.manager().stop(None, delay)
    }

    /// Give the microcode region back
    ///
    /// Every channel must be released first. Afterwards, the driver must be
    /// initialized again before use.
    pub fn deinit(&self) -> Result<&'static mut [u8]> {
        critical_section::with(|cs| {
            let mut controller = self.controller.borrow_ref_mut(cs);
            if controller.device.is_none() {
                return Err(Error::NotInitialized);
            }
            let allocated = self.slots[..controller.available]
                .iter()
                .any(|slot| slot.borrow_ref(cs).microcode.is_none());
            if allocated {
                return Err(Error::Busy);
            }

            let mask = (1u32 << controller.available) - 1;
            ral::modify_reg!(pl330, self.registers, INTEN, |inten| inten & !mask);
            for slot in &self.slots {
                let mut slot = slot.borrow_ref_mut(cs);
                slot.microcode = None;
                slot.notifications.clear(cs);
            }
            controller.device = None;
            controller.available = 0;
            let (address, len) = controller.region.take().ok_or(Error::NotInitialized)?;
            // Safety: the region came from init as a 'static mut slice. Every
            // slab carved from it was just dropped.
            Ok(unsafe { core::slice::from_raw_parts_mut(address as *mut u8, len) })
        })
    }
}

use core::{future::Future, pin::Pin, task::Poll};

/// Poll a future with a dummy waker.
///
/// Use `poll_no_wake` when you want to check on a future, like
/// [`NextPeriod`], without an executor. You may use it from a loop that
/// also calls [`Pl330::dispatch`].
pub fn poll_no_wake<F>(future: Pin<&mut F>) -> Poll<F::Output>
where
    F: Future,
{
    use core::task::{Context, RawWaker, RawWakerVTable, Waker};
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW_WAKER, |_| {}, |_| {}, |_| {});

    const RAW_WAKER: RawWaker = RawWaker::new(core::ptr::null(), &VTABLE);
    // Safety: raw waker meets documented requirements.
    let waker = unsafe { Waker::from_raw(RAW_WAKER) };
    let mut context = Context::from_waker(&waker);
    future.poll(&mut context)
}

/// Block until the future returns a result.
///
/// `block` invokes [`poll_no_wake`] in a loop until the future
/// returns a result. Something else must call [`Pl330::dispatch`]
/// for a [`NextPeriod`] future to make progress.
pub fn block<F>(mut future: Pin<&mut F>) -> F::Output
where
    F: Future,
{
    loop {
        match poll_no_wake(future.as_mut()) {
            Poll::Ready(result) => return result,
            Poll::Pending => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{microcode, offset, CountingDelay, FakeRegisters};
    use crate::{Config, Direction, Error, ManagerState, Owner, Pl330};
    use std::boxed::Box;

    fn uninitialized(fake: &'static FakeRegisters) -> &'static Pl330<4> {
        Box::leak(Box::new(unsafe { Pl330::<4>::new(fake.as_ptr()) }))
    }

    fn ignore(_: usize, _: usize) {}

    #[test]
    fn channels_require_init() {
        let dma = uninitialized(FakeRegisters::with_channels(4, 4));
        assert!(matches!(dma.channel(None), Err(Error::NotInitialized)));
        assert_eq!(dma.deinit(), Err(Error::NotInitialized));
    }

    #[test]
    fn init_rejects_a_small_region_and_a_second_init() {
        let dma = uninitialized(FakeRegisters::with_channels(4, 4));
        assert_eq!(
            dma.init(microcode(3 * 256), 0, Config::new()),
            Err(Error::ResourceExhausted)
        );
        assert!(dma.init(microcode(4 * 256), 0, Config::new()).is_ok());
        assert_eq!(
            dma.init(microcode(4 * 256), 0, Config::new()),
            Err(Error::Busy)
        );
    }

    #[test]
    fn init_rejects_bursts_wider_than_the_bus() {
        let dma = uninitialized(FakeRegisters::with_channels(4, 4));
        assert_eq!(
            dma.init(microcode(4 * 256), 0, Config::new().burst(8, 4)),
            Err(Error::InvalidTransfer)
        );
    }

    #[test]
    fn usable_channels_are_limited_by_events() {
        let dma = uninitialized(FakeRegisters::with_channels(8, 2));
        let device = dma.init(microcode(2 * 256), 0, Config::new()).unwrap();
        assert_eq!(device.channels, 8);
        assert_eq!(device.events, 2);

        let first = dma.channel(None).unwrap();
        let second = dma.channel(None).unwrap();
        assert_eq!((first.channel(), second.channel()), (0, 1));
        assert!(matches!(dma.channel(None), Err(Error::ResourceExhausted)));
        assert!(matches!(dma.channel(Some(2)), Err(Error::InvalidHandle)));
    }

    #[test]
    fn allocate_by_index_and_release() {
        let dma = uninitialized(FakeRegisters::with_channels(4, 4));
        dma.init(microcode(4 * 256), 0, Config::new()).unwrap();

        let third = dma.channel(Some(2)).unwrap();
        assert!(matches!(dma.channel(Some(2)), Err(Error::ResourceExhausted)));
        let lowest = dma.channel(None).unwrap();
        assert_eq!(lowest.channel(), 0);

        assert!(dma.release(third).is_ok());
        assert_eq!(dma.channel(Some(2)).unwrap().channel(), 2);
    }

    #[test]
    fn refused_release_stays_small() {
        assert!(core::mem::size_of::<(Error, crate::Channel)>() < 128);
    }

    #[test]
    fn release_refuses_running_and_foreign_channels() {
        static OWNER: Owner = Owner::new();

        let fake = FakeRegisters::with_channels(4, 4);
        let dma = uninitialized(fake);
        dma.init(microcode(4 * 256), 0, Config::new()).unwrap();
        let other = uninitialized(FakeRegisters::with_channels(4, 4));
        other.init(microcode(4 * 256), 0, Config::new()).unwrap();

        let foreign = other.channel(Some(1)).unwrap();
        let Err((error, foreign)) = dma.release(foreign) else {
            panic!("released a foreign channel");
        };
        assert_eq!(error, Error::InvalidHandle);
        assert!(other.release(foreign).is_ok());

        let mut channel = dma.channel(Some(1)).unwrap();
        channel
            .register_notification(ignore, 0, Some(&OWNER))
            .unwrap();
        let mut delay = CountingDelay::default();
        unsafe {
            channel.submit_cyclic(Direction::MemoryToMemory, 0x100, 0x900, 512, 128, &mut delay)
        }
        .unwrap();
        let Err((error, mut channel)) = dma.release(channel) else {
            panic!("released a running channel");
        };
        assert_eq!(error, Error::Busy);

        channel.stop(&mut delay).unwrap();
        assert!(dma.release(channel).is_ok());
        assert_eq!(OWNER.references(), 0);
    }

    #[test]
    fn deinit_returns_the_region() {
        let fake = FakeRegisters::with_channels(4, 4);
        let dma = uninitialized(fake);
        let region = microcode(4 * 256);
        let address = region.as_ptr();
        dma.init(region, 0, Config::new()).unwrap();

        let channel = dma.channel(None).unwrap();
        assert_eq!(dma.deinit(), Err(Error::Busy));
        assert!(dma.release(channel).is_ok());

        fake.set(offset::INTEN, 0x1F);
        let region = dma.deinit().unwrap();
        assert_eq!((region.as_ptr(), region.len()), (address, 4 * 256));
        assert_eq!(fake.get(offset::INTEN), 0x10);
        assert!(matches!(dma.channel(None), Err(Error::NotInitialized)));

        assert!(dma.init(region, 0, Config::new()).is_ok());
    }

    #[test]
    fn manager_state_and_stop() {
        let fake = FakeRegisters::with_channels(4, 4);
        let dma = uninitialized(fake);
        dma.init(microcode(4 * 256), 0, Config::new()).unwrap();
        let mut delay = CountingDelay::default();

        assert_eq!(dma.manager_state(), ManagerState::Stopped);
        dma.stop_manager(&mut delay).unwrap();
        assert_eq!(fake.get(offset::DBGCMD), crate::testing::UNWRITTEN);

        fake.set(offset::DSR, 0x4);
        assert_eq!(dma.manager_state(), ManagerState::WaitingForEvent);
        dma.stop_manager(&mut delay).unwrap();
        assert_eq!(fake.get(offset::DBGINST0), 0x01 << 16);
        assert_eq!(fake.get(offset::DBGCMD), 0);
    }
}
