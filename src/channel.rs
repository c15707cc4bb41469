//! DMA channel

use crate::{
    config::MICROCODE_BYTES,
    error::Fault,
    interrupt::{Callback, NextPeriod, Owner, RegistrationId},
    program::{self, ControlWord, Direction, TransferSpec},
    ral::pl330,
    state::ChannelState,
    thread::Thread,
    Error, Result, SharedSlot,
};

use embedded_hal::delay::DelayNs;

/// A channel's slab of microcode memory
///
/// The CPU writes programs through `memory`; the controller fetches them from
/// `bus_address`.
pub(crate) struct Microcode {
    memory: &'static mut [u8],
    bus_address: u32,
}

impl Microcode {
    pub(crate) fn new(memory: &'static mut [u8], bus_address: u32) -> Self {
        debug_assert!(memory.len() >= MICROCODE_BYTES);
        Microcode {
            memory,
            bus_address,
        }
    }

    pub(crate) fn bus_address(&self) -> u32 {
        self.bus_address
    }
}

/// The one request a channel can have in flight
pub(crate) struct Request {
    pub(crate) microcode: Microcode,
    /// The transfer whose program is in `microcode`
    pub(crate) transfer: Option<TransferSpec>,
    /// `DMAGO` was issued, and the channel was not stopped since
    pub(crate) running: bool,
}

/// A snapshot of a channel's program counter and address registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThreadRegisters {
    /// Bus address of the next instruction
    pub program_counter: u32,
    /// Current source address
    pub source: u32,
    /// Current destination address
    pub destination: u32,
}

/// A DMA channel
///
/// Allocate channels from a [`Pl330`](crate::Pl330) controller. A channel owns
/// its microcode slab and its single request, so only the channel's holder can
/// program, start, or stop it. Return it with [`Pl330::release`](crate::Pl330::release)
/// when you're done; dropping a channel leaves it allocated.
pub struct Channel {
    /// Our channel number, expected to be between [0, CHANNELS)
    pub(crate) index: usize,
    pub(crate) thread: Thread,
    pub(crate) request: Request,
    /// This channel's notification state
    pub(crate) slot: &'static SharedSlot,
    /// Control word for this controller's burst and access attributes
    pub(crate) control: ControlWord,
    /// Peripheral request interfaces on the controller
    pub(crate) peripherals: u8,
}

// It's OK to send a channel across an execution context.
// They can't be cloned or copied, so there's no chance of
// them being (mutably) shared.
unsafe impl Send for Channel {}

impl Channel {
    /// Returns the DMA channel number
    pub fn channel(&self) -> usize {
        self.index
    }

    /// Returns the event this channel signals after each period
    pub fn event(&self) -> u8 {
        self.index as u8
    }

    /// Returns the channel's hardware state
    pub fn state(&self) -> ChannelState {
        let cs = &self.thread.registers.CS[self.index];
        ChannelState::from_raw(crate::ral::read_reg!(pl330::thread, cs, CSR, STATUS))
    }

    /// Returns `true` if the channel was started and not stopped since
    ///
    /// A channel that faulted, and was killed by [`Pl330::on_interrupt`](crate::Pl330::on_interrupt),
    /// isn't running.
    pub fn is_running(&self) -> bool {
        self.request.running
            && !critical_section::with(|cs| self.slot.borrow_ref(cs).notifications.aborted())
    }

    /// Forget the running flag if the interrupt handler killed the channel
    fn sync_abort(&mut self) {
        let aborted = critical_section::with(|cs| {
            self.slot.borrow_ref_mut(cs).notifications.take_aborted()
        });
        if aborted {
            self.request.running = false;
        }
    }

    /// Returns the transfer last submitted to this channel
    pub fn transfer(&self) -> Option<&TransferSpec> {
        self.request.transfer.as_ref()
    }

    /// Read the channel's program counter, source and destination addresses
    pub fn registers(&self) -> ThreadRegisters {
        let regs = &self.thread.registers;
        ThreadRegisters {
            program_counter: regs.CS[self.index].CPC.read(),
            source: regs.CH[self.index].SAR.read(),
            destination: regs.CH[self.index].DAR.read(),
        }
    }

    /// Returns the channel's fault type if it's faulting
    pub fn fault(&self) -> Option<Fault> {
        self.thread.fault()
    }

    /// Program and start a cyclic transfer
    ///
    /// Moves `total_bytes / period_bytes` periods of `period_bytes` each from
    /// `source` to `destination`, then starts over at the same addresses. The
    /// channel signals its event after every period. Burst shape and access
    /// attributes come from the controller's [`Config`](crate::Config).
    ///
    /// The channel must be stopped. Stop a running channel before submitting a
    /// new transfer.
    ///
    /// # Safety
    ///
    /// This initiates a DMA transfer that uses `source` and `destination` until
    /// the channel is stopped. Caller must ensure that both are valid bus
    /// addresses for the lifetime of the transfer.
    pub unsafe fn submit_cyclic<D: DelayNs>(
        &mut self,
        direction: Direction,
        source: u32,
        destination: u32,
        total_bytes: u32,
        period_bytes: u32,
        delay: &mut D,
    ) -> Result<()> {
        self.sync_abort();
        if self.request.running || self.state() != ChannelState::Stopped {
            return Err(Error::Busy);
        }
        if let Some(peripheral) = direction.peripheral() {
            if peripheral >= self.peripherals {
                return Err(Error::InvalidTransfer);
            }
        }
        if period_bytes == 0 {
            return Err(Error::InvalidTransfer);
        }

        let transfer = TransferSpec {
            control: direction.control(self.control),
            direction,
            source,
            destination,
            period_bytes,
            periods: total_bytes / period_bytes,
        };

        self.request.transfer = None;
        let size = program::write(&transfer, self.event(), self.request.microcode.memory)?;
        self.request.transfer = Some(transfer);
        log_at!(
            self.thread.log_level,
            Debug,
            "channel {} programmed, {} bytes, {} periods of {} bytes",
            self.index,
            size,
            transfer.periods,
            transfer.period_bytes
        );

        self.start(delay)
    }

    /// Start the submitted transfer
    ///
    /// Recovers a faulting or stopping channel first. Starting a running channel
    /// does nothing.
    pub fn start<D: DelayNs>(&mut self, delay: &mut D) -> Result<()> {
        self.sync_abort();
        self.thread.start(&mut self.request, delay)
    }

    /// Stop the channel
    ///
    /// Issues a kill and masks the channel's interrupt, but doesn't wait for the
    /// channel to stop. Poll [`state`](Channel::state) if you need to know.
    pub fn stop<D: DelayNs>(&mut self, delay: &mut D) -> Result<()> {
        self.sync_abort();
        self.thread.stop(Some(&mut self.request), delay)
    }

    /// Call `callback` with `context` after every period
    ///
    /// When `owner` is supplied, the registration holds a reference on it until
    /// the registration is removed.
    pub fn register_notification(
        &mut self,
        callback: Callback,
        context: usize,
        owner: Option<&'static Owner>,
    ) -> Result<RegistrationId> {
        critical_section::with(|cs| {
            self.slot
                .borrow_ref_mut(cs)
                .notifications
                .register(cs, callback, context, owner)
        })
    }

    /// Remove a registration made by [`register_notification`](Channel::register_notification)
    pub fn unregister_notification(&mut self, id: RegistrationId) -> Result<()> {
        critical_section::with(|cs| {
            self.slot
                .borrow_ref_mut(cs)
                .notifications
                .unregister(cs, id)
        })
    }

    /// Resolves after the next period boundary is dispatched
    ///
    /// See [`Pl330::dispatch`](crate::Pl330::dispatch).
    pub fn next_period(&self) -> NextPeriod<'_> {
        NextPeriod::new(self)
    }
}
