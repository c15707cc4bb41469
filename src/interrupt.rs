//! DMA interrupt support
//!
//! Interrupt handling happens in two levels. [`Pl330::on_interrupt`] runs in
//! the controller's interrupt handler. It acknowledges events and records one
//! pending period per event. [`Pl330::dispatch`] runs wherever callbacks may
//! run. It invokes each channel's registered callbacks once per recorded
//! period, and wakes the channel's [`NextPeriod`] future.

use crate::{
    channel::{Channel, Microcode},
    error::Fault,
    ral::{self, pl330},
    state::{ChannelState, ThreadId},
    Error, Pl330, Result,
};
use core::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use critical_section::{CriticalSection, Mutex};
use heapless::Vec;

/// Most notifications a channel holds at once
pub const MAX_REGISTRATIONS: usize = 16;

/// A period notification
///
/// Called with the channel number and the context supplied at registration.
pub type Callback = fn(channel: usize, context: usize);

/// Identifies a registration on its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegistrationId(u32);

/// Tracks the registrations made on behalf of one client
///
/// Each registration naming an owner holds one reference until it's removed.
/// A client can drop all of its registrations, across every channel, with
/// [`Pl330::unregister_owner`].
pub struct Owner {
    references: Mutex<Cell<usize>>,
}

impl Owner {
    pub const fn new() -> Self {
        Owner {
            references: Mutex::new(Cell::new(0)),
        }
    }

    /// Returns the number of live registrations naming this owner
    pub fn references(&self) -> usize {
        critical_section::with(|cs| self.references.borrow(cs).get())
    }

    fn hold(&self, cs: CriticalSection<'_>) {
        let references = self.references.borrow(cs);
        references.set(references.get() + 1);
    }

    fn release(&self, cs: CriticalSection<'_>) {
        let references = self.references.borrow(cs);
        references.set(references.get().saturating_sub(1));
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Registration {
    id: RegistrationId,
    callback: Callback,
    context: usize,
    owner: Option<&'static Owner>,
}

impl Registration {
    fn is_owned_by(&self, owner: &Owner) -> bool {
        self.owner.is_some_and(|held| core::ptr::eq(held, owner))
    }
}

/// A channel's registrations, and the periods not yet dispatched
pub(crate) struct Notifications {
    registrations: Vec<Registration, MAX_REGISTRATIONS>,
    next_id: u32,
    /// Periods acknowledged, but not yet dispatched
    pending: u32,
    /// Periods dispatched, wrapping
    periods: u32,
    faulted: bool,
    /// The interrupt handler killed the channel
    aborted: bool,
    waker: Option<Waker>,
}

impl Notifications {
    const fn new() -> Self {
        Notifications {
            registrations: Vec::new(),
            next_id: 0,
            pending: 0,
            periods: 0,
            faulted: false,
            aborted: false,
            waker: None,
        }
    }

    pub(crate) fn aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn take_aborted(&mut self) -> bool {
        core::mem::take(&mut self.aborted)
    }

    pub(crate) fn register(
        &mut self,
        cs: CriticalSection<'_>,
        callback: Callback,
        context: usize,
        owner: Option<&'static Owner>,
    ) -> Result<RegistrationId> {
        let id = RegistrationId(self.next_id);
        self.registrations
            .push(Registration {
                id,
                callback,
                context,
                owner,
            })
            .map_err(|_| Error::ResourceExhausted)?;
        self.next_id = self.next_id.wrapping_add(1);
        if let Some(owner) = owner {
            owner.hold(cs);
        }
        Ok(id)
    }

    pub(crate) fn unregister(&mut self, cs: CriticalSection<'_>, id: RegistrationId) -> Result<()> {
        let position = self
            .registrations
            .iter()
            .position(|registration| registration.id == id)
            .ok_or(Error::NotRegistered)?;
        let registration = self.registrations.remove(position);
        if let Some(owner) = registration.owner {
            owner.release(cs);
        }
        Ok(())
    }

    fn unregister_owner(&mut self, cs: CriticalSection<'_>, owner: &Owner) -> usize {
        let before = self.registrations.len();
        self.registrations
            .retain(|registration| !registration.is_owned_by(owner));
        let removed = before - self.registrations.len();
        for _ in 0..removed {
            owner.release(cs);
        }
        removed
    }

    /// Drop every registration and forget undispatched periods
    pub(crate) fn clear(&mut self, cs: CriticalSection<'_>) {
        while let Some(registration) = self.registrations.pop() {
            if let Some(owner) = registration.owner {
                owner.release(cs);
            }
        }
        self.pending = 0;
        self.faulted = false;
        self.aborted = false;
        self.waker = None;
    }
}

/// Per-channel state shared between channel holders and interrupt handlers
pub(crate) struct Slot {
    /// The channel's microcode while the channel is free
    pub(crate) microcode: Option<Microcode>,
    pub(crate) notifications: Notifications,
}

pub(crate) type SharedSlot = Mutex<RefCell<Slot>>;
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const FREE_SLOT: SharedSlot = Mutex::new(RefCell::new(Slot {
    microcode: None,
    notifications: Notifications::new(),
}));

impl<const CHANNELS: usize> Pl330<CHANNELS> {
    /// Acknowledge the controller's interrupts
    ///
    /// Clears every raised, enabled event, and counts one pending period for
    /// each channel that signaled. Faults are logged, and wake the faulting
    /// channel's [`NextPeriod`] future on the next [`dispatch`](Pl330::dispatch).
    /// Returns `true` if there was anything to handle.
    ///
    /// A faulting channel is killed, and its event masked, so the abort line
    /// drops. The channel stops running; [`Channel::start`] restarts it. If
    /// the debug interface is busy, the kill is retried by the next
    /// `on_interrupt` or `dispatch`. A level-triggered abort line stays
    /// asserted until then, so mask it if you return from the handler first.
    ///
    /// Call `on_interrupt` from the interrupt handler for the DMA controller's
    /// event lines and abort line:
    ///
    /// ```no_run
    /// use pl330_dma::Pl330;
    ///
    /// static DMA: Pl330<8> = unsafe { Pl330::new(0xF800_3000 as *const ()) };
    ///
    /// // #[interrupt]
    /// fn DMAC() {
    ///     if DMA.on_interrupt() {
    ///         DMA.dispatch();
    ///     }
    /// }
    /// ```
    pub fn on_interrupt(&self) -> bool {
        let regs = &self.registers;
        let raised = regs.INTEN.read() & regs.ES.read();
        if raised != 0 {
            regs.INTCLR.write(raised);
        }
        let faults = regs.FSRC.read();
        let manager_fault = regs.FSRD.read() & 1 != 0;

        critical_section::with(|cs| {
            let controller = self.controller.borrow_ref(cs);
            let log_level = controller.config.log_level;
            if manager_fault {
                log_at!(log_level, Error, "manager fault: {}", Fault::new(regs.FTRD.read()));
            }
            for (channel, slot) in self.slots.iter().enumerate() {
                let mask = 1 << channel;
                if (raised | faults) & mask == 0 {
                    continue;
                }
                let mut slot = slot.borrow_ref_mut(cs);
                let notifications = &mut slot.notifications;
                if raised & mask != 0 {
                    notifications.pending = notifications.pending.saturating_add(1);
                }
                if faults & mask != 0 {
                    notifications.faulted = true;
                    let fault = Fault::new(regs.FTR[channel].read());
                    log_at!(log_level, Error, "channel {} fault: {}", channel, fault);
                    if !notifications.aborted {
                        let thread = controller.thread(self.registers, ThreadId::Channel(channel as u8));
                        notifications.aborted = thread.abort();
                        if !notifications.aborted {
                            log_at!(log_level, Warn, "channel {} kill deferred, debug interface busy", channel);
                        }
                    }
                }
            }
        });

        raised != 0 || faults != 0 || manager_fault
    }

    /// Deliver the periods recorded by [`on_interrupt`](Pl330::on_interrupt)
    ///
    /// For every pending period, in order, calls each of the channel's callbacks
    /// in registration order. Callbacks run outside of any critical section.
    pub fn dispatch(&self) {
        for (channel, slot) in self.slots.iter().enumerate() {
            let (pending, registrations, waker) = critical_section::with(|cs| {
                let mut slot = slot.borrow_ref_mut(cs);
                let notifications = &mut slot.notifications;
                let pending = core::mem::take(&mut notifications.pending);
                let faulted = core::mem::take(&mut notifications.faulted);
                if faulted
                    && !notifications.aborted
                    && self.registers.FSRC.read() & (1 << channel) != 0
                {
                    let controller = self.controller.borrow_ref(cs);
                    let thread = controller.thread(self.registers, ThreadId::Channel(channel as u8));
                    notifications.aborted = thread.abort();
                }
                if pending == 0 && !faulted {
                    return (0, Vec::new(), None);
                }
                notifications.periods = notifications.periods.wrapping_add(pending);
                let registrations = if pending != 0 {
                    notifications.registrations.clone()
                } else {
                    Vec::new()
                };
                (pending, registrations, notifications.waker.take())
            });

            for _ in 0..pending {
                for registration in &registrations {
                    (registration.callback)(channel, registration.context);
                }
            }
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Remove every registration naming `owner`, on every channel
    ///
    /// Returns the number of registrations removed.
    pub fn unregister_owner(&self, owner: &Owner) -> usize {
        critical_section::with(|cs| {
            self.slots
                .iter()
                .map(|slot| {
                    slot.borrow_ref_mut(cs)
                        .notifications
                        .unregister_owner(cs, owner)
                })
                .sum()
        })
    }

    /// Returns the fault type of the manager thread, if it's faulting
    pub fn manager_fault(&self) -> Option<Fault> {
        let faulting = ral::read_reg!(pl330, self.registers, DSR, STATUS == 0xF);
        faulting.then(|| Fault::new(self.registers.FTRD.read()))
    }
}

/// Resolves once a channel finishes another period
///
/// Created by [`Channel::next_period`]. The future counts periods delivered by
/// [`Pl330::dispatch`] from the moment it's created, so a period dispatched
/// before the first poll still resolves it. It fails if the channel isn't
/// running, or is faulting.
pub struct NextPeriod<'a> {
    channel: &'a Channel,
    periods: u32,
}

impl<'a> NextPeriod<'a> {
    pub(crate) fn new(channel: &'a Channel) -> Self {
        let periods =
            critical_section::with(|cs| channel.slot.borrow_ref(cs).notifications.periods);
        NextPeriod { channel, periods }
    }
}

impl Future for NextPeriod<'_> {
    type Output = Result<()>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        critical_section::with(|cs| {
            let mut slot = self.channel.slot.borrow_ref_mut(cs);
            let notifications = &mut slot.notifications;
            if notifications.periods != self.periods {
                return Poll::Ready(Ok(()));
            }
            let state = self.channel.state();
            let running = self.channel.request.running && !notifications.aborted;
            if !running
                || matches!(
                    state,
                    ChannelState::Faulting | ChannelState::FaultCompleting
                )
            {
                return Poll::Ready(Err(Error::UnsupportedState(state)));
            }
            notifications.waker = Some(cx.waker().clone());
            Poll::Pending
        })
    }
}
