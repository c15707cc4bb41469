//! Thread control through the debug interface
//!
//! Software drives a PL330 thread by injecting single instructions through the
//! debug registers: `DMAGO` (issued by the manager) starts a channel at its
//! program, and `DMAKILL` stops a thread. Every injected instruction waits for
//! the debug interface to go idle, bounded by [`DEBUG_TIMEOUT_US`].

use crate::{
    channel::Request,
    config::DEBUG_TIMEOUT_US,
    error::Fault,
    instruction::{Instruction, MAX_INSTRUCTION_LEN},
    ral::{self, pl330, Static},
    state::{ChannelState, ThreadId, ThreadState},
    Error, Result,
};

use core::sync::atomic;
use embedded_hal::delay::DelayNs;
use log::LevelFilter;

/// A view of one PL330 thread
#[derive(Clone, Copy)]
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    /// Event signalled by the thread's program, and its interrupt line
    pub(crate) event: Option<u8>,
    pub(crate) registers: Static<pl330::RegisterBlock>,
    /// Issue `DMAGO` in the non-secure state
    pub(crate) nonsecure: bool,
    pub(crate) log_level: LevelFilter,
}

impl Thread {
    /// Read and map the thread's status field
    pub(crate) fn state(&self) -> ThreadState {
        let raw = match self.id {
            ThreadId::Manager => ral::read_reg!(pl330, self.registers, DSR, STATUS),
            ThreadId::Channel(n) => {
                let cs = &self.registers.CS[usize::from(n)];
                ral::read_reg!(pl330::thread, cs, CSR, STATUS)
            }
        };
        ThreadState::decode(self.id, raw)
    }

    fn channel_state(&self) -> ChannelState {
        match self.state() {
            ThreadState::Channel(state) => state,
            ThreadState::Manager(_) => ChannelState::Invalid,
        }
    }

    /// The thread's fault type, if it is faulting
    pub(crate) fn fault(&self) -> Option<Fault> {
        if !self.state().is_faulting() {
            return None;
        }
        let ftr = match self.id {
            ThreadId::Manager => self.registers.FTRD.read(),
            ThreadId::Channel(n) => self.registers.FTR[usize::from(n)].read(),
        };
        Some(Fault::new(ftr))
    }

    /// Busy-wait until `done` holds, bounded by the debug timeout
    fn wait<D, F>(&self, delay: &mut D, mut done: F) -> Result<()>
    where
        D: DelayNs,
        F: FnMut() -> bool,
    {
        for _ in 0..DEBUG_TIMEOUT_US {
            if done() {
                return Ok(());
            }
            delay.delay_us(1);
        }
        if done() {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Wait until the channel reports a state accepted by `accept`
    fn until<D, F>(&self, delay: &mut D, accept: F) -> Result<ChannelState>
    where
        D: DelayNs,
        F: Fn(ChannelState) -> bool,
    {
        let mut state = self.channel_state();
        self.wait(delay, || {
            state = self.channel_state();
            accept(state)
        })
        .inspect_err(|_| {
            log_at!(
                self.log_level,
                Error,
                "{:?} stuck in {:?}",
                self.id,
                state
            );
        })?;
        Ok(state)
    }

    /// Inject `insn` through the debug interface
    ///
    /// `as_manager` addresses the instruction to the manager thread instead of
    /// this thread. The instruction is not issued if the interface stays busy.
    fn execute<D: DelayNs>(&self, insn: Instruction, as_manager: bool, delay: &mut D) -> Result<()> {
        let regs = self.registers;
        self.wait(delay, || {
            !ral::read_reg!(pl330, regs, DBGSTATUS, BUSY == 1)
        })
        .inspect_err(|_| {
            log_at!(
                self.log_level,
                Error,
                "debug interface busy, dropped {:?} for {:?}",
                insn,
                self.id
            );
        })?;

        self.issue(insn, as_manager);
        Ok(())
    }

    /// Write `insn` to the debug registers and latch it
    fn issue(&self, insn: Instruction, as_manager: bool) {
        let regs = self.registers;
        let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
        insn.encode(Some(&mut bytes));
        let (channel, thread) = match self.id {
            ThreadId::Channel(n) if !as_manager => (u32::from(n), 1),
            _ => (0, 0),
        };
        ral::write_reg!(
            pl330,
            regs,
            DBGINST0,
            INSN_BYTE0: u32::from(bytes[0]),
            INSN_BYTE1: u32::from(bytes[1]),
            CHANNEL: channel,
            THREAD: thread
        );
        regs.DBGINST1
            .write(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]));
        regs.DBGCMD.write(0);
        log_at!(self.log_level, Trace, "{:?} executed {:?}", self.id, insn);
    }

    /// Kill the thread now, if the debug interface is idle
    ///
    /// Returns `false`, issuing nothing, if the interface is busy. Never waits.
    pub(crate) fn abort(&self) -> bool {
        if ral::read_reg!(pl330, self.registers, DBGSTATUS, BUSY == 1) {
            return false;
        }
        self.issue(Instruction::Kill, self.id == ThreadId::Manager);
        self.mask_event();
        log_at!(self.log_level, Warn, "{:?} aborted", self.id);
        true
    }

    /// Disable and acknowledge this thread's event interrupt
    fn mask_event(&self) {
        let Some(mask) = self.event_mask() else {
            return;
        };
        let regs = self.registers;
        critical_section::with(|_| {
            if regs.INTEN.read() & mask != 0 {
                regs.INTCLR.write(mask);
            }
            ral::modify_reg!(pl330, regs, INTEN, |inten| inten & !mask);
        });
    }

    fn event_mask(&self) -> Option<u32> {
        self.event.map(|event| 1 << event)
    }

    /// Stop the thread
    ///
    /// Returns once the kill is issued; it does not wait for the thread to
    /// stop. Threads that are stopped, or on their way to stopping, are left
    /// alone.
    pub(crate) fn stop<D: DelayNs>(&self, request: Option<&mut Request>, delay: &mut D) -> Result<()> {
        let mut state = self.state();
        if state == ThreadState::Channel(ChannelState::FaultCompleting) {
            let reached = self.until(delay, |state| {
                matches!(state, ChannelState::Faulting | ChannelState::Killing)
            })?;
            state = ThreadState::Channel(reached);
        }

        let stopping = matches!(
            state,
            ThreadState::Channel(
                ChannelState::Completing | ChannelState::Killing | ChannelState::Stopped
            )
        ) || state.is_stopped();

        if !stopping {
            self.execute(Instruction::Kill, self.id == ThreadId::Manager, delay)?;
            self.mask_event();
            log_at!(self.log_level, Debug, "{:?} killed from {:?}", self.id, state);
        }

        if let Some(request) = request {
            request.running = false;
        }
        Ok(())
    }

    /// Start the channel's program, recovering from faults and kills first
    ///
    /// Starting a channel that's already running does nothing.
    pub(crate) fn start<D: DelayNs>(&self, request: &mut Request, delay: &mut D) -> Result<()> {
        let state = self.channel_state();
        match state {
            state if state.is_active() => return Ok(()),
            ChannelState::WaitingForEvent | ChannelState::Invalid => {
                log_at!(self.log_level, Warn, "{:?} cannot start from {:?}", self.id, state);
                return Err(Error::UnsupportedState(state));
            }
            _ => {}
        }

        if state == ChannelState::FaultCompleting {
            let reached = self.until(delay, |state| {
                matches!(state, ChannelState::Faulting | ChannelState::Killing)
            })?;
            if reached == ChannelState::Killing {
                self.until(delay, |state| state == ChannelState::Stopped)?;
            }
        }
        if matches!(state, ChannelState::FaultCompleting | ChannelState::Faulting) {
            self.stop(Some(request), delay)?;
        }
        if state != ChannelState::Stopped {
            self.until(delay, |state| state == ChannelState::Stopped)?;
        }
        self.trigger(request, delay)
    }

    /// Issue `DMAGO` for a stopped, idle channel
    fn trigger<D: DelayNs>(&self, request: &mut Request, delay: &mut D) -> Result<()> {
        if self.channel_state() != ChannelState::Stopped || request.running {
            return Ok(());
        }
        let ThreadId::Channel(channel) = self.id else {
            return Err(Error::InvalidHandle);
        };
        if request.transfer.is_none() {
            return Err(Error::InvalidTransfer);
        }

        let go = Instruction::Go {
            channel,
            address: request.microcode.bus_address(),
            nonsecure: self.nonsecure,
        };
        let regs = self.registers;
        let mask = self.event_mask().unwrap_or(0);
        critical_section::with(|_| ral::modify_reg!(pl330, regs, INTEN, |inten| inten | mask));

        // Program must be visible before the controller fetches it.
        atomic::fence(atomic::Ordering::SeqCst);
        if let Err(err) = self.execute(go, true, delay) {
            critical_section::with(|_| ral::modify_reg!(pl330, regs, INTEN, |inten| inten & !mask));
            return Err(err);
        }
        request.running = true;
        log_at!(
            self.log_level,
            Debug,
            "{:?} started at {:#010X}",
            self.id,
            request.microcode.bus_address()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Microcode;
    use crate::program::{ControlWord, Direction, TransferSpec};
    use crate::testing::{microcode, offset, CountingDelay, FakeRegisters, ScriptedDelay, UNWRITTEN};

    const CHANNEL: u8 = 2;
    const BUS: u32 = 0x1000_0200;

    fn thread(fake: &FakeRegisters) -> Thread {
        Thread {
            id: ThreadId::Channel(CHANNEL),
            event: Some(CHANNEL),
            registers: Static(fake.registers()),
            nonsecure: false,
            log_level: LevelFilter::Off,
        }
    }

    fn request() -> Request {
        Request {
            microcode: Microcode::new(microcode(256), BUS),
            transfer: Some(TransferSpec {
                control: ControlWord::new().burst(4, 8),
                direction: Direction::MemoryToPeripheral { peripheral: 1 },
                source: 0x2000_0000,
                destination: 0x4000_0000,
                period_bytes: 256,
                periods: 2,
            }),
            running: false,
        }
    }

    fn fake() -> &'static FakeRegisters {
        FakeRegisters::with_channels(4, 4)
    }

    fn set_state(fake: &FakeRegisters, state: u32) {
        fake.set(offset::csr(CHANNEL.into()), state);
    }

    const GO: u32 = 0xA0 << 16 | (CHANNEL as u32) << 24;
    const KILL: u32 = 0x01 << 16 | (CHANNEL as u32) << 8 | 1;

    #[test]
    fn start_from_stopped_issues_go_from_the_manager() {
        let fake = fake();
        let mut request = request();
        thread(fake).start(&mut request, &mut CountingDelay::default()).unwrap();

        assert_eq!(fake.get(offset::DBGINST0), GO);
        assert_eq!(fake.get(offset::DBGINST1), BUS);
        assert_eq!(fake.get(offset::DBGCMD), 0);
        assert_eq!(fake.get(offset::INTEN), 1 << CHANNEL);
        assert!(request.running);
    }

    #[test]
    fn second_start_does_not_issue_another_go() {
        let fake = fake();
        let mut request = request();
        let thread = thread(fake);
        let mut delay = CountingDelay::default();
        thread.start(&mut request, &mut delay).unwrap();
        fake.set(offset::DBGINST0, UNWRITTEN);

        // Hardware hasn't left stopped yet; the request is running.
        thread.start(&mut request, &mut delay).unwrap();
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
    }

    #[test]
    fn start_while_executing_is_a_no_op() {
        let fake = fake();
        set_state(fake, 0x1);
        let mut request = request();
        let thread = thread(fake);
        let mut delay = CountingDelay::default();
        assert_eq!(thread.start(&mut request, &mut delay), Ok(()));
        assert_eq!(thread.start(&mut request, &mut delay), Ok(()));
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
        assert_eq!(fake.get(offset::INTEN), 0);
    }

    #[test]
    fn start_in_any_active_state_is_a_no_op() {
        for state in [0x1, 0x2, 0x3, 0x5, 0x6, 0x7] {
            let fake = fake();
            set_state(fake, state);
            let mut request = request();
            assert_eq!(
                thread(fake).start(&mut request, &mut CountingDelay::default()),
                Ok(()),
                "state {state:#X}"
            );
            assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN, "state {state:#X}");
            assert_eq!(fake.get(offset::DBGCMD), UNWRITTEN, "state {state:#X}");
        }
    }

    #[test]
    fn start_while_waiting_for_event_is_unsupported() {
        let fake = fake();
        set_state(fake, 0x4);
        let mut request = request();
        assert_eq!(
            thread(fake).start(&mut request, &mut CountingDelay::default()),
            Err(Error::UnsupportedState(ChannelState::WaitingForEvent))
        );
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
    }

    #[test]
    fn start_without_a_program_fails() {
        let fake = fake();
        let mut request = request();
        request.transfer = None;
        assert_eq!(
            thread(fake).start(&mut request, &mut CountingDelay::default()),
            Err(Error::InvalidTransfer)
        );
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
    }

    #[test]
    fn start_from_faulting_kills_then_waits_for_stop() {
        let fake = fake();
        set_state(fake, 0xF);
        let mut kills = 0;
        let mut delay = ScriptedDelay::new(|calls| {
            if fake.get(offset::DBGINST0) == KILL {
                kills += 1;
            }
            if calls == 3 {
                set_state(fake, 0x0);
            }
        });
        let mut request = request();
        thread(fake).start(&mut request, &mut delay).unwrap();
        assert!(kills > 0);
        assert_eq!(fake.get(offset::DBGINST0), GO);
        assert!(request.running);
    }

    #[test]
    fn start_from_fault_completing_follows_the_kill() {
        let fake = fake();
        set_state(fake, 0xE);
        let mut delay = ScriptedDelay::new(|calls| match calls {
            1 => set_state(fake, 0x8),
            2 => set_state(fake, 0x0),
            _ => {}
        });
        let mut request = request();
        thread(fake).start(&mut request, &mut delay).unwrap();
        assert_eq!(delay.calls, 2);
        assert_eq!(fake.get(offset::DBGINST0), GO);
    }

    #[test]
    fn start_times_out_if_the_channel_never_stops() {
        let fake = fake();
        set_state(fake, 0x9);
        let mut delay = CountingDelay::default();
        let mut request = request();
        assert_eq!(
            thread(fake).start(&mut request, &mut delay),
            Err(Error::Timeout)
        );
        assert_eq!(delay.ns, u64::from(DEBUG_TIMEOUT_US) * 1_000);
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
    }

    #[test]
    fn stop_on_stopped_channel_touches_nothing() {
        let fake = fake();
        fake.set(offset::INTEN, 0b1111);
        let mut request = request();
        thread(fake)
            .stop(Some(&mut request), &mut CountingDelay::default())
            .unwrap();
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
        assert_eq!(fake.get(offset::INTCLR), UNWRITTEN);
        assert_eq!(fake.get(offset::INTEN), 0b1111);
    }

    #[test]
    fn stop_kills_and_masks_the_event() {
        let fake = fake();
        let mut request = request();
        let thread = thread(fake);
        let mut delay = CountingDelay::default();
        thread.start(&mut request, &mut delay).unwrap();
        fake.set(offset::INTEN, fake.get(offset::INTEN) | 0b1);
        set_state(fake, 0x7);

        thread.stop(Some(&mut request), &mut delay).unwrap();
        assert_eq!(fake.get(offset::DBGINST0), KILL);
        assert_eq!(fake.get(offset::INTCLR), 1 << CHANNEL);
        assert_eq!(fake.get(offset::INTEN), 0b1);
        assert!(!request.running);
    }

    #[test]
    fn stop_from_fault_completing_waits_then_kills() {
        let fake = fake();
        set_state(fake, 0xE);
        let mut delay = ScriptedDelay::new(|calls| {
            if calls == 1 {
                set_state(fake, 0xF);
            }
        });
        let mut request = request();
        request.running = true;
        thread(fake).stop(Some(&mut request), &mut delay).unwrap();
        assert_eq!(delay.calls, 1);
        assert_eq!(fake.get(offset::DBGINST0), KILL);
        assert_eq!(fake.get(offset::DBGCMD), 0);
        assert!(!request.running);
    }

    #[test]
    fn stop_from_fault_completing_into_killing_issues_nothing() {
        let fake = fake();
        set_state(fake, 0xE);
        let mut delay = ScriptedDelay::new(|calls| {
            if calls == 2 {
                set_state(fake, 0x8);
            }
        });
        let mut request = request();
        request.running = true;
        thread(fake).stop(Some(&mut request), &mut delay).unwrap();
        assert_eq!(delay.calls, 2);
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
        assert!(!request.running);
    }

    #[test]
    fn abort_never_waits_for_the_debug_interface() {
        let fake = fake();
        set_state(fake, 0xF);
        fake.set(offset::INTEN, 1 << CHANNEL);
        fake.set(offset::DBGSTATUS, 1);
        let thread = thread(fake);
        assert!(!thread.abort());
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
        assert_eq!(fake.get(offset::INTEN), 1 << CHANNEL);

        fake.set(offset::DBGSTATUS, 0);
        assert!(thread.abort());
        assert_eq!(fake.get(offset::DBGINST0), KILL);
        assert_eq!(fake.get(offset::INTCLR), 1 << CHANNEL);
        assert_eq!(fake.get(offset::INTEN), 0);
    }

    #[test]
    fn stop_leaves_killing_and_completing_channels_alone() {
        for state in [0x8, 0x9] {
            let fake = fake();
            set_state(fake, state);
            thread(fake)
                .stop(None, &mut CountingDelay::default())
                .unwrap();
            assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
        }
    }

    #[test]
    fn busy_debug_interface_drops_the_instruction() {
        let fake = fake();
        set_state(fake, 0x1);
        fake.set(offset::DBGSTATUS, 1);
        let mut request = request();
        request.running = true;
        assert_eq!(
            thread(fake).stop(Some(&mut request), &mut CountingDelay::default()),
            Err(Error::Timeout)
        );
        assert_eq!(fake.get(offset::DBGINST0), UNWRITTEN);
        assert_eq!(fake.get(offset::DBGCMD), UNWRITTEN);
        assert!(request.running);
    }

    #[test]
    fn failed_go_leaves_the_event_masked() {
        let fake = fake();
        fake.set(offset::DBGSTATUS, 1);
        let mut request = request();
        assert_eq!(
            thread(fake).start(&mut request, &mut CountingDelay::default()),
            Err(Error::Timeout)
        );
        assert_eq!(fake.get(offset::INTEN), 0);
        assert!(!request.running);
    }

    #[test]
    fn manager_kill_is_addressed_to_the_manager() {
        let fake = fake();
        fake.set(offset::DSR, 0x1);
        let manager = Thread {
            id: ThreadId::Manager,
            event: None,
            ..thread(fake)
        };
        manager.stop(None, &mut CountingDelay::default()).unwrap();
        assert_eq!(fake.get(offset::DBGINST0), 0x01 << 16);
        assert_eq!(fake.get(offset::INTCLR), UNWRITTEN);
    }

    #[test]
    fn fault_type_is_reported_only_while_faulting() {
        let fake = fake();
        fake.set(offset::ftr(CHANNEL.into()), 1 << 6);
        assert_eq!(thread(fake).fault(), None);
        set_state(fake, 0xF);
        assert_eq!(thread(fake).fault().map(Fault::raw), Some(1 << 6));
    }
}
