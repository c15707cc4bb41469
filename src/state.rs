//! Thread identities and hardware execution states

/// A PL330 thread: the manager, or one of the DMA channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadId {
    /// The DMA manager thread
    Manager,
    /// A DMA channel thread, numbered from zero
    Channel(u8),
}

/// States reported by the DMA manager thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ManagerState {
    Stopped,
    Executing,
    CacheMiss,
    UpdatingPc,
    WaitingForEvent,
    Faulting,
    /// A reserved code, or a code that only channels report
    Invalid,
}

/// States reported by a DMA channel thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    Stopped,
    Executing,
    CacheMiss,
    UpdatingPc,
    WaitingForEvent,
    AtBarrier,
    QueueBusy,
    WaitingForPeripheral,
    Killing,
    Completing,
    FaultCompleting,
    Faulting,
    /// A reserved code
    Invalid,
}

impl ChannelState {
    /// Decode the 4-bit `CSR` status field
    pub const fn from_raw(raw: u32) -> Self {
        match raw & 0xF {
            0x0 => ChannelState::Stopped,
            0x1 => ChannelState::Executing,
            0x2 => ChannelState::CacheMiss,
            0x3 => ChannelState::UpdatingPc,
            0x4 => ChannelState::WaitingForEvent,
            0x5 => ChannelState::AtBarrier,
            0x6 => ChannelState::QueueBusy,
            0x7 => ChannelState::WaitingForPeripheral,
            0x8 => ChannelState::Killing,
            0x9 => ChannelState::Completing,
            0xE => ChannelState::FaultCompleting,
            0xF => ChannelState::Faulting,
            _ => ChannelState::Invalid,
        }
    }

    /// Returns `true` if the channel is moving data, or about to
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            ChannelState::Executing
                | ChannelState::CacheMiss
                | ChannelState::UpdatingPc
                | ChannelState::AtBarrier
                | ChannelState::QueueBusy
                | ChannelState::WaitingForPeripheral
        )
    }
}

impl ManagerState {
    /// Decode the 4-bit `DSR` status field
    pub const fn from_raw(raw: u32) -> Self {
        match ChannelState::from_raw(raw) {
            ChannelState::Stopped => ManagerState::Stopped,
            ChannelState::Executing => ManagerState::Executing,
            ChannelState::CacheMiss => ManagerState::CacheMiss,
            ChannelState::UpdatingPc => ManagerState::UpdatingPc,
            ChannelState::WaitingForEvent => ManagerState::WaitingForEvent,
            ChannelState::Faulting => ManagerState::Faulting,
            _ => ManagerState::Invalid,
        }
    }
}

/// The mapped state of a thread, tagged by the kind of thread that reported it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadState {
    Manager(ManagerState),
    Channel(ChannelState),
}

impl ThreadState {
    /// Map a raw status field as reported by `thread`
    pub const fn decode(thread: ThreadId, raw: u32) -> Self {
        match thread {
            ThreadId::Manager => ThreadState::Manager(ManagerState::from_raw(raw)),
            ThreadId::Channel(_) => ThreadState::Channel(ChannelState::from_raw(raw)),
        }
    }

    /// Returns `true` if the thread is stopped
    pub const fn is_stopped(self) -> bool {
        matches!(
            self,
            ThreadState::Manager(ManagerState::Stopped)
                | ThreadState::Channel(ChannelState::Stopped)
        )
    }

    /// Returns `true` if the thread is faulting
    pub const fn is_faulting(self) -> bool {
        matches!(
            self,
            ThreadState::Manager(ManagerState::Faulting)
                | ThreadState::Channel(ChannelState::Faulting)
        )
    }
}
