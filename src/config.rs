//! Controller and driver configuration

use crate::{
    program::ControlWord,
    ral::{self, pl330},
};
use log::LevelFilter;

/// Bytes of microcode reserved for each channel
pub const MICROCODE_BYTES: usize = 256;

/// Bound on busy-waits for the debug interface and for thread state changes
pub const DEBUG_TIMEOUT_US: u32 = 5_000;

/// Controller properties, read from the configuration registers once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    /// AXI data bus width, in bits
    pub data_bus_width: u32,
    /// Depth of the MFIFO data buffer, in lines
    pub data_buffer_depth: u32,
    /// Number of DMA channels
    pub channels: u8,
    /// Number of peripheral request interfaces
    pub peripherals: u8,
    /// Number of events and interrupt lines
    pub events: u8,
    /// The manager operates in the non-secure state
    pub nonsecure: bool,
    /// Peripheral identification, assembled from the four `PERIPH_ID` registers
    pub peripheral_id: u32,
}

impl DeviceConfig {
    pub(crate) fn read(regs: &pl330::RegisterBlock) -> Self {
        let (periph_req, num_periph, num_chnls, num_events) = ral::read_reg!(
            pl330,
            regs,
            CR0,
            PERIPH_REQ,
            NUM_PERIPH_REQ,
            NUM_CHNLS,
            NUM_EVENTS
        );
        let (data_width, buffer_dep) = ral::read_reg!(pl330, regs, CRD, DATA_WIDTH, DATA_BUFFER_DEP);
        let peripheral_id = regs
            .PERIPH_ID
            .iter()
            .enumerate()
            .fold(0, |id, (n, reg)| id | (reg.read() & 0xFF) << (8 * n));

        DeviceConfig {
            data_bus_width: 8 << data_width,
            data_buffer_depth: buffer_dep + 1,
            channels: num_chnls as u8 + 1,
            peripherals: if periph_req != 0 {
                num_periph as u8 + 1
            } else {
                0
            },
            events: num_events as u8 + 1,
            nonsecure: ral::read_reg!(pl330, regs, DSR, DNS == 1),
            peripheral_id,
        }
    }

    /// Bus width in bytes
    pub const fn data_bus_bytes(&self) -> u32 {
        self.data_bus_width / 8
    }
}

/// Driver configuration supplied when initializing a controller
///
/// Burst parameters apply to every cyclic transfer. The defaults suit 32-bit
/// audio FIFOs: 4 byte beats, 8 beats per burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Most verbose level the driver logs at
    pub log_level: LevelFilter,
    /// Bytes per beat; a power of two up to 16
    pub burst_size: u8,
    /// Beats per burst, `1..=16`
    pub burst_length: u8,
    /// Perform transfers as privileged accesses
    pub privileged: bool,
    /// Perform transfers as non-secure accesses
    pub nonsecure: bool,
    /// AXI cache control bits, `ARCACHE`/`AWCACHE` encoding
    pub cache_control: u8,
}

impl Config {
    /// Default configuration
    pub const fn new() -> Self {
        Config {
            log_level: LevelFilter::Warn,
            burst_size: 4,
            burst_length: 8,
            privileged: true,
            nonsecure: false,
            cache_control: 0,
        }
    }

    /// Set the driver log level
    pub const fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Set the burst shape, `size` bytes per beat and `length` beats
    pub const fn burst(mut self, size: u8, length: u8) -> Self {
        self.burst_size = size;
        self.burst_length = length;
        self
    }

    /// Select non-secure transfers
    pub const fn nonsecure(mut self, nonsecure: bool) -> Self {
        self.nonsecure = nonsecure;
        self
    }

    /// Select privileged transfers
    pub const fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Set the AXI cache control bits
    pub const fn cache_control(mut self, cache_control: u8) -> Self {
        self.cache_control = cache_control & 0x7;
        self
    }

    /// The control word every cyclic transfer starts from
    pub(crate) const fn control(&self) -> ControlWord {
        ControlWord::new()
            .burst(self.burst_size as u32, self.burst_length as u32)
            .protection(self.privileged, self.nonsecure)
            .cache(self.cache_control)
    }

    /// Returns `true` if the burst shape can run on a controller
    pub(crate) fn is_supported_by(&self, device: &DeviceConfig) -> bool {
        let size = u32::from(self.burst_size);
        size.is_power_of_two()
            && size <= 16
            && size <= device.data_bus_bytes()
            && (1..=16).contains(&self.burst_length)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
