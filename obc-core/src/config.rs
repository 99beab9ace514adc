//! Compile-time sizing and runtime tunables.

use embassy_time::Duration;

// -- queue depths
pub const HIGH_QUEUE_DEPTH: usize = 4;
pub const LOW_QUEUE_DEPTH: usize = 8;
pub const RX_QUEUE_DEPTH: usize = 32;
pub const REPLY_QUEUE_DEPTH: usize = 4;
pub const BULK_QUEUE_DEPTH: usize = 24;
pub const DOWNLINK_QUEUE_DEPTH: usize = 16;
pub const GROUND_QUEUE_DEPTH: usize = 4;
pub const ROUTER_FIFO_DEPTH: usize = 4;

// -- payload sizes
pub const FAULT_PAYLOAD_LEN: usize = 147;
pub const ROUTER_PACKET_LEN: usize = 64;

/// Ceiling on how long a task waits for FDIR to resolve a high-severity report.
pub const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Thresholds and timeouts used by the FDIR engine and the diagnostics collector.
///
/// Ground can change a subset of these at runtime through the variable
/// commands; everything else is fixed at construction.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdirConfig {
    /// Delay between two engine iterations.
    pub tick: Duration,
    /// First SSM reply timeout of the retry ladder.
    pub ssm_timeout_base: Duration,
    /// Added to the SSM timeout after every failed attempt.
    pub ssm_timeout_step: Duration,
    pub ssm_retries: u8,
    pub reset_pulse: Duration,
    /// Time an SSM needs after its reset line is released.
    pub ssm_boot_delay: Duration,
    pub fifo_threshold: u8,
    pub spi_chip_threshold: u8,
    pub stall_threshold: u8,
    /// Upper bound on any lock FDIR takes.
    pub lock_timeout: Duration,
    /// Length of one mission-clock tick while in safe mode.
    pub minute: Duration,
    pub diagnostics_interval: Duration,
    pub bulk_window: Duration,
    pub param_timeout: Duration,
    pub param_retries: u8,
}

impl Default for FdirConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            ssm_timeout_base: Duration::from_millis(2),
            ssm_timeout_step: Duration::from_millis(2),
            ssm_retries: 3,
            reset_pulse: Duration::from_millis(10),
            ssm_boot_delay: Duration::from_millis(50),
            fifo_threshold: 5,
            spi_chip_threshold: 10,
            stall_threshold: 3,
            lock_timeout: Duration::from_millis(100),
            minute: Duration::from_secs(60),
            diagnostics_interval: Duration::from_secs(30 * 60),
            bulk_window: Duration::from_millis(25),
            param_timeout: Duration::from_millis(10),
            param_retries: 3,
        }
    }
}

impl FdirConfig {
    /// Reply timeout for the given zero-based attempt of the SSM ladder.
    pub fn ssm_timeout(&self, attempt: u8) -> Duration {
        self.ssm_timeout_base + self.ssm_timeout_step * attempt as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssm_timeouts_grow_linearly() {
        let cfg = FdirConfig::default();
        assert_eq!(cfg.ssm_timeout(0), Duration::from_millis(2));
        assert_eq!(cfg.ssm_timeout(1), Duration::from_millis(4));
        assert_eq!(cfg.ssm_timeout(2), Duration::from_millis(6));
    }
}
