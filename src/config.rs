//! Runtime configuration of the host stack.

/// Retry limits, NAK budgets and bus timing. The defaults reproduce the
/// values a full-speed embedded host ships with; integrators tune them per
/// target through [`HostConfig::default`] + struct update syntax.
#[derive(Clone, Copy, Debug)]
pub struct HostConfig {
    /// Attempts per enumeration command before the device is reset and
    /// enumeration restarts.
    pub command_retries: u8,
    /// Enumeration attempts before the device is parked in the holding
    /// state.
    pub enumeration_retries: u8,
    /// NAKs tolerated on a control transfer before it fails with a NAK
    /// timeout.
    pub control_nak_limit: u16,
    /// NAKs tolerated on an interrupt OUT transfer. Interrupt IN transfers
    /// retry at their polling interval without a budget.
    pub interrupt_out_nak_limit: u16,
    /// NAKs tolerated on a bulk transfer (scaffolding; no caller issues
    /// bulk transfers).
    pub bulk_nak_limit: u16,
    /// Consecutive bus-level faults (CRC, bit stuff, timeout, PID) tolerated
    /// on one transaction before the transfer fails.
    pub transaction_retries: u8,
    /// Insertion settle time, in milliseconds.
    pub settle_ms: u16,
    /// Bus reset assertion time, in milliseconds.
    pub reset_ms: u16,
    /// Recovery time after reset deassertion, in milliseconds.
    pub reset_recovery_ms: u16,
    /// Resume signalling time, in milliseconds.
    pub resume_ms: u16,
    /// Recovery time after resume signalling, in milliseconds.
    pub resume_recovery_ms: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command_retries: 3,
            enumeration_retries: 3,
            control_nak_limit: 20,
            interrupt_out_nak_limit: 3,
            bulk_nak_limit: 10_000,
            transaction_retries: 20,
            settle_ms: 100,
            reset_ms: 10,
            reset_recovery_ms: 10,
            resume_ms: 20,
            resume_recovery_ms: 10,
        }
    }
}
