//! Error types for the CPU manager.

/// Errors produced by topology discovery, state restore and allocation.
#[derive(Debug, thiserror::Error)]
pub enum CpuManagerError {
    /// Range notation could not be parsed.
    #[error("invalid cpu set {input:?}: {reason}")]
    InvalidCpuSet {
        /// The rejected input
        input: String,
        /// What was wrong with it
        reason: String,
    },

    /// NUMA node id does not fit in a mask.
    #[error("NUMA node {0} exceeds the maximum mask width of 64")]
    InvalidNumaNode(usize),

    /// Hardware inventory is malformed.
    #[error("topology discovery failed: {0}")]
    TopologyDiscovery(String),

    /// Configuration does not fit the machine.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Assignments and default pool do not partition the pinnable CPUs.
    #[error("state invariant violated: {0}")]
    StateInvariantViolation(String),

    /// Checkpoint was written by a different policy.
    #[error("configured policy {configured:?} does not match checkpoint policy {checkpoint:?}")]
    PolicyMismatch {
        /// Policy name from the running configuration
        configured: String,
        /// Policy name recorded in the checkpoint
        checkpoint: String,
    },

    /// Checkpoint content does not hash to its recorded checksum.
    #[error("checkpoint {name:?} is corrupted: checksum {recorded} does not match computed {computed}")]
    ChecksumMismatch {
        /// Checkpoint name
        name: String,
        /// Checksum stored in the checkpoint
        recorded: u64,
        /// Checksum computed over the loaded content
        computed: u64,
    },

    /// Neither the current nor the legacy format could decode the checkpoint.
    #[error("checkpoint {name:?} could not be decoded: {reason}")]
    CorruptCheckpoint {
        /// Checkpoint name
        name: String,
        /// Decoder message from the current format
        reason: String,
    },

    /// Not enough CPUs left in the default pool.
    #[error("not enough cpus available to satisfy request: requested={requested}, available={available}")]
    Allocation {
        /// CPUs asked for
        requested: usize,
        /// CPUs left in the default pool
        available: usize,
    },

    /// I/O failure while persisting a checkpoint.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure.
    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CpuManagerError {
    /// Whether startup must abort on this error.
    ///
    /// Only [`CpuManagerError::Allocation`] is local to a single request.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Allocation { .. })
    }
}

/// Result type for CPU manager operations.
pub type Result<T> = std::result::Result<T, CpuManagerError>;
