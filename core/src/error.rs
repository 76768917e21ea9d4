/// Error taxonomy for the NTM core.
///
/// Numerical and dimension errors are fatal to the pass that raised them.
/// Sequencing errors report misuse of the BPTT state machine. Nothing in the
/// numerical core is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NtmError {
    /// NaN, a negative probability, or a collapsed normaliser.
    #[error("invalid numeric result in {stage}: {detail}")]
    InvalidNumeric { stage: &'static str, detail: String },

    /// A vector or matrix does not match the configured counts.
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch { what: &'static str, expected: usize, got: usize },

    /// Rejected configuration (zero sizes, bad hyperparameters).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backward before forward, reuse without zeroing, stepping a closed chain.
    #[error("sequencing error: {0}")]
    Sequencing(String),

    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(#[from] std::io::Error),

    #[error("checkpoint format error: {0}")]
    CheckpointFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NtmError>;

impl NtmError {
    pub(crate) fn numeric(stage: &'static str, detail: impl Into<String>) -> Self {
        NtmError::InvalidNumeric { stage, detail: detail.into() }
    }

    pub(crate) fn sequencing(detail: impl Into<String>) -> Self {
        NtmError::Sequencing(detail.into())
    }
}

/// Check a slice length against its configured size.
pub(crate) fn expect_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(NtmError::DimensionMismatch { what, expected, got });
    }
    Ok(())
}
