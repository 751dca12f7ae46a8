use thiserror::Error;

/// Error type shared by every conversion component.
///
/// The variants mirror the phases that can surface them: `Corruption` is
/// raised while parsing btrfs structures, `SpaceExhausted` by the planner
/// and allocator, `InvariantViolation` when an internal consistency check
/// trips, and `MemoryPressure` when an optional in-memory index cannot be
/// built and no fallback applies.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt filesystem structure: {0}")]
    Corruption(String),

    #[error("unsupported filesystem feature: {0}")]
    Unsupported(String),

    #[error("not enough free space: {0}")]
    SpaceExhausted(String),

    #[error("memory pressure: {0}")]
    MemoryPressure(String),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("operation aborted by user")]
    UserAbort,
}

impl ConvertError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        ConvertError::Corruption(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        ConvertError::Unsupported(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        ConvertError::InvariantViolation(msg.into())
    }
}
