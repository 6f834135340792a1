use substrate::SubstrateError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Request rejected before scheduling. Not retriable.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// No unit became available within the scheduling timeout. Transient;
    /// callers may retry with backoff.
    #[error("scheduling timed out")]
    SchedulingTimeout,

    /// Placement failed on every candidate node. Transient.
    #[error("no available capacity")]
    NoAvailableCapacity,

    /// Every candidate node is at its unit ceiling with nothing freeable.
    /// Backpressure, not a hard failure.
    #[error("pool exhausted")]
    PoolExhausted,

    /// A sandbox layer could not be applied. The unit involved is
    /// destroyed; the request was already retried once on another unit.
    #[error("sandbox setup failed: {0}")]
    SandboxSetupFailed(String),

    #[error("workspace service error: {0}")]
    Workspace(String),

    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
