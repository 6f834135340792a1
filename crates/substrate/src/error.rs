#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("substrate not available: {0}")]
    NotAvailable(String),

    #[error("unit creation failed: {0}")]
    CreationFailed(String),

    #[error("policy application failed: {0}")]
    PolicyFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("no such process: pid {0}")]
    UnknownProcess(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SubstrateError>;
