use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    InvalidConfig(#[from] serde_yml::Error),
    #[error("The peer id of identity '{0}' does not match its keypair.")]
    InconsistentIdentity(String),
    #[error("Line {line} of the snapshot file is invalid. {reason}")]
    InvalidSnapshot { line: usize, reason: String },
}
