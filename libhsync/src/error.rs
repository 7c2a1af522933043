use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    InvalidConfig(#[from] serde_yml::Error),
    #[error("No connection named {0} in the configuration file")]
    UnknownConnection(String),
    #[error("No relay named {0} in the configuration file")]
    UnknownRelay(String),
}
