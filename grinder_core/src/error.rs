use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GrinderError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("weight sensor failed to initialize: {0}")]
    SensorInit(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
