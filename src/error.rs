use thiserror::Error;

pub type Result<T> = std::result::Result<T, RustVtlError>;

#[derive(Error, Debug)]
pub enum RustVtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Corrupt metadata: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device graph error: {0}")]
    Device(String),

    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl RustVtlError {
    pub fn structural<T: Into<String>>(msg: T) -> Self {
        Self::Structural(msg.into())
    }

    pub fn allocation<T: Into<String>>(msg: T) -> Self {
        Self::Allocation(msg.into())
    }

    pub fn corrupt<T: Into<String>>(msg: T) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn device<T: Into<String>>(msg: T) -> Self {
        Self::Device(msg.into())
    }

    pub fn parameter_validation<T: Into<String>>(msg: T) -> Self {
        Self::ParameterValidation(msg.into())
    }

    pub fn parse<T: Into<String>>(msg: T) -> Self {
        Self::Parse(msg.into())
    }
}

impl From<std::collections::TryReserveError> for RustVtlError {
    fn from(err: std::collections::TryReserveError) -> Self {
        Self::Allocation(format!("page buffer reservation failed: {}", err))
    }
}
