use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("SANDBOX_BOOT: {0}")]
    Sandbox(String),
    #[error("OUT_OF_MEMORY: {0}")]
    OutOfMemory(String),
    #[error("HOST_UNSUPPORTED: {0}")]
    Unsupported(String),
    #[error("MOUNT_FAILED: {0}")]
    Mount(String),
    #[error("INSTALL_FAILED: {0}")]
    Install(String),
    #[error("DEV_SERVER: {0}")]
    DevServer(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("STORAGE: {0}")]
    Storage(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Message without the code prefix, as shown to the user.
    pub fn detail(&self) -> &str {
        match self {
            Self::Sandbox(message)
            | Self::OutOfMemory(message)
            | Self::Unsupported(message)
            | Self::Mount(message)
            | Self::Install(message)
            | Self::DevServer(message)
            | Self::Config(message)
            | Self::Io(message)
            | Self::Storage(message)
            | Self::Internal(message) => message,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
