use thiserror::Error;

mod attach;
mod shell_session;

pub use attach::{scan_detach, Attachment, DETACH_BYTE};
pub use shell_session::{CommandHandle, ShellSession, INTERRUPT_BYTE};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime configuration error: {0}")]
    Configuration(String),
    #[error("runtime process error: {0}")]
    Process(String),
    #[error("shell session is closed")]
    Closed,
    #[error("a background command is already in flight")]
    CommandInFlight,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
