use thiserror::Error;

mod client;
mod rate_limit;
mod token;

pub use client::{
    CreatePullRequest, HostingClient, HostingClientConfig, PullRequest, DEFAULT_API_BASE,
};
pub use rate_limit::RateLimiter;
pub use token::{resolve_token, CommandRunner, ProcessCommandRunner, TOKEN_ENV};

#[derive(Debug, Error)]
pub enum HostingError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("decoding response: {0}")]
    Decode(String),
    #[error("credentials: {0}")]
    Credentials(String),
}

pub type HostingResult<T> = Result<T, HostingError>;
