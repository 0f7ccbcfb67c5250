use thiserror::Error;
pub use relaygate_common::FromMessage;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("channel {0} is already running")]
    AlreadyRunning(String),

    #[error("channel {0} is not running")]
    NotRunning(String),

    #[error("no active endpoint for session {0} on channel {1}")]
    NoRoute(String, String),

    #[error("channel {0} already registered")]
    AlreadyRegistered(String),

    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    #[error("malformed inbound payload: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

relaygate_common::impl_context!();
