// Synchronous usage errors surfaced directly to the caller.
// Server-reported and transport errors never take this path; they flow to
// listeners or the session machine instead.

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    // The call is legal in some state, just not the current one.
    #[error("illegal state: {0}")]
    IllegalState(String),
    // The call can never be legal with these arguments.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    // The engine task is gone (client dropped or runtime shut down).
    #[error("client engine is not running")]
    EngineGone,
}

impl ClientError {
    pub(crate) fn state(message: impl Into<String>) -> Self {
        ClientError::IllegalState(message.into())
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        ClientError::IllegalArgument(message.into())
    }
}
