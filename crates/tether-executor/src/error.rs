use tether_core::errors::ErrorKind;
use tether_core::protocol::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed by server")]
    Closed,

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("server error {code:?}: {message}")]
    Server {
        message: String,
        code: Option<ErrorKind>,
    },

    #[error("prompt failed: {0}")]
    Prompt(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) | Self::Closed | Self::Transport(_) => ErrorKind::Disconnect,
            Self::Codec(e) => e.kind(),
            Self::Server { code, .. } => code.unwrap_or(ErrorKind::Fatal),
            Self::Prompt(_) => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(ExecutorError::Closed.kind(), ErrorKind::Disconnect);
        let err = ExecutorError::Server {
            message: "job not paused".into(),
            code: Some(ErrorKind::ResumeConflict),
        };
        assert_eq!(err.kind(), ErrorKind::ResumeConflict);
        assert!(err.to_string().contains("job not paused"));
        let err = ExecutorError::Server {
            message: "?".into(),
            code: None,
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
