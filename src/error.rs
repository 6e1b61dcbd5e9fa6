use thiserror::Error;

/// Errors produced while driving a grab to completion.
///
/// Transport loss and target crashes are unrecoverable for the current grab
/// and surface through every pending and future DevTools call as
/// [`Error::Crashed`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("browser spawn failed: {0}")]
    Spawn(String),

    #[error("tab crashed: {0}")]
    Crashed(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("tab error {code}: {message}")]
    Tab { code: i64, message: String },

    #[error("navigation failed: {0}")]
    Navigate(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unknown behavior: {0}")]
    UnknownBehavior(String),

    #[error("behavior script failed: {0}")]
    BehaviorScript(String),

    #[error("devtools endpoint error: {0}")]
    Endpoint(String),

    #[error("background task failed: {0}")]
    Internal(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Map an error to the exit code contract of the `crocoite-single`
    /// binary: 2 for a browser crash, 3 for a navigation failure, 1 for
    /// everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Crashed(_) => 2,
            Error::Navigate(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Crashed("target".into()).exit_code(), 2);
        assert_eq!(Error::Navigate("net::ERR_NAME_NOT_RESOLVED".into()).exit_code(), 3);
        assert_eq!(Error::Spawn("no port file".into()).exit_code(), 1);
        assert_eq!(
            Error::Tab { code: -32000, message: "busy".into() }.exit_code(),
            1
        );
    }
}
