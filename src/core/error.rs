use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Node not found: {0}")]
    NodeNotFound(i64),

    #[error("Node with address {0} already registered")]
    NodeExists(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Remote command failed: {0}")]
    RemoteCommand(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Chart installation failed: {0}")]
    Chart(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::NodeExists(_) => "NODE_EXISTS",
            Error::Ssh(_) => "SSH_ERROR",
            Error::RemoteCommand(_) => "REMOTE_COMMAND_FAILED",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Chart(_) => "CHART_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Other(_) => "ERROR",
        }
    }
}
