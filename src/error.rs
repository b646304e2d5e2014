#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed DHCP header: {0}")]
    MalformedHeader(String),

    #[error("Malformed option {code}: {reason}")]
    MalformedOption { code: u8, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Transport error: {source}")]
    Transport {
        fatal: bool,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// True for transport failures the server cannot recover from by
    /// resuming the receive loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport { fatal: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
