use std::fmt;

#[derive(Debug)]
pub enum Error {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Json(serde_json::Error),
    Signaling(String),
    Media(String),
    Peer(String),
    Room(String),
    ConnectionLost,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Signaling(e) => write!(f, "Signaling error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::Peer(e) => write!(f, "Peer error: {}", e),
            Error::Room(e) => write!(f, "Room error: {}", e),
            Error::ConnectionLost => write!(f, "Signaling connection lost"),
        }
    }
}

impl std::error::Error for Error {}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::Peer(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Media(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
