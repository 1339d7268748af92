use std::io;

use async_tungstenite::tungstenite;
use futures::channel::{mpsc::SendError, oneshot::Canceled};
use thiserror::Error;

use nutbot_relay_types::extension::ProtocolError;
use nutbot_relay_types::Error as CdpErrorObject;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Ws(#[from] tungstenite::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    ChannelSendError(#[from] SendError),
    #[error("request canceled")]
    Canceled(#[from] Canceled),
    #[error("Extension not connected")]
    NotConnected,
    #[error("Extension disconnected")]
    Disconnected,
    #[error("No such session: {0}")]
    NoSuchSession(String),
    #[error("{0} is required")]
    MissingParam(&'static str),
    #[error("Target {0} not found")]
    TargetNotFound(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Client {0} is already connected")]
    DuplicateClient(String),
    /// The extension's own debugging call failed, the message is passed
    /// through verbatim
    #[error("{0}")]
    Upstream(String),
    #[error("Timeout waiting for response to {0}")]
    Timeout(String),
}

impl RelayError {
    /// The error object to put into a cdp response
    pub fn to_cdp_error(&self) -> CdpErrorObject {
        let code = match self {
            RelayError::UnknownMethod(_) => CdpErrorObject::METHOD_NOT_FOUND,
            RelayError::MissingParam(_) => CdpErrorObject::INVALID_PARAMS,
            _ => CdpErrorObject::SERVER_ERROR,
        };
        CdpErrorObject::new(code, self.to_string())
    }
}
