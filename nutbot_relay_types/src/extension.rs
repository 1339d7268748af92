//! The protocol spoken between the relay hub and the extension peer.
//!
//! Every frame is a JSON object. Frames with an `id` and a `method` are
//! requests, frames with an `id` but no `method` are responses and frames
//! without `id` are notifications. Both directions are parsed into closed
//! enums, [`FromExtension`] and [`FromRelay`], so that an unexpected method
//! surfaces as [`ProtocolError::UnknownMethod`] instead of being ignored.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CallId, TargetInfo};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const LOG: &str = "log";
pub const FORWARD_CDP_EVENT: &str = "forwardCDPEvent";
pub const FORWARD_CDP_COMMAND: &str = "forwardCDPCommand";
pub const CREATE_INITIAL_TAB: &str = "createInitialTab";
pub const SHOW_NOTIFICATION: &str = "showNotification";

/// The untyped shape of every frame on the extension link
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            params,
            ..Default::default()
        }
    }

    fn request(id: CallId, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            ..Self::notification(method, params)
        }
    }

    fn response(id: CallId, outcome: &Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => Self {
                id: Some(id),
                result: Some(result.clone()),
                ..Default::default()
            },
            Err(err) => Self {
                id: Some(id),
                error: Some(err.clone()),
                ..Default::default()
            },
        }
    }

    fn typed_params<T: serde::de::DeserializeOwned>(
        &mut self,
        method: &'static str,
    ) -> Result<T, ProtocolError> {
        let params = self.params.take().unwrap_or(Value::Null);
        serde_json::from_value(params).map_err(|err| ProtocolError::InvalidParams {
            method,
            message: err.to_string(),
        })
    }
}

/// A cdp command or event wrapped for transport over the extension link
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdpForward {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Console output of the extension, mirrored into the relay's log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogParams {
    pub level: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationParams {
    pub title: String,
    pub message: String,
}

/// Result of a `createInitialTab` request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateInitialTabResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_info: Option<TargetInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// All messages the extension peer sends to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum FromExtension {
    /// Answer to a relay request
    Response {
        id: CallId,
        outcome: Result<Value, String>,
    },
    Ping,
    Pong,
    Log(LogParams),
    /// An event emitted by an attached tab
    ForwardCdpEvent(CdpForward),
}

impl FromExtension {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut frame: Frame = serde_json::from_str(text)?;
        let method = match frame.method.take() {
            Some(method) => method,
            None => {
                let id = frame.id.ok_or(ProtocolError::Malformed(
                    "frame has neither `id` nor `method`",
                ))?;
                let outcome = match frame.error {
                    Some(err) => Err(err),
                    None => Ok(frame.result.unwrap_or(Value::Null)),
                };
                return Ok(FromExtension::Response { id, outcome });
            }
        };
        if frame.id.is_some() {
            // the relay never serves requests from the extension
            return Err(ProtocolError::UnknownMethod {
                id: frame.id,
                method,
            });
        }
        match method.as_str() {
            PING => Ok(FromExtension::Ping),
            PONG => Ok(FromExtension::Pong),
            LOG => Ok(FromExtension::Log(frame.typed_params(LOG)?)),
            FORWARD_CDP_EVENT => Ok(FromExtension::ForwardCdpEvent(
                frame.typed_params(FORWARD_CDP_EVENT)?,
            )),
            _ => Err(ProtocolError::UnknownMethod { id: None, method }),
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            FromExtension::Response { id, outcome } => Frame::response(*id, outcome),
            FromExtension::Ping => Frame::notification(PING, None),
            FromExtension::Pong => Frame::notification(PONG, None),
            FromExtension::Log(params) => {
                Frame::notification(LOG, serde_json::to_value(params).ok())
            }
            FromExtension::ForwardCdpEvent(event) => {
                Frame::notification(FORWARD_CDP_EVENT, serde_json::to_value(event).ok())
            }
        }
    }

    pub fn to_json(&self) -> String {
        to_json(&self.to_frame())
    }
}

/// All messages the relay sends to the extension peer
#[derive(Debug, Clone, PartialEq)]
pub enum FromRelay {
    Ping,
    Pong,
    /// Execute a cdp command against the tab owning the session
    ForwardCdpCommand { id: CallId, command: CdpForward },
    /// Open a blank tab and attach to it
    CreateInitialTab { id: CallId },
    ShowNotification(NotificationParams),
}

impl FromRelay {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut frame: Frame = serde_json::from_str(text)?;
        let method = frame
            .method
            .take()
            .ok_or(ProtocolError::Malformed("relay frame without `method`"))?;
        match (frame.id, method.as_str()) {
            (None, PING) => Ok(FromRelay::Ping),
            (None, PONG) => Ok(FromRelay::Pong),
            (None, SHOW_NOTIFICATION) => Ok(FromRelay::ShowNotification(
                frame.typed_params(SHOW_NOTIFICATION)?,
            )),
            (Some(id), FORWARD_CDP_COMMAND) => Ok(FromRelay::ForwardCdpCommand {
                id,
                command: frame.typed_params(FORWARD_CDP_COMMAND)?,
            }),
            (Some(id), CREATE_INITIAL_TAB) => Ok(FromRelay::CreateInitialTab { id }),
            (id, _) => Err(ProtocolError::UnknownMethod { id, method }),
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            FromRelay::Ping => Frame::notification(PING, None),
            FromRelay::Pong => Frame::notification(PONG, None),
            FromRelay::ForwardCdpCommand { id, command } => Frame::request(
                *id,
                FORWARD_CDP_COMMAND,
                serde_json::to_value(command).ok(),
            ),
            FromRelay::CreateInitialTab { id } => Frame::request(*id, CREATE_INITIAL_TAB, None),
            FromRelay::ShowNotification(params) => {
                Frame::notification(SHOW_NOTIFICATION, serde_json::to_value(params).ok())
            }
        }
    }

    pub fn to_json(&self) -> String {
        to_json(&self.to_frame())
    }
}

fn to_json(frame: &Frame) -> String {
    // a `Frame` only holds strings, ids and json values
    serde_json::to_string(frame).unwrap_or_default()
}

#[derive(Debug)]
pub enum ProtocolError {
    Json(serde_json::Error),
    Malformed(&'static str),
    InvalidParams {
        method: &'static str,
        message: String,
    },
    /// The frame named a method outside of the protocol. `id` is set when the
    /// sender expects a response.
    UnknownMethod {
        id: Option<CallId>,
        method: String,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Json(err) => write!(f, "invalid json: {}", err),
            ProtocolError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            ProtocolError::InvalidParams { method, message } => {
                write!(f, "invalid params for {}: {}", method, message)
            }
            ProtocolError::UnknownMethod { method, .. } => write!(f, "Unknown method: {}", method),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err)
    }
}
