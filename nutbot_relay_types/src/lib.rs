use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod extension;

/// Identifier of a request, unique per connection and direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

impl CallId {
    pub fn new(id: u64) -> Self {
        CallId(id)
    }
}

/// A cdp request as sent by a control client.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct Request {
    pub id: CallId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: CallId::new(id),
            method: method.into(),
            params,
            session_id: None,
        }
    }

    pub fn with_session(
        id: u64,
        method: impl Into<String>,
        params: Value,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::new(id, method, params)
        }
    }

    /// Returns the string param `name` if present.
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

/// A response to a [`Request`]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Response {
    /// Numeric identifier for the exact request
    pub id: CallId,
    /// The response payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The Reason why the [`Request`] failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Response {
    pub fn ok(id: CallId, result: Value, session_id: Option<String>) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            session_id,
        }
    }

    pub fn err(id: CallId, error: Error, session_id: Option<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
            session_id,
        }
    }
}

/// An unsolicited event, either produced by a tab or synthesized by the
/// relay
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct EventMessage {
    /// Name of the method
    pub method: Cow<'static, str>,
    /// Json params
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventMessage {
    pub fn new(method: impl Into<Cow<'static, str>>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    /// Error code
    pub code: i64,
    /// Error Message
    pub message: String,
}

impl Error {
    pub const SERVER_ERROR: i64 = -32000;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(Self::SERVER_ERROR, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

/// Metadata of a debuggable surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_id: Option<String>,
}

impl TargetInfo {
    pub fn page(target_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            r#type: "page".to_string(),
            title: String::new(),
            url: url.into(),
            attached: false,
            browser_context_id: None,
            opener_id: None,
        }
    }

    pub fn is_page(&self) -> bool {
        self.r#type == "page"
    }

    /// Whether auto-attached targets of this type are relayed at all
    pub fn is_page_or_iframe(&self) -> bool {
        self.is_page() || self.r#type == "iframe"
    }
}

/// `Target.attachedToTarget`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTarget {
    pub session_id: String,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

/// `Target.detachedFromTarget`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTarget {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

/// `Target.targetInfoChanged` and `Target.targetCreated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfoEvent {
    pub target_info: TargetInfo,
}

/// Identifiers of the protocol methods the relay inspects.
pub mod methods {
    pub const BROWSER_GET_VERSION: &str = "Browser.getVersion";
    pub const PAGE_ENABLE: &str = "Page.enable";

    pub const ATTACHED_TO_TARGET: &str = "Target.attachedToTarget";
    pub const DETACHED_FROM_TARGET: &str = "Target.detachedFromTarget";
    pub const TARGET_INFO_CHANGED: &str = "Target.targetInfoChanged";
    pub const TARGET_CREATED: &str = "Target.targetCreated";

    pub const SET_AUTO_ATTACH: &str = "Target.setAutoAttach";
    pub const SET_DISCOVER_TARGETS: &str = "Target.setDiscoverTargets";
    pub const GET_TARGETS: &str = "Target.getTargets";
    pub const GET_TARGET_INFO: &str = "Target.getTargetInfo";
    pub const ATTACH_TO_TARGET: &str = "Target.attachToTarget";
    pub const CREATE_TARGET: &str = "Target.createTarget";
    pub const CLOSE_TARGET: &str = "Target.closeTarget";
}
