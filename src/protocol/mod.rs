use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// Highest app version (dotted digits concatenated, `9.8.8` -> `988`) that
// still speaks the legacy protocol.
pub const LEGACY_MAX_APP_VERSION: u32 = 988;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Stream,
    Fetch,
    Result,
    Progress,
    Failed,
    Select,
    SelectResult,
    Browser,
    BrowserResult,
    BrowserClick,
    BrowserUrlRequest,
    BrowserUrlFinished,
    BrowserClose,
    BrowserEvaluate,
    BrowserEvaluateResult,
    BrowserCookie,
    BrowserCookieResult,
    BrowserSetCookie,
    BrowserVisible,
}

impl Action {
    pub const ALL: [Action; 19] = [
        Action::Stream,
        Action::Fetch,
        Action::Result,
        Action::Progress,
        Action::Failed,
        Action::Select,
        Action::SelectResult,
        Action::Browser,
        Action::BrowserResult,
        Action::BrowserClick,
        Action::BrowserUrlRequest,
        Action::BrowserUrlFinished,
        Action::BrowserClose,
        Action::BrowserEvaluate,
        Action::BrowserEvaluateResult,
        Action::BrowserCookie,
        Action::BrowserCookieResult,
        Action::BrowserSetCookie,
        Action::BrowserVisible,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Stream => "stream",
            Action::Fetch => "fetch",
            Action::Result => "result",
            Action::Progress => "progress",
            Action::Failed => "failed",
            Action::Select => "select",
            Action::SelectResult => "select_result",
            Action::Browser => "browser",
            Action::BrowserResult => "browser_result",
            Action::BrowserClick => "browser_click",
            Action::BrowserUrlRequest => "browser_url_request",
            Action::BrowserUrlFinished => "browser_url_finished",
            Action::BrowserClose => "browser_close",
            Action::BrowserEvaluate => "browser_evaluate",
            Action::BrowserEvaluateResult => "browser_evaluate_result",
            Action::BrowserCookie => "browser_cookie",
            Action::BrowserCookieResult => "browser_cookie_result",
            Action::BrowserSetCookie => "browser_set_cookie",
            Action::BrowserVisible => "browser_visible",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownAction(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub action: Action,
    #[serde(rename = "__id", skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(rename = "data")]
    pub payload: Value,
}

impl Envelope {
    pub fn event(action: Action, payload: Value) -> Self {
        Self {
            action,
            exchange_id: None,
            payload,
        }
    }

    pub fn correlated(action: Action, exchange_id: impl Into<String>, payload: Value) -> Self {
        Self {
            action,
            exchange_id: Some(exchange_id.into()),
            payload,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Decodes a frame, unwrapping one level of legacy string encoding
/// (`"\"{...}\""`) before reading the envelope fields.
pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let value = match serde_json::from_slice::<Value>(raw)? {
        Value::String(inner) => serde_json::from_str(&inner)?,
        other => other,
    };
    let mut object = match value {
        Value::Object(object) => object,
        other => return Err(DecodeError::NotAnObject(json_kind(&other))),
    };

    let action = match object.remove("action") {
        Some(Value::String(action)) => action.parse::<Action>()?,
        Some(_) | None => return Err(DecodeError::MissingAction),
    };
    let exchange_id = match object.remove("__id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    let payload = match object.remove("data") {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(data) => data,
    };

    Ok(Envelope {
        action,
        exchange_id,
        payload,
    })
}

pub fn decode_str(raw: &str) -> Result<Envelope, DecodeError> {
    decode(raw.as_bytes())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRevision {
    Legacy,
    Current,
}

impl ProtocolRevision {
    pub fn for_app_version(version: &str) -> Self {
        let digits: String = version.chars().filter(char::is_ascii_digit).collect();
        match digits.parse::<u32>() {
            Ok(number) if number <= LEGACY_MAX_APP_VERSION => ProtocolRevision::Legacy,
            _ => ProtocolRevision::Current,
        }
    }

    pub fn requires_reply_id(self) -> bool {
        matches!(self, ProtocolRevision::Current)
    }
}
