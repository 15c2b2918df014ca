use crate::error::DecodeError;
use crate::plugin::PluginMetadata;
use crate::protocol::ProtocolRevision;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub type Headers = BTreeMap<String, String>;

pub const DEFAULT_FAILURE_STATUS: u16 = 500;
pub const DEFAULT_FAILURE_MESSAGE: &str =
    "An unexpected error occurred while we tried to load the resource you've requested.";
pub const DEFAULT_AXIOS_CDN: &str = "https://cdn.jsdelivr.net/npm/axios@1.8.4/dist/axios.min.js";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Tv,
}

impl MediaKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "movie" => Some(MediaKind::Movie),
            "tv" => Some(MediaKind::Tv),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Tv => "tv",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub media_id: String,
    pub media_kind: Option<MediaKind>,
    pub season_id: Option<String>,
    pub episode_id: Option<String>,
    pub extra: Option<Value>,
}

impl MediaRequest {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            media_kind: None,
            season_id: None,
            episode_id: None,
            extra: None,
        }
    }

    pub fn movie(media_id: impl Into<String>) -> Self {
        Self {
            media_kind: Some(MediaKind::Movie),
            ..Self::new(media_id)
        }
    }

    pub fn episode(
        media_id: impl Into<String>,
        season_id: impl Into<String>,
        episode_id: impl Into<String>,
    ) -> Self {
        Self {
            media_kind: Some(MediaKind::Tv),
            season_id: Some(season_id.into()),
            episode_id: Some(episode_id.into()),
            ..Self::new(media_id)
        }
    }

    pub fn from_payload(payload: &Value, revision: ProtocolRevision) -> Result<Self, DecodeError> {
        let keys = MediaKeys::for_revision(revision);
        let media_id = payload
            .get(keys.id)
            .and_then(scalar_to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                DecodeError::InvalidPayload(format!("stream payload is missing `{}`", keys.id))
            })?;

        Ok(Self {
            media_id,
            media_kind: payload
                .get(keys.kind)
                .and_then(Value::as_str)
                .and_then(MediaKind::parse),
            season_id: payload.get(keys.season).and_then(scalar_to_string),
            episode_id: payload.get(keys.episode).and_then(scalar_to_string),
            extra: keys
                .extra
                .and_then(|key| payload.get(key))
                .filter(|v| !v.is_null())
                .cloned(),
        })
    }

    pub fn to_payload(&self, revision: ProtocolRevision) -> Value {
        let keys = MediaKeys::for_revision(revision);
        let mut out = Map::new();
        out.insert(keys.id.to_string(), json!(self.media_id));
        if let Some(kind) = self.media_kind {
            out.insert(keys.kind.to_string(), json!(kind.as_str()));
        }
        if let Some(season) = &self.season_id {
            out.insert(keys.season.to_string(), json!(season));
        }
        if let Some(episode) = &self.episode_id {
            out.insert(keys.episode.to_string(), json!(episode));
        }
        if let (Some(key), Some(extra)) = (keys.extra, &self.extra) {
            out.insert(key.to_string(), extra.clone());
        }
        Value::Object(out)
    }

    pub fn describe(&self) -> String {
        match (&self.season_id, &self.episode_id) {
            (Some(season), Some(episode)) => {
                format!("{} season {} episode {}", self.media_id, season, episode)
            }
            _ => self.media_id.clone(),
        }
    }
}

struct MediaKeys {
    id: &'static str,
    kind: &'static str,
    season: &'static str,
    episode: &'static str,
    extra: Option<&'static str>,
}

impl MediaKeys {
    fn for_revision(revision: ProtocolRevision) -> Self {
        match revision {
            ProtocolRevision::Legacy => Self {
                id: "i",
                kind: "t",
                season: "s",
                episode: "e",
                extra: None,
            },
            ProtocolRevision::Current => Self {
                id: "media_id",
                kind: "media_type",
                season: "season_id",
                episode: "episode_id",
                extra: Some("data"),
            },
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_name: String,
    pub package_name: String,
    pub version: String,
    #[serde(default)]
    pub build_number: Option<String>,
    #[serde(default)]
    pub install_store: Option<String>,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            app_name: "MerlMovie".to_string(),
            package_name: "com.example.app".to_string(),
            version: "9.8.8".to_string(),
            build_number: Some("0".to_string()),
            install_store: Some("unknown".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub os: String,
    #[serde(default)]
    pub os_version: String,
    pub model: String,
    #[serde(default)]
    pub is_physical: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            os: "unknown".to_string(),
            os_version: "unknown".to_string(),
            model: "Unknwon".to_string(),
            is_physical: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientIdentity {
    #[serde(rename = "app_info")]
    pub app: AppInfo,
    #[serde(rename = "device_info")]
    pub device: DeviceInfo,
    #[serde(rename = "plugin_info")]
    pub plugin: PluginMetadata,
}

impl ClientIdentity {
    pub fn revision(&self) -> ProtocolRevision {
        ProtocolRevision::for_app_version(&self.app.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Dynamic,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchApi {
    #[default]
    Http,
    Axios,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxiosOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub response_type: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub api: FetchApi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axios: Option<AxiosOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_origin: Option<String>,
}

fn default_method() -> String {
    "get".to_string()
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: Headers::new(),
            body: None,
            response_type: ResponseKind::Dynamic,
            timeout: None,
            api: FetchApi::Http,
            axios: None,
            initial_origin: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Value>) -> Self {
        Self::new(url).method("post").body(body)
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn response_type(mut self, kind: ResponseKind) -> Self {
        self.response_type = kind;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn initial_origin(mut self, origin: impl Into<String>) -> Self {
        self.initial_origin = Some(origin.into());
        self
    }

    pub fn wants_bytes(&self) -> bool {
        self.response_type == ResponseKind::Bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchBody {
    Empty,
    Bytes(Vec<u8>),
    Json(Value),
    Text(String),
}

impl FetchBody {
    pub fn from_wire(value: Value, kind: ResponseKind) -> Self {
        match (value, kind) {
            (Value::Null, _) => FetchBody::Empty,
            (Value::Array(items), ResponseKind::Bytes) => {
                let bytes: Option<Vec<u8>> = items
                    .iter()
                    .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                    .collect();
                match bytes {
                    Some(bytes) => FetchBody::Bytes(bytes),
                    None => FetchBody::Json(Value::Array(items)),
                }
            }
            (Value::String(text), ResponseKind::Bytes) => FetchBody::Bytes(text.into_bytes()),
            // The executing side already decided text versus JSON.
            (Value::String(text), ResponseKind::Dynamic) => FetchBody::Text(text),
            (other, _) => FetchBody::Json(other),
        }
    }

    // Best-effort: JSON when the text parses, otherwise the text itself.
    pub fn from_text(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => FetchBody::Json(value),
            Err(_) => FetchBody::Text(text),
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            FetchBody::Empty => Value::Null,
            FetchBody::Bytes(bytes) => Value::Array(bytes.iter().map(|b| json!(b)).collect()),
            FetchBody::Json(value) => value.clone(),
            FetchBody::Text(text) => Value::String(text.clone()),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            FetchBody::Empty => Value::Null,
            FetchBody::Bytes(bytes) => Value::Array(bytes.into_iter().map(|b| json!(b)).collect()),
            FetchBody::Json(value) => value,
            FetchBody::Text(text) => Value::String(text),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FetchBody::Text(text) => Some(text),
            FetchBody::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FetchBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: FetchBody,
    pub headers: Headers,
}

impl FetchResponse {
    pub fn from_reply(payload: &Value, kind: ResponseKind) -> Self {
        let status = payload
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0);
        let body = FetchBody::from_wire(payload.get("body").cloned().unwrap_or(Value::Null), kind);
        let headers = payload.get("headers").map(headers_from_value).unwrap_or_default();
        Self {
            status,
            body,
            headers,
        }
    }

    pub fn to_reply(&self) -> Value {
        json!({
            "status": self.status,
            "body": self.body.to_wire(),
            "headers": self.headers,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

pub fn headers_from_value(value: &Value) -> Headers {
    let Some(object) = value.as_object() else {
        return Headers::new();
    };
    object
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipIntro {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLink {
    pub name: String,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_proxy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_intro: Option<SkipIntro>,
}

impl QualityLink {
    pub fn new(name: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            headers: None,
            use_proxy: None,
            skip_intro: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleRootType {
    Fetch,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleExtension {
    Gz,
    Zip,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleKey {
    pub name: String,
    pub link: String,
    pub extension: SubtitleExtension,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleLink {
    pub name: String,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub root_type: Option<SubtitleRootType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SubtitleKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectLinkStatus {
    FinalResult,
    ProgressStatus,
    WebviewPlayer,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectLink {
    #[serde(default)]
    pub qualities: Vec<QualityLink>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DirectLinkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub status: u16,
    pub message: String,
}

impl FailurePayload {
    pub fn new(status: Option<u16>, message: Option<String>) -> Self {
        Self {
            status: status.unwrap_or(DEFAULT_FAILURE_STATUS),
            message: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        Self::new(
            value
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok()),
            value.get("message").and_then(Value::as_str).map(str::to_string),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    #[default]
    Poster,
    Banner,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub image_type: ImageType,
    #[serde(default)]
    pub data: Value,
}

impl SelectItem {
    pub fn new(title: impl Into<String>, data: Value) -> Self {
        Self {
            title: title.into(),
            data,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowserWebType {
    #[serde(rename = "web_0")]
    Web0,
    #[serde(rename = "web_1")]
    Web1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Yes,
    #[default]
    No,
}

impl Visibility {
    pub fn is_visible(self) -> bool {
        self == Visibility::Yes
    }
}

impl From<bool> for Visibility {
    fn from(show: bool) -> Self {
        if show {
            Visibility::Yes
        } else {
            Visibility::No
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    pub url: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub web_type: Option<BrowserWebType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default)]
    pub visible: Visibility,
}

impl BrowserInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            web_type: None,
            headers: None,
            visible: Visibility::No,
        }
    }

    pub fn visible(mut self, visible: Visibility) -> Self {
        self.visible = visible;
        self
    }
}
