use crate::error::ValidationError;
use crate::model::Headers;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PLUGIN_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenType {
    #[default]
    Player,
    Webview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Api,
    Webview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginMediaType {
    Multi,
    Movie,
    Tv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginVisibility {
    All,
    Android,
    Ios,
    Development,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebviewType {
    WebviewFlutter,
    FlutterInappwebview,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginMetadata {
    pub name: String,
    pub embed_url: String,
    pub author: String,
    pub image: String,
    pub official_website: String,
    pub open_type: OpenType,
    pub stream_type: StreamType,
    pub media_type: Option<PluginMediaType>,
    pub tv_embed_url: Option<String>,
    pub logo_background_color: Option<String>,
    pub headers: Option<Headers>,
    pub description: Option<String>,
    pub script: Option<String>,
    pub use_imdb: Option<bool>,
    pub visible: Option<PluginVisibility>,
    pub webview_type: Option<WebviewType>,
    pub allowed_domains: Option<Vec<String>>,
    pub version: Option<String>,
    pub query: Option<Vec<String>>,
    #[serde(rename = "_docId")]
    pub doc_id: Option<String>,
}

impl Default for PluginMetadata {
    fn default() -> Self {
        Self {
            name: "Unknwon".to_string(),
            embed_url: String::new(),
            author: "Unknown".to_string(),
            image: String::new(),
            official_website: String::new(),
            open_type: OpenType::Player,
            stream_type: StreamType::Api,
            media_type: None,
            tv_embed_url: None,
            logo_background_color: None,
            headers: None,
            description: None,
            script: None,
            use_imdb: None,
            visible: None,
            webview_type: None,
            allowed_domains: None,
            version: None,
            query: None,
            doc_id: None,
        }
    }
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, embed_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            embed_url: embed_url.into(),
            author: String::new(),
            ..Self::default()
        }
    }

    pub fn build(mut self) -> Result<Self, ValidationError> {
        let embed_url = self.embed_url.trim();
        if embed_url.is_empty() {
            return Err(ValidationError::Missing("embed_url"));
        }
        if !embed_url.starts_with("http") && !embed_url.starts_with("ws") {
            return Err(ValidationError::EmbedUrlScheme(embed_url.to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::Missing("name"));
        }

        self.query = Some(search_prefixes(&self.name));
        if self.version.as_deref().unwrap_or("").is_empty() {
            self.version = Some(DEFAULT_PLUGIN_VERSION.to_string());
        }
        self.blank_optionals();
        Ok(self)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    // Empty optional strings serialize as null rather than "".
    fn blank_optionals(&mut self) {
        for field in [
            &mut self.tv_embed_url,
            &mut self.logo_background_color,
            &mut self.description,
            &mut self.script,
            &mut self.doc_id,
        ] {
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
    }
}

fn search_prefixes(name: &str) -> Vec<String> {
    name.char_indices()
        .map(|(idx, ch)| name[..idx + ch.len_utf8()].to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_generates_prefix_query_and_default_version() {
        let meta = PluginMetadata::new("VidA", "https://embed.example.test/{media_id}")
            .build()
            .unwrap();
        assert_eq!(
            meta.query.unwrap(),
            vec!["v".to_string(), "vi".to_string(), "vid".to_string(), "vida".to_string()]
        );
        assert_eq!(meta.version.as_deref(), Some(DEFAULT_PLUGIN_VERSION));
    }

    #[test]
    fn build_keeps_explicit_version() {
        let mut meta = PluginMetadata::new("X", "wss://plugin.example.test");
        meta.version = Some("2.1.0".to_string());
        assert_eq!(meta.build().unwrap().version.as_deref(), Some("2.1.0"));
    }

    #[test]
    fn build_rejects_missing_or_bad_fields() {
        assert_eq!(
            PluginMetadata::new("X", "").build().unwrap_err(),
            ValidationError::Missing("embed_url")
        );
        assert!(matches!(
            PluginMetadata::new("X", "ftp://nope").build().unwrap_err(),
            ValidationError::EmbedUrlScheme(_)
        ));
        assert_eq!(
            PluginMetadata::new(" ", "https://ok.test").build().unwrap_err(),
            ValidationError::Missing("name")
        );
    }

    #[test]
    fn serializes_absent_fields_as_null() {
        let mut meta = PluginMetadata::new("X", "https://ok.test");
        meta.description = Some(String::new());
        let meta = meta.build().unwrap();
        let value: serde_json::Value = serde_json::from_str(&meta.to_json().unwrap()).unwrap();
        assert!(value["description"].is_null());
        assert_eq!(value["open_type"], "player");
        assert!(value.get("_docId").is_some());
    }
}
