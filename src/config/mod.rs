use crate::model::{AppInfo, ClientIdentity, DeviceInfo};
use crate::plugin::PluginMetadata;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "PLUGIN_BRIDGE_";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub progress: ProgressConfig,
    pub exchange: ExchangeConfig,
    pub harness: HarnessConfig,
    pub plugin: PluginMetadata,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            progress: ProgressConfig::default(),
            exchange: ExchangeConfig::default(),
            harness: HarnessConfig::default(),
            plugin: PluginMetadata::new(
                "Demo Embed",
                "https://embed.example.test/{media_type}/{media_id}",
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct IdentityConfig {
    pub app: AppInfo,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub step: u8,
    pub interval_ms: u64,
    pub cap: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            step: 3,
            interval_ms: 2000,
            cap: 90,
        }
    }
}

impl ProgressConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub timeout_secs: Option<u64>,
    pub finish_delay_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            finish_delay_ms: 1000,
        }
    }
}

impl ExchangeConfig {
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn finish_delay(&self) -> Duration {
        Duration::from_millis(self.finish_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectPolicy {
    #[default]
    First,
    None,
}

impl FromStr for SelectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(SelectPolicy::First),
            "none" => Ok(SelectPolicy::None),
            other => Err(format!("unknown select policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub app_version: String,
    pub select: SelectPolicy,
    pub timeout_secs: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            app_version: "9.8.9".to_string(),
            select: SelectPolicy::First,
            timeout_secs: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file");
                }
            }
        }

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.apply_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server settings
        if let Some(val) = lookup("HOST") {
            self.server.host = val;
        }
        if let Some(val) = lookup("PORT") {
            self.server.port = val.parse()?;
        }

        // Exchange settings
        if let Some(val) = lookup("EXCHANGE_TIMEOUT_SECS") {
            self.exchange.timeout_secs = if val.trim().is_empty() {
                None
            } else {
                Some(val.parse()?)
            };
        }
        if let Some(val) = lookup("FINISH_DELAY_MS") {
            self.exchange.finish_delay_ms = val.parse()?;
        }

        // Progress settings
        if let Some(val) = lookup("PROGRESS_STEP") {
            self.progress.step = val.parse()?;
        }
        if let Some(val) = lookup("PROGRESS_INTERVAL_MS") {
            self.progress.interval_ms = val.parse()?;
        }
        if let Some(val) = lookup("PROGRESS_CAP") {
            self.progress.cap = val.parse()?;
        }

        // Harness settings
        if let Some(val) = lookup("HARNESS_APP_VERSION") {
            self.harness.app_version = val;
        }
        if let Some(val) = lookup("HARNESS_SELECT") {
            self.harness.select = val.parse()?;
        }
        if let Some(val) = lookup("HARNESS_TIMEOUT_SECS") {
            self.harness.timeout_secs = if val.trim().is_empty() {
                None
            } else {
                Some(val.parse()?)
            };
        }

        // Plugin settings
        if let Some(val) = lookup("PLUGIN_NAME") {
            self.plugin.name = val;
        }
        if let Some(val) = lookup("PLUGIN_EMBED_URL") {
            self.plugin.embed_url = val;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.server.host.trim().is_empty() {
            return Err("server.host must be set".into());
        }
        if self.progress.step == 0 {
            return Err("progress.step must be non-zero".into());
        }
        if self.progress.cap >= 100 || self.progress.cap < self.progress.step {
            return Err("progress.cap must be below 100 and at least progress.step".into());
        }
        if self.progress.interval_ms < 100 {
            return Err("progress.interval_ms must be >= 100".into());
        }
        if self.exchange.timeout_secs == Some(0) {
            return Err("exchange.timeout_secs must be non-zero when set".into());
        }
        if self.harness.app_version.trim().is_empty() {
            return Err("harness.app_version must be set".into());
        }
        self.plugin.clone().build()?;
        Ok(())
    }

    pub fn default_identity(&self) -> Arc<ClientIdentity> {
        Arc::new(ClientIdentity {
            app: self.identity.app.clone(),
            device: self.identity.device.clone(),
            plugin: PluginMetadata::default(),
        })
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .or_else(|_| env::var("APPDATA"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join("plugin-bridge").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
