use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tidechat_storage::DEFAULT_SESSION_TITLE;
use tidechat_transport::{
    BackendConfig, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT,
};

pub const SETTINGS_DIRECTORY_NAME: &str = "tidechat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "tidechat.db";
/// Environment overrides, e.g. `TIDECHAT_BACKEND__BASE_URL`.
pub const ENV_PREFIX: &str = "TIDECHAT_";
pub const DEFAULT_AUTO_TITLE_MAX_CHARS: usize = 20;
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Keys accepted by [`ChatSettings::with_value`].
pub const SETTABLE_KEYS: &[&str] = &[
    "backend.base_url",
    "backend.request_timeout_secs",
    "persistence",
    "default_session_name",
    "auto_title_max_chars",
    "log_level",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Where sessions and messages are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceSettings {
    /// The chat backend's own session API.
    #[default]
    Backend,
    Sqlite {
        #[serde(default = "default_database_path")]
        database_path: PathBuf,
    },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default = "default_session_name")]
    pub default_session_name: String,
    #[serde(default = "default_auto_title_max_chars")]
    pub auto_title_max_chars: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            persistence: PersistenceSettings::default(),
            default_session_name: default_session_name(),
            auto_title_max_chars: default_auto_title_max_chars(),
            log_level: default_log_level(),
        }
    }
}

impl ChatSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.backend.base_url, self.request_timeout())
    }

    /// Applies one `key value` pair. `persistence` takes `backend`, `memory`, `sqlite` or
    /// `sqlite:<path>`.
    pub fn with_value(mut self, key: &str, value: &str) -> Result<Self, SettingsError> {
        let value = value.trim();
        match key {
            "backend.base_url" => self.backend.base_url = value.to_string(),
            "backend.request_timeout_secs" => {
                self.backend.request_timeout_secs = value.parse().context(InvalidNumberSnafu {
                    stage: "set-request-timeout",
                    key,
                })?;
            }
            "persistence" => self.persistence = parse_persistence(value)?,
            "default_session_name" => self.default_session_name = value.to_string(),
            "auto_title_max_chars" => {
                self.auto_title_max_chars = value.parse().context(InvalidNumberSnafu {
                    stage: "set-auto-title-max-chars",
                    key,
                })?;
            }
            "log_level" => self.log_level = value.to_string(),
            _ => {
                return UnknownKeySnafu {
                    stage: "set-setting",
                    key,
                }
                .fail();
            }
        }
        Ok(self.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.backend.base_url = non_empty_or(self.backend.base_url, default_base_url);
        if self.backend.request_timeout_secs == 0 {
            self.backend.request_timeout_secs = default_request_timeout_secs();
        }
        self.backend.request_timeout_secs = self
            .backend
            .request_timeout_secs
            .min(MAX_REQUEST_TIMEOUT.as_secs());

        if let PersistenceSettings::Sqlite { database_path } = &mut self.persistence
            && database_path.as_os_str().is_empty()
        {
            *database_path = default_database_path();
        }

        self.default_session_name = non_empty_or(self.default_session_name, default_session_name);
        if self.auto_title_max_chars == 0 {
            self.auto_title_max_chars = default_auto_title_max_chars();
        }
        self.log_level = non_empty_or(self.log_level, default_log_level);

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tidechat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown setting '{key}'"))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("setting '{key}' expects a whole number: {source}"))]
    InvalidNumber {
        stage: &'static str,
        key: String,
        source: ParseIntError,
    },
    #[snafu(display("unknown persistence '{value}', expected backend, memory, sqlite or sqlite:<path>"))]
    UnknownPersistence { stage: &'static str, value: String },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn parse_persistence(value: &str) -> Result<PersistenceSettings, SettingsError> {
    match value {
        "backend" => Ok(PersistenceSettings::Backend),
        "memory" => Ok(PersistenceSettings::Memory),
        "sqlite" => Ok(PersistenceSettings::Sqlite {
            database_path: default_database_path(),
        }),
        other => match other.strip_prefix("sqlite:") {
            Some(path) => Ok(PersistenceSettings::Sqlite {
                database_path: PathBuf::from(path.trim()),
            }),
            None => UnknownPersistenceSnafu {
                stage: "parse-persistence",
                value: other,
            }
            .fail(),
        },
    }
}

fn non_empty_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".tidechat"))
        .join(DATABASE_FILE_NAME)
}

fn default_session_name() -> String {
    DEFAULT_SESSION_TITLE.to_string()
}

fn default_auto_title_max_chars() -> usize {
    DEFAULT_AUTO_TITLE_MAX_CHARS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
