use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use hilo_chat::{DEFAULT_DISPLAY_LIMIT, DEFAULT_HISTORY_WINDOW, DispatcherConfig};
use hilo_llm::HttpBackendConfig;
use hilo_storage::SessionId;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787/chat";
pub const SETTINGS_DIRECTORY_NAME: &str = "hilo";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "messages.db";
pub const ENV_PREFIX: &str = "HILO_";
pub const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Empty means `messages.db` next to the settings file.
    #[serde(default)]
    pub database_path: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_display_limit")]
    pub display_limit: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            database_path: String::new(),
            session_id: None,
            history_window: default_history_window(),
            display_limit: default_display_limit(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.database_path = self.database_path.trim().to_string();
        self.session_id = self
            .session_id
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
        if self.display_limit == 0 {
            self.display_limit = default_display_limit();
        }
        self
    }

    pub fn backend_config(&self) -> HttpBackendConfig {
        let api_key = (!self.api_key.is_empty()).then(|| self.api_key.clone());
        HttpBackendConfig::new(&self.endpoint, api_key)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            history_window: self.history_window,
            display_limit: self.display_limit,
        }
    }

    /// Resolves where messages live. `:memory:` is passed through untouched.
    pub fn database_location(&self, config_dir: &Path) -> String {
        if self.database_path.is_empty() {
            return config_dir.join(DATABASE_FILE_NAME).display().to_string();
        }
        self.database_path.clone()
    }

    pub fn uses_memory_database(&self) -> bool {
        self.database_path == MEMORY_DATABASE
    }

    /// Returns the configured session, ignoring an id that does not parse.
    pub fn session(&self) -> Option<SessionId> {
        let raw = self.session_id.as_deref()?;
        match SessionId::parse(raw) {
            Ok(session_id) => Some(session_id),
            Err(error) => {
                tracing::warn!(session_id = raw, error = %error, "ignoring invalid session id");
                None
            }
        }
    }
}

pub struct SettingsStore {
    settings: ArcSwap<ChatSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".hilo"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Layers defaults, the JSON file and `HILO_*` environment variables.
    pub fn new(config_path: PathBuf) -> Self {
        Self::open(config_path, true)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Reads only the file layer. Environment overrides are skipped.
    pub fn from_file(config_path: PathBuf) -> Self {
        Self::open(config_path, false)
    }

    fn open(config_path: PathBuf, with_env: bool) -> Self {
        let settings = Self::load_from(&config_path, with_env);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> SettingsResult<()> {
        let settings = settings.normalized();
        self.persist(&settings)?;
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    /// Returns the configured session, creating and saving a new one when absent.
    pub fn ensure_session(&self) -> SettingsResult<SessionId> {
        let current = self.settings();
        if let Some(session_id) = current.session() {
            return Ok(session_id);
        }

        let session_id = SessionId::new_v7();
        // Only the file layer is written back, so env overrides stay out of it.
        let mut on_disk = Self::load_from(&self.config_path, false);
        on_disk.session_id = Some(session_id.to_string());
        self.persist(&on_disk)?;

        let mut next = ChatSettings::clone(&current);
        next.session_id = on_disk.session_id;
        self.settings.store(Arc::new(next));
        tracing::info!(session_id = %session_id, "started new chat session");
        Ok(session_id)
    }

    fn load_from(path: &Path, with_env: bool) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
        }
        if with_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX));
        }

        figment
            .extract::<ChatSettings>()
            .map(ChatSettings::normalized)
            .unwrap_or_else(|error| {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "unreadable settings, using defaults"
                );
                ChatSettings::default()
            })
    }

    /// Writes a sibling temp file, then renames it over the real one.
    fn persist(&self, settings: &ChatSettings) -> SettingsResult<()> {
        let target = &self.config_path;
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir).context(CreateConfigDirSnafu {
                stage: "settings-create-dir",
                path: dir.to_path_buf(),
            })?;
        }

        let encoded = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "settings-encode",
        })?;
        let staged = target.with_extension("json.tmp");
        std::fs::write(&staged, encoded).context(WriteSnafu {
            stage: "settings-write-staged",
            path: staged.clone(),
        })?;
        std::fs::rename(&staged, target).context(ReplaceSnafu {
            stage: "settings-replace",
            path: target.clone(),
        })?;

        tracing::debug!(path = %target.display(), "settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create config directory {path:?} on `{stage}`: {source}"))]
    CreateConfigDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {path:?} on `{stage}`: {source}"))]
    Write {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot replace {path:?} on `{stage}`: {source}"))]
    Replace {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SettingsError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::CreateConfigDir { stage, .. }
            | Self::Encode { stage, .. }
            | Self::Write { stage, .. }
            | Self::Replace { stage, .. } => stage,
        }
    }
}

pub type SettingsResult<T> = Result<T, SettingsError>;

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}

fn default_display_limit() -> usize {
    DEFAULT_DISPLAY_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::from_file(dir.path().join(SETTINGS_FILE_NAME));

        let settings = store.settings();
        assert_eq!(*settings, ChatSettings::default());
        assert_eq!(settings.history_window, 20);
        assert_eq!(settings.display_limit, 200);
    }

    #[test]
    fn partial_file_is_layered_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{ "endpoint": "  https://chat.example/stream  ", "history_window": 5 }"#,
        )
        .unwrap();

        let settings = SettingsStore::from_file(path).settings();
        assert_eq!(settings.endpoint, "https://chat.example/stream");
        assert_eq!(settings.history_window, 5);
        assert_eq!(settings.display_limit, DEFAULT_DISPLAY_LIMIT);
        assert!(settings.backend_config().api_key.is_none());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(
            *SettingsStore::from_file(path).settings(),
            ChatSettings::default()
        );
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::from_file(path.clone());

        store
            .update(ChatSettings {
                endpoint: "   ".to_string(),
                api_key: " secret ".to_string(),
                ..ChatSettings::default()
            })
            .unwrap();

        assert_eq!(store.settings().endpoint, DEFAULT_ENDPOINT);
        assert_eq!(store.settings().api_key, "secret");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::from_file(path).settings();
        assert_eq!(reloaded.api_key, "secret");
        assert_eq!(
            reloaded.backend_config().api_key.as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn ensure_session_is_stable_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);

        let first = SettingsStore::from_file(path.clone())
            .ensure_session()
            .unwrap();
        let second = SettingsStore::from_file(path).ensure_session().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn database_location_defaults_next_to_settings() {
        let settings = ChatSettings::default();
        let location = settings.database_location(Path::new("/tmp/hilo"));
        assert!(location.ends_with(DATABASE_FILE_NAME));

        let memory = ChatSettings {
            database_path: MEMORY_DATABASE.to_string(),
            ..ChatSettings::default()
        };
        assert!(memory.uses_memory_database());
        assert_eq!(memory.database_location(Path::new("/tmp/hilo")), ":memory:");
    }
}
