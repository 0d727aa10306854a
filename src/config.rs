//! Console settings persisted in `settings.json`.

use anyhow::{Context, Result};
use madmail_core::client::PollPolicy;
use madmail_core::endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_VERSION: u32 = 1;

pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("madmail-admin")
}

pub fn get_settings_path() -> PathBuf {
    get_config_dir().join("settings.json")
}

pub fn get_servers_path() -> PathBuf {
    get_config_dir().join("servers.json")
}

fn default_poll_max_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_poll_initial_delay_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_version_check_interval_secs() -> u64 {
    300
}

fn default_cache_clear_timeout_ms() -> u64 {
    2000
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default)]
    pub version: u32,

    /// Endpoint of the last session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_token: Option<String>,

    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_initial_delay_ms")]
    pub poll_initial_delay_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_version_check_interval_secs")]
    pub version_check_interval_secs: u64,
    #[serde(default = "default_cache_clear_timeout_ms")]
    pub cache_clear_timeout_ms: u64,

    /// Origin serving the console build. Enables update detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_origin: Option<String>,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            last_url: None,
            last_token: None,
            poll_max_attempts: default_poll_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_initial_delay_ms: default_poll_initial_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            version_check_interval_secs: default_version_check_interval_secs(),
            cache_clear_timeout_ms: default_cache_clear_timeout_ms(),
            asset_origin: None,
        }
    }
}

impl ConsoleSettings {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.poll_max_attempts.max(1),
            interval: Duration::from_millis(self.poll_interval_ms),
            initial_delay: Duration::from_millis(self.poll_initial_delay_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn version_check_interval(&self) -> Duration {
        Duration::from_secs(self.version_check_interval_secs.max(1))
    }

    pub fn cache_clear_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_clear_timeout_ms)
    }

    /// Remember the credentials of a live session.
    pub fn remember(&mut self, url: &str, token: &str) {
        self.last_url = Some(url.to_string());
        self.last_token = Some(token.to_string());
    }

    pub fn forget(&mut self) {
        self.last_url = None;
        self.last_token = None;
    }
}

/// Load settings from the default location.
pub fn load_settings() -> ConsoleSettings {
    load_settings_from(&get_settings_path())
}

/// Load settings, recovering what it can from a damaged file and running
/// migrations. Never fails; the worst case is defaults.
pub fn load_settings_from(path: &Path) -> ConsoleSettings {
    if !path.exists() {
        log::info!("Settings file not found at {}, using defaults", path.display());
        return ConsoleSettings::default();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::error!("Failed to read settings file {}: {}", path.display(), e);
            return ConsoleSettings::default();
        }
    };

    let settings = match serde_json::from_str::<ConsoleSettings>(&content) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Failed to parse settings directly: {}, attempting partial recovery", e);
            match recover_settings_from_json(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    log::error!("Failed to recover settings from {}: {}", path.display(), e);
                    return ConsoleSettings::default();
                }
            }
        }
    };

    let (settings, changed) = migrate_settings(settings);
    if changed {
        if let Err(e) = save_settings_to(path, &settings) {
            log::warn!("Failed to save migrated settings: {}", e);
        }
    }
    settings
}

/// Pull the recognisable fields out of a file that no longer matches the
/// schema.
fn recover_settings_from_json(content: &str) -> Result<ConsoleSettings> {
    let value: serde_json::Value =
        serde_json::from_str(content).context("Settings file is not valid JSON")?;
    let obj = value
        .as_object()
        .context("Settings file root is not a JSON object")?;

    let mut settings = ConsoleSettings {
        version: 0,
        ..Default::default()
    };
    let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| obj.get(key).and_then(|v| v.as_u64());

    if let Some(v) = number("version") {
        settings.version = v as u32;
    }
    settings.last_url = text("last_url");
    settings.last_token = text("last_token");
    settings.asset_origin = text("asset_origin");
    if let Some(v) = number("poll_max_attempts") {
        settings.poll_max_attempts = (v as u32).clamp(1, 100);
    }
    if let Some(v) = number("poll_interval_ms") {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = number("poll_initial_delay_ms") {
        settings.poll_initial_delay_ms = v;
    }
    if let Some(v) = number("version_check_interval_secs") {
        settings.version_check_interval_secs = v;
    }
    if let Some(v) = number("cache_clear_timeout_ms") {
        settings.cache_clear_timeout_ms = v;
    }
    Ok(settings)
}

/// Returns the migrated settings and whether anything changed.
fn migrate_settings(mut settings: ConsoleSettings) -> (ConsoleSettings, bool) {
    let original = settings.clone();

    if settings.version == 0 {
        log::info!("Migrating settings from pre-versioning (v0) to v1");
        settings.version = 1;
    }

    // Saved URLs from before relocatable admin paths only carry the origin
    if let Some(url) = settings.last_url.as_deref() {
        let migrated = endpoint::migrate_saved(url);
        if migrated != url {
            log::info!("Saved endpoint migrated to {}", migrated);
            settings.last_url = Some(migrated);
        }
    }

    let changed = settings != original;
    (settings, changed)
}

/// Write settings atomically. The file carries the admin token, so it is
/// only readable by the owner.
pub fn save_settings_to(path: &Path, settings: &ConsoleSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));
        assert_eq!(settings, ConsoleSettings::default());
        assert_eq!(settings.poll_policy(), PollPolicy::default());
    }

    #[test]
    fn legacy_origin_only_url_is_migrated_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"last_url":"https://mail.example.org/","last_token":"t"}"#).unwrap();

        let settings = load_settings_from(&path);

        assert_eq!(settings.last_url.as_deref(), Some("https://mail.example.org/api/admin"));
        assert_eq!(settings.version, SETTINGS_VERSION);
        let saved: ConsoleSettings = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.last_url, settings.last_url);
    }

    #[test]
    fn relocated_url_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = ConsoleSettings::default();
        settings.remember("https://h/hidden", "t");
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn damaged_file_is_partially_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"version":1,"last_url":"https://h/api/admin","poll_max_attempts":"many","poll_interval_ms":500}"#,
        )
        .unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.last_url.as_deref(), Some("https://h/api/admin"));
        assert_eq!(settings.poll_max_attempts, 10);
        assert_eq!(settings.poll_interval_ms, 500);
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        save_settings_to(&path, &ConsoleSettings::default()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
