//! Settings file for the panel.
//!
//! Lives at `~/.config/alarmpanel/config.toml` unless `ALARMPANEL_CONFIG`
//! points somewhere else. Every section is optional; missing keys fall back to
//! their defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mqtt::config::SessionConfig;
use crate::mqtt::reconnect::{ExponentialBackoff, NoRetry, ReconnectPolicy};

const CONFIG_DIR: &str = ".config/alarmpanel";
const CONFIG_FILE: &str = "config.toml";
const MODE_FILE: &str = "mode.toml";
const AUDIT_FILE: &str = "audit.jsonl";
const CONFIG_ENV: &str = "ALARMPANEL_CONFIG";

pub const DEFAULT_CODE: &str = "1234";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub alarm: AlarmSettings,
    pub timers: TimerSettings,
    pub reconnect: ReconnectSettings,
    pub audit: AuditSettings,
    pub network: NetworkSettings,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub client_id: String,
    pub state_topic: String,
    pub command_topic: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            host: session.host,
            port: session.port,
            tls: session.tls,
            username: session.username,
            password: session.password,
            client_id: session.client_id,
            state_topic: session.state_topic,
            command_topic: session.command_topic,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AlarmSettings {
    /// Seconds the disable dialog counts down while pending.
    pub pending_time: u32,
    /// Kept as text so leading zeros survive.
    pub code: String,
    pub first_time: bool,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            pending_time: 60,
            code: String::new(),
            first_time: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TimerSettings {
    pub inactivity_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            inactivity_secs: 300,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        Self {
            enabled: true,
            initial_ms: backoff.initial.as_millis() as u64,
            max_ms: backoff.max.as_millis() as u64,
            max_attempts: backoff.max_attempts,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AuditSettings {
    /// Defaults to `audit.jsonl` next to the settings file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkSettings {
    pub check_interval_secs: u64,
    pub check_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            check_timeout_ms: 3000,
        }
    }
}

impl Settings {
    /// Where the settings file is read from and written to.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;

        let settings: Settings = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?;
        settings
            .validate()
            .map_err(|e| eyre!("Invalid settings in {}: {}", path.display(), e))?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Checks values serde accepts but the panel cannot use. An empty code is
    /// allowed; it is replaced on first run and never verifies otherwise.
    pub fn validate(&self) -> Result<()> {
        let code = &self.alarm.code;
        if !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(eyre!("alarm.code must contain only digits"));
        }
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file {}: {}", path.display(), e))?;

        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Writes a default settings file if none exists yet.
    pub async fn ensure_default(path: &Path) -> Result<()> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?;

        if !exists {
            info!("Creating default settings at {}", path.display());
            Settings::default().save(path).await?;
        }
        Ok(())
    }

    /// Stores the default disarm code on first start. Returns whether this was
    /// the first run; the caller persists the settings afterwards.
    pub fn apply_first_run(&mut self) -> bool {
        if !self.alarm.first_time {
            return false;
        }
        info!("First start, setting default disarm code");
        self.alarm.code = DEFAULT_CODE.to_string();
        self.alarm.first_time = false;
        true
    }

    pub fn verify_code(&self, input: &str) -> bool {
        !self.alarm.code.is_empty() && self.alarm.code == input.trim()
    }

    pub fn to_session_config(&self) -> SessionConfig {
        let mqtt = &self.mqtt;
        SessionConfig {
            host: mqtt.host.trim().to_string(),
            port: mqtt.port,
            username: mqtt.username.clone().filter(|user| !user.is_empty()),
            password: mqtt.password.clone().filter(|pass| !pass.is_empty()),
            tls: mqtt.tls,
            client_id: mqtt.client_id.clone(),
            state_topic: mqtt.state_topic.clone(),
            command_topic: mqtt.command_topic.clone(),
            pending_delay_secs: self.alarm.pending_time,
        }
    }

    pub fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        let reconnect = &self.reconnect;
        if !reconnect.enabled {
            return Arc::new(NoRetry);
        }
        if reconnect.initial_ms == 0 || reconnect.max_ms < reconnect.initial_ms {
            warn!(
                "Reconnect delays {}ms..{}ms make no sense, using defaults",
                reconnect.initial_ms, reconnect.max_ms
            );
            return Arc::new(ExponentialBackoff::default());
        }
        Arc::new(ExponentialBackoff {
            initial: Duration::from_millis(reconnect.initial_ms),
            max: Duration::from_millis(reconnect.max_ms),
            max_attempts: reconnect.max_attempts,
        })
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.timers.inactivity_secs)
    }

    pub fn audit_file(&self, settings_path: &Path) -> PathBuf {
        self.audit
            .file
            .clone()
            .unwrap_or_else(|| sibling(settings_path, AUDIT_FILE))
    }

    pub fn mode_file(&self, settings_path: &Path) -> PathBuf {
        sibling(settings_path, MODE_FILE)
    }
}

fn sibling(settings_path: &Path, name: &str) -> PathBuf {
    settings_path
        .parent()
        .map(|dir| dir.join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_uses_defaults_for_the_rest() {
        let settings: Settings = toml::from_str(
            r#"
            [mqtt]
            host = "broker.lan"
            username = "panel"

            [alarm]
            pending_time = 30
            "#,
        )
        .unwrap();

        assert_eq!(settings.mqtt.host, "broker.lan");
        assert_eq!(settings.mqtt.port, 1883);
        assert_eq!(settings.alarm.pending_time, 30);
        assert!(settings.alarm.first_time);
        assert_eq!(settings.timers, TimerSettings::default());

        let session = settings.to_session_config();
        assert_eq!(session.username.as_deref(), Some("panel"));
        assert_eq!(session.password, None);
        assert_eq!(session.pending_delay_secs, 30);
        assert!(session.validate().is_ok());
    }

    #[test]
    fn first_run_sets_default_code_once() {
        let mut settings = Settings::default();
        assert!(!settings.verify_code("1234"));

        assert!(settings.apply_first_run());
        assert!(settings.verify_code("1234"));
        assert!(!settings.verify_code("4321"));

        assert!(!settings.apply_first_run());
    }

    #[test]
    fn disabled_reconnect_never_retries() {
        let mut settings = Settings::default();
        settings.reconnect.enabled = false;
        assert_eq!(settings.reconnect_policy().next_delay(1), None);

        settings.reconnect.enabled = true;
        assert_eq!(
            settings.reconnect_policy().next_delay(1),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn data_files_sit_next_to_settings() {
        let settings = Settings::default();
        let path = Path::new("/etc/alarmpanel/config.toml");
        assert_eq!(
            settings.audit_file(path),
            PathBuf::from("/etc/alarmpanel/audit.jsonl")
        );
        assert_eq!(
            settings.mode_file(path),
            PathBuf::from("/etc/alarmpanel/mode.toml")
        );
    }

    #[tokio::test]
    async fn ensure_default_then_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        Settings::ensure_default(&path).await.unwrap();
        let mut settings = Settings::load(&path).await.unwrap();
        assert_eq!(settings, Settings::default());

        settings.apply_first_run();
        settings.save(&path).await.unwrap();
        Settings::ensure_default(&path).await.unwrap();

        let reloaded = Settings::load(&path).await.unwrap();
        assert!(!reloaded.alarm.first_time);
        assert_eq!(reloaded.alarm.code, DEFAULT_CODE);
    }

    #[tokio::test]
    async fn non_numeric_code_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        tokio::fs::write(&path, "[alarm]\ncode = \"12ab\"\n").await.unwrap();
        let err = Settings::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("alarm.code"));

        tokio::fs::write(&path, "[alarm]\ncode = \"0042\"\n").await.unwrap();
        assert_eq!(Settings::load(&path).await.unwrap().alarm.code, "0042");

        tokio::fs::write(&path, "[alarm]\ncode = \"\"\n").await.unwrap();
        assert!(Settings::load(&path).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[mqtt\nhost = ").await.unwrap();
        assert!(Settings::load(&path).await.is_err());
    }
}
