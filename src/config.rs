//! Persisted engine configuration: accounts, schedule, rate-limit presets,
//! retention policy and run history, loaded from and saved to a typed TOML
//! settings file under the platform config directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::constants::{
    AGGRESSIVE_BASE_MS, AGGRESSIVE_MAX_MS, AGGRESSIVE_MULTIPLIER, BALANCED_BASE_MS,
    BALANCED_MAX_MS, BALANCED_MULTIPLIER, CONSERVATIVE_BASE_MS, CONSERVATIVE_MAX_MS,
    CONSERVATIVE_MULTIPLIER, DEFAULT_HISTORY_RETENTION, DEFAULT_IMAP_PORT,
    DEFAULT_STREAM_THRESHOLD_BYTES,
};
use crate::history::HistoryEntry;
use crate::scheduler::ScheduleMode;

/// Authentication method for an account, modeled as a sum type (not an
/// optional-everything struct) so every call site must handle both variants
/// exhaustively -- per the spec's resolved Open Question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    OAuth2 {
        provider: String,
        client_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier, immutable for the account's lifetime. Used as the
    /// keychain key and (sanitized) as the backup-tree directory name.
    pub id: String,
    pub email: String,
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Login identity sent to the server; defaults to `email` if unset.
    #[serde(default)]
    pub login: Option<String>,
    pub auth: AuthMethod,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Per-account rate-limit override; falls back to the global preset when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitPreset>,
}

impl AccountConfig {
    pub fn login_identity(&self) -> &str {
        self.login.as_deref().unwrap_or(&self.email)
    }

    pub fn host_lower(&self) -> String {
        self.host.to_lowercase()
    }
}

/// Rate-limit tuning: one of the three named presets, or an explicit custom triple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "preset", rename_all = "lowercase")]
pub enum RateLimitPreset {
    Balanced,
    Conservative,
    Aggressive,
    Custom {
        base_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for RateLimitPreset {
    fn default() -> Self {
        Self::Balanced
    }
}

impl RateLimitPreset {
    /// Resolve to `(base_ms, max_ms, multiplier)`.
    pub fn params(&self) -> (u64, u64, f64) {
        match self {
            Self::Balanced => (BALANCED_BASE_MS, BALANCED_MAX_MS, BALANCED_MULTIPLIER),
            Self::Conservative => (
                CONSERVATIVE_BASE_MS,
                CONSERVATIVE_MAX_MS,
                CONSERVATIVE_MULTIPLIER,
            ),
            Self::Aggressive => (AGGRESSIVE_BASE_MS, AGGRESSIVE_MAX_MS, AGGRESSIVE_MULTIPLIER),
            Self::Custom {
                base_ms,
                max_ms,
                multiplier,
            } => (*base_ms, *max_ms, *multiplier),
        }
    }
}

/// Retention policy is persisted here for the (out-of-scope) retention-sweep
/// subsystem to consume; the engine itself never interprets these fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_days: Option<u32>,
    pub max_count_per_folder: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub mode: ScheduleMode,
    /// Reference instant the recurrence is computed relative to; persisted so
    /// process restarts recompute the same sequence of fire times.
    pub anchor: DateTime<Utc>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::Manual,
            anchor: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    pub backup_root: PathBuf,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub global_rate_limit: RateLimitPreset,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold_bytes: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

fn default_imap_port() -> u16 {
    DEFAULT_IMAP_PORT
}

fn default_true() -> bool {
    true
}

fn default_stream_threshold() -> u64 {
    DEFAULT_STREAM_THRESHOLD_BYTES
}

fn default_history_retention() -> usize {
    DEFAULT_HISTORY_RETENTION
}

impl Settings {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailvault");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("mailvault");
        Ok(dir)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a settings file. Example:\n\n\
                 backup_root = \"/home/you/mail-backup\"\n\n\
                 [[accounts]]\n\
                 id = \"work\"\n\
                 email = \"you@example.com\"\n\
                 host = \"imap.example.com\"\n\n\
                 [accounts.auth]\n\
                 type = \"password\"\n\n\
                 [schedule]\n\
                 mode = \"manual\"\n\
                 anchor = \"2024-01-01T00:00:00Z\"",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

        Ok(settings)
    }

    /// Serialize to TOML and write atomically (temp-then-rename), the same
    /// durability contract the filesystem store uses for message files.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = path.parent().context("settings path has no parent")?;

        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content).with_context(|| {
            format!("Failed to write temp settings file: {}", tmp_path.display())
        })?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to finalize settings file: {}", path.display()))?;

        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        fs::create_dir_all(&self.backup_root)?;
        Ok(())
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    /// Record a completed run, capping history to `history_retention` entries.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > self.history_retention {
            let excess = self.history.len() - self.history_retention;
            self.history.drain(0..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_settings() {
        let toml = r#"
            backup_root = "/tmp/backup"

            [[accounts]]
            id = "work"
            email = "test@example.com"
            host = "imap.example.com"

            [accounts.auth]
            type = "password"

            [schedule]
            mode = "manual"
            anchor = "2024-01-01T00:00:00Z"
        "#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.accounts.len(), 1);
        assert_eq!(settings.accounts[0].port, DEFAULT_IMAP_PORT);
        assert!(settings.accounts[0].tls);
        assert!(settings.accounts[0].enabled);
        assert_eq!(settings.accounts[0].auth, AuthMethod::Password);
        assert_eq!(
            settings.stream_threshold_bytes,
            DEFAULT_STREAM_THRESHOLD_BYTES
        );
    }

    #[test]
    fn test_oauth2_auth_variant_roundtrip() {
        let toml = r#"
            backup_root = "/tmp/backup"

            [[accounts]]
            id = "gmail"
            email = "me@gmail.com"
            host = "imap.gmail.com"

            [accounts.auth]
            type = "oauth2"
            provider = "gmail"
            client_id = "abc123"

            [schedule]
            mode = "hourly"
            anchor = "2024-01-01T00:00:00Z"
        "#;

        let settings: Settings = toml::from_str(toml).unwrap();
        match &settings.accounts[0].auth {
            AuthMethod::OAuth2 {
                provider,
                client_id,
            } => {
                assert_eq!(provider, "gmail");
                assert_eq!(client_id, "abc123");
            }
            AuthMethod::Password => panic!("expected oauth2"),
        }
    }

    #[test]
    fn test_login_identity_falls_back_to_email() {
        let account = AccountConfig {
            id: "a".into(),
            email: "user@example.com".into(),
            host: "imap.example.com".into(),
            port: DEFAULT_IMAP_PORT,
            tls: true,
            login: None,
            auth: AuthMethod::Password,
            enabled: true,
            last_run: None,
            rate_limit: None,
        };
        assert_eq!(account.login_identity(), "user@example.com");
    }

    #[test]
    fn test_rate_limit_preset_params() {
        assert_eq!(
            RateLimitPreset::Balanced.params(),
            (BALANCED_BASE_MS, BALANCED_MAX_MS, BALANCED_MULTIPLIER)
        );
        assert_eq!(
            RateLimitPreset::Custom {
                base_ms: 10,
                max_ms: 20,
                multiplier: 1.1
            }
            .params(),
            (10, 20, 1.1)
        );
    }

    #[test]
    fn test_push_history_caps_retention() {
        let mut settings = Settings {
            accounts: vec![],
            backup_root: PathBuf::from("/tmp/backup"),
            schedule: ScheduleConfig::default(),
            global_rate_limit: RateLimitPreset::default(),
            retention: RetentionPolicy::default(),
            stream_threshold_bytes: DEFAULT_STREAM_THRESHOLD_BYTES,
            history: vec![],
            history_retention: 2,
        };

        for i in 0..5 {
            settings.push_history(HistoryEntry::new_for_test(i));
        }

        assert_eq!(settings.history.len(), 2);
    }
}
