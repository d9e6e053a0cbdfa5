//! Secret storage (spec §4.9): resolves a password or OAuth2 refresh token
//! for an account through, in order, an environment variable, the OS
//! keyring, and a `0o600` file fallback under the config directory.

use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::error::AuthError;

const ENV_PASSWORD: &str = "MAILVAULT_PASSWORD";
const KEYRING_SERVICE: &str = "mailvault";

/// Diagnostic info about which credential backends are reachable, surfaced
/// by the `doctor`/`setup` CLI commands.
#[derive(Debug, Clone)]
pub struct CredentialDebugInfo {
    pub keyring_available: bool,
    pub env_var_set: bool,
    pub file_path: PathBuf,
    pub file_exists: bool,
}

impl std::fmt::Display for CredentialDebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Credential Storage Status:")?;
        writeln!(
            f,
            "  Keyring: {}",
            if self.keyring_available { "available" } else { "unavailable" }
        )?;
        writeln!(
            f,
            "  Environment var ({ENV_PASSWORD}): {}",
            if self.env_var_set { "set" } else { "not set" }
        )?;
        writeln!(f, "  File fallback: {}", self.file_path.display())?;
        writeln!(f, "  File exists: {}", self.file_exists)?;
        Ok(())
    }
}

/// Per-account secret store. One instance is cheap to construct; the engine
/// creates one per account at the start of each run.
pub struct CredentialStore {
    account_id: String,
    password_file: PathBuf,
}

impl CredentialStore {
    pub fn new(account_id: &str) -> Self {
        let safe_id = sanitize(account_id);
        let password_file = crate::config::Settings::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".password_{safe_id}"));

        Self {
            account_id: account_id.to_string(),
            password_file,
        }
    }

    pub fn debug_info(&self) -> CredentialDebugInfo {
        let test_key = format!("test:{}", self.account_id);
        let keyring_available = if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &test_key) {
            entry.set_password("__test__").is_ok()
                && entry.get_password().is_ok()
                && entry.delete_credential().is_ok()
        } else {
            false
        };

        CredentialDebugInfo {
            keyring_available,
            env_var_set: Self::env_password().is_some(),
            file_path: self.password_file.clone(),
            file_exists: self.password_file.exists(),
        }
    }

    fn env_password() -> Option<String> {
        env::var(ENV_PASSWORD).ok()
    }

    fn keyring_get(&self, key: &str) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key).ok()?;
        entry.get_password().ok()
    }

    fn keyring_set(&self, key: &str, secret: &str) -> bool {
        match keyring::Entry::new(KEYRING_SERVICE, key) {
            Ok(entry) => entry.set_password(secret).is_ok(),
            Err(_) => false,
        }
    }

    fn file_get(&self, path: &std::path::Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn file_set(&self, path: &std::path::Path, secret: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(secret.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, secret)?;
        }

        Ok(())
    }

    /// Resolve the account's IMAP password, per §4.9's fallback order.
    pub fn get_password(&self) -> Result<String, AuthError> {
        if let Some(pwd) = Self::env_password() {
            return Ok(pwd);
        }
        let key = format!("password:{}", self.account_id);
        if let Some(pwd) = self.keyring_get(&key) {
            return Ok(pwd);
        }
        if let Some(pwd) = self.file_get(&self.password_file) {
            return Ok(pwd);
        }
        Err(AuthError::CredentialUnavailable(format!(
            "no password found for account {}; set {ENV_PASSWORD} or run `mailvault setup`",
            self.account_id
        )))
    }

    pub fn set_password(&self, password: &str) -> Result<()> {
        let key = format!("password:{}", self.account_id);
        if self.keyring_set(&key, password) && self.keyring_get(&key).is_some() {
            return Ok(());
        }
        tracing::warn!("keyring unavailable for {}, using file fallback", self.account_id);
        self.file_set(&self.password_file, password)
    }

    pub fn has_password(&self) -> bool {
        Self::env_password().is_some()
            || self.keyring_get(&format!("password:{}", self.account_id)).is_some()
            || self.file_get(&self.password_file).is_some()
    }

    fn oauth2_token_file(&self) -> PathBuf {
        crate::config::Settings::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".oauth2_{}", sanitize(&self.account_id)))
    }

    pub fn get_oauth2_refresh_token(&self) -> Result<String, AuthError> {
        let key = format!("oauth2:{}", self.account_id);
        if let Some(token) = self.keyring_get(&key) {
            return Ok(token);
        }
        if let Some(token) = self.file_get(&self.oauth2_token_file()) {
            return Ok(token);
        }
        Err(AuthError::CredentialUnavailable(format!(
            "no OAuth2 refresh token found for account {}",
            self.account_id
        )))
    }

    pub fn set_oauth2_refresh_token(&self, refresh_token: &str) -> Result<()> {
        let key = format!("oauth2:{}", self.account_id);
        if self.keyring_set(&key, refresh_token) && self.keyring_get(&key).is_some() {
            return Ok(());
        }
        self.file_set(&self.oauth2_token_file(), refresh_token)
    }

    pub fn has_oauth2_refresh_token(&self) -> bool {
        self.keyring_get(&format!("oauth2:{}", self.account_id)).is_some()
            || self.file_get(&self.oauth2_token_file()).is_some()
    }

    pub fn delete_all(&self) -> Result<()> {
        for key in [
            format!("password:{}", self.account_id),
            format!("oauth2:{}", self.account_id),
        ] {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &key) {
                let _ = entry.delete_credential();
            }
        }
        let _ = fs::remove_file(&self.password_file);
        let _ = fs::remove_file(self.oauth2_token_file());
        Ok(())
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn env_password_takes_priority_over_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let id = format!("priority_test_{}", std::process::id());
        let store = CredentialStore::new(&id);
        let _ = fs::remove_file(&store.password_file);

        store.file_set(&store.password_file, "file_password").unwrap();
        env::set_var(ENV_PASSWORD, "env_password");

        assert_eq!(store.get_password().unwrap(), "env_password");

        env::remove_var(ENV_PASSWORD);
        let _ = fs::remove_file(&store.password_file);
    }

    #[test]
    fn different_accounts_get_different_password_files() {
        let store1 = CredentialStore::new("account-one");
        let store2 = CredentialStore::new("account-two");
        assert_ne!(store1.password_file, store2.password_file);
    }

    #[test]
    fn special_characters_in_account_id_are_sanitized() {
        let store = CredentialStore::new("user.name+tag@example.com");
        let filename = store.password_file.file_name().unwrap().to_string_lossy();
        assert!(!filename.contains('@'));
        assert!(!filename.contains('/'));
        assert!(!filename.contains('.'));
    }

    #[test]
    fn file_fallback_round_trips() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::remove_var(ENV_PASSWORD);
        let id = format!("file_roundtrip_{}", std::process::id());
        let store = CredentialStore::new(&id);
        let _ = fs::remove_file(&store.password_file);

        store.file_set(&store.password_file, "hunter2").unwrap();
        assert!(store.has_password());
        assert_eq!(store.file_get(&store.password_file), Some("hunter2".to_string()));

        let _ = fs::remove_file(&store.password_file);
    }
}
