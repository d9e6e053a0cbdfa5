//! Per-account setup for a run: resolving the configured auth method down
//! to concrete `session::Credentials`, and building the session's
//! connection parameters from `AccountConfig`.

use anyhow::{Context, Result};

use crate::config::{AccountConfig, AuthMethod};
use crate::credentials::CredentialStore;
use crate::oauth2;
use crate::session::{ConnectionParams, Credentials};

/// Resolve the credentials needed to authenticate `account` for one run.
/// For OAuth2 accounts this performs the refresh-token exchange eagerly so
/// a stale access token never reaches the wire.
pub async fn resolve_credentials(account: &AccountConfig) -> Result<Credentials> {
    let store = CredentialStore::new(&account.id);
    match &account.auth {
        AuthMethod::Password => {
            let password = store.get_password().context("resolving account password")?;
            Ok(Credentials::Password(password))
        }
        AuthMethod::OAuth2 { client_id, .. } => {
            let refresh_token = store
                .get_oauth2_refresh_token()
                .context("resolving OAuth2 refresh token")?;
            let access_token = oauth2::get_access_token(client_id, &refresh_token)
                .await
                .context("refreshing OAuth2 access token")?;
            Ok(Credentials::OAuth2 { access_token })
        }
    }
}

pub fn connection_params(account: &AccountConfig, global_rate_limit: crate::config::RateLimitPreset) -> ConnectionParams {
    let preset = account.rate_limit.unwrap_or(global_rate_limit);
    ConnectionParams {
        host: account.host.clone(),
        port: account.port,
        tls: account.tls,
        login: account.login_identity().to_string(),
        rate_limit_params: preset.params(),
    }
}
