//! OAuth2 access-token refresh (spec §4.9).
//!
//! Only the refresh-token -> access-token exchange lives here; the
//! authorization-code browser flow that mints the refresh token in the
//! first place is a one-time interactive setup step the engine doesn't
//! perform on every run, and is out of scope for the backup loop itself.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::time::Duration;

use crate::error::AuthError;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

pub fn get_client_secret() -> Option<String> {
    std::env::var("MAILVAULT_OAUTH_CLIENT_SECRET").ok()
}

pub struct TokenRefresher {
    client_id: String,
    client_secret: Option<String>,
    http: reqwest::Client,
    token_url: String,
}

impl TokenRefresher {
    pub fn new(client_id: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build OAuth2 HTTP client")?;
        Ok(Self {
            client_id: client_id.to_string(),
            client_secret: get_client_secret(),
            http,
            token_url: GOOGLE_TOKEN_URL.to_string(),
        })
    }

    #[cfg(test)]
    fn with_token_url(client_id: &str, token_url: String) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: None,
            http: reqwest::Client::new(),
            token_url,
        }
    }

    /// Exchange a stored refresh token for a fresh access token.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, AuthError> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let secret_str;
        if let Some(secret) = &self.client_secret {
            secret_str = secret.clone();
            params.push(("client_secret", &secret_str));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenRefresh(e.to_string()))?;

        if !response.status().is_success() {
            let error: ErrorResponse = response.json().await.unwrap_or(ErrorResponse {
                error: "unknown_error".to_string(),
            });
            return Err(AuthError::TokenRefresh(error.error));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TokenRefresh(e.to_string()))?;
        Ok(token.access_token)
    }
}

/// Convenience wrapper for the common case of a one-off refresh.
pub async fn get_access_token(client_id: &str, refresh_token: &str) -> Result<String, AuthError> {
    let refresher = TokenRefresher::new(client_id)
        .map_err(|e| AuthError::TokenRefresh(e.to_string()))?;
    refresher.refresh_access_token(refresh_token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Spawns a one-shot HTTP server on localhost that replies with
    /// `status`/`body` to the next connection, then stops.
    fn spawn_one_shot_response(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/token")
    }

    #[tokio::test]
    async fn refresh_propagates_provider_error() {
        let url = spawn_one_shot_response(400, r#"{"error":"invalid_grant"}"#);
        let refresher = TokenRefresher::with_token_url("client-id", url);
        let result = refresher.refresh_access_token("bad-token").await;
        assert!(matches!(result, Err(AuthError::TokenRefresh(msg)) if msg == "invalid_grant"));
    }

    #[tokio::test]
    async fn refresh_returns_access_token_on_success() {
        let url = spawn_one_shot_response(200, r#"{"access_token":"ya29.fresh"}"#);
        let refresher = TokenRefresher::with_token_url("client-id", url);
        let token = refresher.refresh_access_token("refresh-token").await.unwrap();
        assert_eq!(token, "ya29.fresh");
    }
}
