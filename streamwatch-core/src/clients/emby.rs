//! Emby client
//!
//! REST side is identical in shape to Jellyfin (`GET /Sessions`), so row
//! normalization is shared. Emby additionally exposes a websocket at
//! `/embywebsocket` which pushes `Sessions` messages once subscribed with a
//! `SessionsStart` message; the collector keeps it alive with periodic
//! `KeepAlive` pings.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{MediaServer, NowPlayingSession};

use super::jellyfin::parse_session_rows;
use super::{build_http_client, websocket_url, MediaClient};

pub struct EmbyClient {
    server: MediaServer,
    http: reqwest::Client,
}

impl EmbyClient {
    pub fn new(server: MediaServer, timeout: Duration) -> Result<Self> {
        let http = build_http_client(timeout)?;
        Ok(Self { server, http })
    }

    /// The websocket URL of the session push channel.
    pub fn socket_url(&self) -> Result<String> {
        websocket_url(
            self.server.base_url(),
            &format!(
                "/embywebsocket?api_key={}&deviceId=streamwatch",
                urlencoding::encode(&self.server.api_key)
            ),
        )
    }

    /// Subscription message asking the server to push session updates
    /// (initial delay 0ms, then every 1500ms).
    pub fn sessions_start_message() -> String {
        serde_json::json!({"MessageType": "SessionsStart", "Data": "0,1500"}).to_string()
    }

    /// Keep-alive ping message.
    pub fn keepalive_message() -> String {
        serde_json::json!({"MessageType": "KeepAlive"}).to_string()
    }

    /// Extract session rows from a websocket message, if it is a `Sessions`
    /// push. Any other message type returns None.
    pub fn parse_socket_message(base_url: &str, text: &str) -> Option<Vec<NowPlayingSession>> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        if value.get("MessageType").and_then(|m| m.as_str()) != Some("Sessions") {
            return None;
        }
        let data = value.get("Data")?;
        Some(parse_session_rows(base_url, data))
    }

    async fn fetch_sessions(&self) -> Result<serde_json::Value> {
        let url = format!("{}/Sessions", self.server.base_url());
        let response = self
            .http
            .get(&url)
            .header("X-Emby-Token", &self.server.api_key)
            .send()
            .await
            .map_err(|e| Error::Client(format!("emby sessions request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Client(format!("emby sessions API error ({})", status)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Client(format!("failed to parse emby sessions: {}", e)))
    }
}

#[async_trait]
impl MediaClient for EmbyClient {
    fn server(&self) -> &MediaServer {
        &self.server
    }

    async fn now_playing(&self) -> Result<Vec<NowPlayingSession>> {
        let body = self.fetch_sessions().await?;
        Ok(parse_session_rows(self.server.base_url(), &body))
    }
}
