//! Audiobookshelf client
//!
//! Polls `GET /api/sessions/open` (admin endpoint) with a Bearer token.
//! Audiobookshelf reports durations and positions in fractional seconds and
//! does not expose a pause flag on open sessions, so rows surface as
//! playing; user names resolve later through enrichment.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{MediaServer, NowPlayingSession, PlaybackState};

use super::{build_http_client, field_str, MediaClient};

pub struct AudiobookshelfClient {
    server: MediaServer,
    http: reqwest::Client,
}

impl AudiobookshelfClient {
    pub fn new(server: MediaServer, timeout: Duration) -> Result<Self> {
        let http = build_http_client(timeout)?;
        Ok(Self { server, http })
    }

    async fn fetch_open_sessions(&self) -> Result<serde_json::Value> {
        let url = format!("{}/api/sessions/open", self.server.base_url());
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.server.api_key)
            .send()
            .await
            .map_err(|e| Error::Client(format!("audiobookshelf sessions request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Client(format!(
                "audiobookshelf sessions API error ({})",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Client(format!("failed to parse audiobookshelf sessions: {}", e)))
    }

    /// Normalize an open-sessions body. Accepts both the wrapped
    /// `{"sessions": [...]}` shape and a bare array.
    pub(crate) fn parse_sessions(body: &serde_json::Value) -> Vec<NowPlayingSession> {
        let rows = body
            .get("sessions")
            .and_then(|s| s.as_array())
            .or_else(|| body.as_array());
        let Some(rows) = rows else {
            return Vec::new();
        };
        rows.iter().filter_map(Self::parse_row).collect()
    }

    fn parse_row(row: &serde_json::Value) -> Option<NowPlayingSession> {
        let session_id = field_str(row, "id")?;
        let device = row.get("deviceInfo");

        let secs_to_ms =
            |v: &serde_json::Value| v.as_f64().map(|s| (s * 1000.0) as i64);

        Some(NowPlayingSession {
            session_id,
            session_key: None,
            // Open sessions carry only the user id; the name degrades to a
            // placeholder until enrichment
            user_name: row.get("user").and_then(|u| field_str(u, "username")),
            user_id: field_str(row, "userId"),
            media_title: field_str(row, "displayTitle"),
            media_type: field_str(row, "mediaType"),
            media_id: field_str(row, "libraryItemId"),
            series_name: field_str(row, "displayAuthor"),
            season_number: None,
            episode_number: None,
            duration_ms: row.get("duration").and_then(secs_to_ms),
            position_ms: row.get("currentTime").and_then(secs_to_ms),
            device_name: device.and_then(|d| field_str(d, "deviceName")),
            client_name: device.and_then(|d| field_str(d, "clientName")),
            platform: device.and_then(|d| field_str(d, "osName")),
            ip_address: device.and_then(|d| field_str(d, "ipAddress")),
            player_version: device.and_then(|d| field_str(d, "clientVersion")),
            state: Some(PlaybackState::Playing),
            transcoding: None,
            artwork_url: None,
        })
    }
}

#[async_trait]
impl MediaClient for AudiobookshelfClient {
    fn server(&self) -> &MediaServer {
        &self.server
    }

    async fn now_playing(&self) -> Result<Vec<NowPlayingSession>> {
        let body = self.fetch_open_sessions().await?;
        Ok(Self::parse_sessions(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sessions() {
        let body = serde_json::json!({
            "sessions": [{
                "id": "play-1",
                "userId": "u-3",
                "libraryItemId": "li-8",
                "mediaType": "book",
                "displayTitle": "Some Audiobook",
                "displayAuthor": "An Author",
                "duration": 34567.5,
                "currentTime": 120.25,
                "deviceInfo": {
                    "deviceName": "Pixel",
                    "clientName": "Abs Android",
                    "clientVersion": "0.9.81",
                    "osName": "Android",
                    "ipAddress": "10.0.0.20"
                }
            }]
        });

        let sessions = AudiobookshelfClient::parse_sessions(&body);
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.session_id, "play-1");
        assert_eq!(s.user_id.as_deref(), Some("u-3"));
        assert_eq!(s.user_name, None);
        assert_eq!(s.media_title.as_deref(), Some("Some Audiobook"));
        // Fractional seconds become milliseconds
        assert_eq!(s.duration_ms, Some(34_567_500));
        assert_eq!(s.position_ms, Some(120_250));
        assert_eq!(s.state, Some(PlaybackState::Playing));
    }

    #[test]
    fn test_parse_sessions_bare_array_and_empty() {
        let bare = serde_json::json!([{"id": "x"}]);
        assert_eq!(AudiobookshelfClient::parse_sessions(&bare).len(), 1);
        assert!(AudiobookshelfClient::parse_sessions(&serde_json::json!({})).is_empty());
        // Rows without an id are dropped
        let body = serde_json::json!({"sessions": [{"userId": "u"}]});
        assert!(AudiobookshelfClient::parse_sessions(&body).is_empty());
    }
}
