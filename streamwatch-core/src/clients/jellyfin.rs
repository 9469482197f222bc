//! Jellyfin client
//!
//! Jellyfin has no usable push channel for playback state, so it is polled:
//! `GET /Sessions` returns every connected client; rows carrying a
//! `NowPlayingItem` are active playback sessions. Durations and positions
//! are reported in ticks (100ns units).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{MediaServer, NowPlayingSession, PlaybackState};

use super::{build_http_client, field_i64, field_str, MediaClient};

/// Ticks per millisecond (Jellyfin/Emby report 100ns ticks)
const TICKS_PER_MS: i64 = 10_000;

pub struct JellyfinClient {
    server: MediaServer,
    http: reqwest::Client,
}

impl JellyfinClient {
    pub fn new(server: MediaServer, timeout: Duration) -> Result<Self> {
        let http = build_http_client(timeout)?;
        Ok(Self { server, http })
    }

    async fn fetch_sessions(&self) -> Result<serde_json::Value> {
        let url = format!("{}/Sessions", self.server.base_url());
        let response = self
            .http
            .get(&url)
            .header("X-Emby-Token", &self.server.api_key)
            .send()
            .await
            .map_err(|e| Error::Client(format!("jellyfin sessions request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Client(format!(
                "jellyfin sessions API error ({})",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Client(format!("failed to parse jellyfin sessions: {}", e)))
    }
}

/// Normalize `/Sessions` rows. Shared with the Emby client — Jellyfin kept
/// Emby's wire shape when it forked.
pub(crate) fn parse_session_rows(
    base_url: &str,
    body: &serde_json::Value,
) -> Vec<NowPlayingSession> {
    let Some(rows) = body.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| parse_session_row(base_url, row))
        .collect()
}

fn parse_session_row(base_url: &str, row: &serde_json::Value) -> Option<NowPlayingSession> {
    // Idle clients (no NowPlayingItem) are not playback sessions
    let item = row.get("NowPlayingItem")?;
    let session_id = field_str(row, "Id")?;

    let play_state = row.get("PlayState");
    let paused = play_state
        .and_then(|p| p.get("IsPaused"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let state = if paused {
        PlaybackState::Paused
    } else {
        PlaybackState::Playing
    };

    let item_id = field_str(item, "Id");
    let artwork_url = item_id
        .as_ref()
        .map(|id| format!("{}/Items/{}/Images/Primary", base_url, id));

    Some(NowPlayingSession {
        session_id,
        session_key: None,
        user_name: field_str(row, "UserName"),
        user_id: field_str(row, "UserId"),
        media_title: field_str(item, "Name"),
        media_type: field_str(item, "Type").map(|t| t.to_ascii_lowercase()),
        media_id: item_id,
        series_name: field_str(item, "SeriesName"),
        season_number: field_i64(item, "ParentIndexNumber"),
        episode_number: field_i64(item, "IndexNumber"),
        duration_ms: field_i64(item, "RunTimeTicks").map(|t| t / TICKS_PER_MS),
        position_ms: play_state
            .and_then(|p| field_i64(p, "PositionTicks"))
            .map(|t| t / TICKS_PER_MS),
        device_name: field_str(row, "DeviceName"),
        client_name: field_str(row, "Client"),
        platform: field_str(row, "DeviceType").or_else(|| field_str(row, "Client")),
        ip_address: field_str(row, "RemoteEndPoint"),
        player_version: field_str(row, "ApplicationVersion"),
        state: Some(state),
        transcoding: row.get("TranscodingInfo").cloned(),
        artwork_url,
    })
}

#[async_trait]
impl MediaClient for JellyfinClient {
    fn server(&self) -> &MediaServer {
        &self.server
    }

    async fn now_playing(&self) -> Result<Vec<NowPlayingSession>> {
        let body = self.fetch_sessions().await?;
        Ok(parse_session_rows(self.server.base_url(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_rows() {
        let body = serde_json::json!([
            {
                // Idle client; should be skipped
                "Id": "idle-1",
                "UserName": "bob",
                "DeviceName": "Phone"
            },
            {
                "Id": "sess-1",
                "UserId": "u-9",
                "UserName": "alice",
                "Client": "Jellyfin Web",
                "DeviceName": "Firefox",
                "ApplicationVersion": "10.9.2",
                "RemoteEndPoint": "10.0.0.7",
                "PlayState": {"PositionTicks": 450_000_000i64, "IsPaused": true},
                "NowPlayingItem": {
                    "Id": "item-4",
                    "Name": "Pilot",
                    "Type": "Episode",
                    "SeriesName": "Some Show",
                    "ParentIndexNumber": 1,
                    "IndexNumber": 3,
                    "RunTimeTicks": 13_200_000_000i64
                }
            }
        ]);

        let sessions = parse_session_rows("http://jf.local", &body);
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.session_id, "sess-1");
        assert_eq!(s.user_name.as_deref(), Some("alice"));
        assert_eq!(s.media_type.as_deref(), Some("episode"));
        assert_eq!(s.series_name.as_deref(), Some("Some Show"));
        // Ticks are converted to milliseconds
        assert_eq!(s.duration_ms, Some(1_320_000));
        assert_eq!(s.position_ms, Some(45_000));
        assert_eq!(s.state, Some(PlaybackState::Paused));
        assert_eq!(
            s.artwork_url.as_deref(),
            Some("http://jf.local/Items/item-4/Images/Primary")
        );
    }

    #[test]
    fn test_parse_session_rows_not_an_array() {
        assert!(parse_session_rows("http://jf.local", &serde_json::json!({})).is_empty());
    }
}
