//! Plex Media Server client
//!
//! Plex exposes two surfaces the engine consumes:
//! - `GET /status/sessions` — the now-playing list, also used to enrich
//!   sessions first seen through the alert stream
//! - `/:/websockets/notifications` — the push alert stream carrying
//!   `PlaySessionStateNotification` payloads keyed by the transient
//!   `sessionKey`
//!
//! Requests send `Accept: application/json`; Plex otherwise answers XML.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{MediaServer, NowPlayingSession, PlaybackState};

use super::{build_http_client, field_i64, field_str, websocket_url, MediaClient};

pub struct PlexClient {
    server: MediaServer,
    http: reqwest::Client,
}

impl PlexClient {
    pub fn new(server: MediaServer, timeout: Duration) -> Result<Self> {
        let http = build_http_client(timeout)?;
        Ok(Self { server, http })
    }

    /// The websocket URL of the alert stream.
    pub fn alert_url(&self) -> Result<String> {
        websocket_url(
            self.server.base_url(),
            &format!(
                "/:/websockets/notifications?X-Plex-Token={}",
                urlencoding::encode(&self.server.api_key)
            ),
        )
    }

    async fn fetch_sessions(&self) -> Result<serde_json::Value> {
        let url = format!("{}/status/sessions", self.server.base_url());
        let response = self
            .http
            .get(&url)
            .header("X-Plex-Token", &self.server.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Client(format!("plex sessions request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Client(format!("plex sessions API error ({})", status)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Client(format!("failed to parse plex sessions: {}", e)))
    }

    /// Normalize a `/status/sessions` body into session rows.
    pub(crate) fn parse_sessions(body: &serde_json::Value) -> Vec<NowPlayingSession> {
        let Some(items) = body
            .get("MediaContainer")
            .and_then(|c| c.get("Metadata"))
            .and_then(|m| m.as_array())
        else {
            return Vec::new();
        };

        items.iter().filter_map(Self::parse_item).collect()
    }

    fn parse_item(item: &serde_json::Value) -> Option<NowPlayingSession> {
        let session_key = field_str(item, "sessionKey");
        // The durable id lives under Session.id; fall back to the transient
        // key when enrichment data is incomplete
        let durable_id = item.get("Session").and_then(|s| field_str(s, "id"));
        let session_id = durable_id.or_else(|| session_key.clone())?;

        let user = item.get("User");
        let player = item.get("Player");

        let state = player
            .and_then(|p| field_str(p, "state"))
            .map(|s| PlaybackState::from_state_str(&s));

        Some(NowPlayingSession {
            session_id,
            session_key,
            user_name: user.and_then(|u| field_str(u, "title")),
            user_id: user.and_then(|u| field_str(u, "id")),
            media_title: field_str(item, "title"),
            media_type: field_str(item, "type"),
            media_id: field_str(item, "ratingKey"),
            series_name: field_str(item, "grandparentTitle"),
            season_number: field_i64(item, "parentIndex"),
            episode_number: field_i64(item, "index"),
            duration_ms: field_i64(item, "duration"),
            position_ms: field_i64(item, "viewOffset"),
            device_name: player.and_then(|p| field_str(p, "title")),
            client_name: player.and_then(|p| field_str(p, "product")),
            platform: player.and_then(|p| field_str(p, "platform")),
            ip_address: player.and_then(|p| field_str(p, "address")),
            player_version: player.and_then(|p| field_str(p, "version")),
            state,
            transcoding: item.get("TranscodeSession").cloned(),
            artwork_url: field_str(item, "thumb").or_else(|| field_str(item, "grandparentThumb")),
        })
    }
}

#[async_trait]
impl MediaClient for PlexClient {
    fn server(&self) -> &MediaServer {
        &self.server
    }

    async fn now_playing(&self) -> Result<Vec<NowPlayingSession>> {
        let body = self.fetch_sessions().await?;
        Ok(Self::parse_sessions(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn client() -> PlexClient {
        PlexClient::new(
            MediaServer {
                id: 1,
                name: "den".to_string(),
                server_type: "plex".to_string(),
                url: "http://plex.local:32400/".to_string(),
                api_key: "tok en".to_string(),
                verified: true,
                created_at: Utc::now(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_alert_url_encodes_token() {
        let url = client().alert_url().unwrap();
        assert_eq!(
            url,
            "ws://plex.local:32400/:/websockets/notifications?X-Plex-Token=tok%20en"
        );
    }

    #[test]
    fn test_parse_sessions_episode() {
        let body = serde_json::json!({
            "MediaContainer": {
                "size": 1,
                "Metadata": [{
                    "sessionKey": "37",
                    "ratingKey": "1234",
                    "title": "Pilot",
                    "grandparentTitle": "Some Show",
                    "parentIndex": 1,
                    "index": 3,
                    "type": "episode",
                    "duration": 1_320_000,
                    "viewOffset": 45_000,
                    "thumb": "/library/metadata/1234/thumb/1",
                    "User": {"id": 5, "title": "alice"},
                    "Player": {
                        "title": "Living Room TV",
                        "product": "Plex for Apple TV",
                        "platform": "tvOS",
                        "address": "10.0.0.12",
                        "version": "8.3",
                        "state": "playing"
                    },
                    "Session": {"id": "sess-abc", "bandwidth": 12000},
                    "TranscodeSession": {"videoDecision": "transcode"}
                }]
            }
        });

        let sessions = PlexClient::parse_sessions(&body);
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        // Durable Session.id wins over the transient sessionKey
        assert_eq!(s.session_id, "sess-abc");
        assert_eq!(s.session_key.as_deref(), Some("37"));
        assert_eq!(s.user_name.as_deref(), Some("alice"));
        assert_eq!(s.user_id.as_deref(), Some("5"));
        assert_eq!(s.media_title.as_deref(), Some("Pilot"));
        assert_eq!(s.series_name.as_deref(), Some("Some Show"));
        assert_eq!(s.season_number, Some(1));
        assert_eq!(s.episode_number, Some(3));
        assert_eq!(s.duration_ms, Some(1_320_000));
        assert_eq!(s.position_ms, Some(45_000));
        assert_eq!(s.state, Some(PlaybackState::Playing));
        assert!(s.transcoding.is_some());
    }

    #[test]
    fn test_parse_sessions_falls_back_to_session_key() {
        let body = serde_json::json!({
            "MediaContainer": {
                "Metadata": [{
                    "sessionKey": "41",
                    "title": "Movie",
                    "type": "movie"
                }]
            }
        });
        let sessions = PlexClient::parse_sessions(&body);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "41");
    }

    #[test]
    fn test_parse_sessions_empty_and_malformed() {
        assert!(PlexClient::parse_sessions(&serde_json::json!({})).is_empty());
        assert!(
            PlexClient::parse_sessions(&serde_json::json!({"MediaContainer": {"size": 0}}))
                .is_empty()
        );
        // A row with no usable session id is dropped, not an error
        let body = serde_json::json!({
            "MediaContainer": {"Metadata": [{"title": "No ids"}]}
        });
        assert!(PlexClient::parse_sessions(&body).is_empty());
    }
}
