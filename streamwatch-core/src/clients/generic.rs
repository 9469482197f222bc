//! Generic fallback client
//!
//! Used for any unrecognized `server_type`. Expects a `GET {url}/sessions`
//! endpoint returning a JSON array already in the normalized
//! [`NowPlayingSession`] shape; rows that fail to deserialize are dropped
//! and logged rather than failing the poll.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{MediaServer, NowPlayingSession};

use super::{build_http_client, MediaClient};

pub struct GenericClient {
    server: MediaServer,
    http: reqwest::Client,
}

impl GenericClient {
    pub fn new(server: MediaServer, timeout: Duration) -> Result<Self> {
        let http = build_http_client(timeout)?;
        Ok(Self { server, http })
    }

    /// Deserialize rows, dropping anything that doesn't fit the shape.
    pub(crate) fn parse_sessions(body: &serde_json::Value) -> Vec<NowPlayingSession> {
        let Some(rows) = body.as_array() else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                match serde_json::from_value::<NowPlayingSession>(row.clone()) {
                    Ok(s) if !s.session_id.is_empty() => Some(s),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed generic session row");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl MediaClient for GenericClient {
    fn server(&self) -> &MediaServer {
        &self.server
    }

    async fn now_playing(&self) -> Result<Vec<NowPlayingSession>> {
        let url = format!("{}/sessions", self.server.base_url());
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.server.api_key)
            .send()
            .await
            .map_err(|e| Error::Client(format!("sessions request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Client(format!("sessions API error ({})", status)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Client(format!("failed to parse sessions: {}", e)))?;

        Ok(Self::parse_sessions(&body))
    }
}
