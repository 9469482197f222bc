//! Media server client capability
//!
//! One client per backend protocol, all normalizing to the same
//! [`NowPlayingSession`] shape. Clients are consumed by the polling
//! collectors, by Plex session enrichment, and by startup recovery (the
//! now-playing result doubles as the liveness oracle for sessions that were
//! active when the process last stopped).

pub mod audiobookshelf;
pub mod emby;
pub mod generic;
pub mod jellyfin;
pub mod plex;

pub use audiobookshelf::AudiobookshelfClient;
pub use emby::EmbyClient;
pub use generic::GenericClient;
pub use jellyfin::JellyfinClient;
pub use plex::PlexClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{MediaServer, NowPlayingSession, ServerKind};

/// Capability interface over a media server backend.
#[async_trait]
pub trait MediaClient: Send + Sync {
    /// The registry entry this client talks to.
    fn server(&self) -> &MediaServer;

    /// Current list of active playback sessions, normalized.
    async fn now_playing(&self) -> Result<Vec<NowPlayingSession>>;
}

/// Construct the protocol-specific client for a server.
pub fn create_client(server: &MediaServer, timeout: Duration) -> Result<Arc<dyn MediaClient>> {
    Ok(match server.kind() {
        ServerKind::Plex => Arc::new(PlexClient::new(server.clone(), timeout)?),
        ServerKind::Jellyfin => Arc::new(JellyfinClient::new(server.clone(), timeout)?),
        ServerKind::Emby => Arc::new(EmbyClient::new(server.clone(), timeout)?),
        ServerKind::Audiobookshelf => Arc::new(AudiobookshelfClient::new(server.clone(), timeout)?),
        ServerKind::Generic => Arc::new(GenericClient::new(server.clone(), timeout)?),
    })
}

/// Build the shared HTTP client with a request timeout.
pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Client(format!("failed to create HTTP client: {}", e)))
}

/// Convert a server base URL to a websocket URL with the given path+query.
pub(crate) fn websocket_url(base_url: &str, path_and_query: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(Error::Client(format!("unsupported server URL: {}", base)));
    };
    Ok(format!("{}{}", ws, path_and_query))
}

/// Read a JSON value as a string, accepting strings and numbers.
///
/// Backends are inconsistent about numeric ids ("37" vs 37).
pub(crate) fn json_str(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a field as a string via [`json_str`].
pub(crate) fn field_str(v: &serde_json::Value, key: &str) -> Option<String> {
    v.get(key).and_then(json_str)
}

/// Read a field as an i64, accepting numbers and numeric strings.
pub(crate) fn field_i64(v: &serde_json::Value, key: &str) -> Option<i64> {
    match v.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(server_type: &str, url: &str) -> MediaServer {
        MediaServer {
            id: 1,
            name: "test".to_string(),
            server_type: server_type.to_string(),
            url: url.to_string(),
            api_key: "key".to_string(),
            verified: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://plex.local:32400/", "/:/websockets/notifications").unwrap(),
            "ws://plex.local:32400/:/websockets/notifications"
        );
        assert_eq!(
            websocket_url("https://emby.example.com", "/embywebsocket").unwrap(),
            "wss://emby.example.com/embywebsocket"
        );
        assert!(websocket_url("ftp://nope", "/x").is_err());
    }

    #[test]
    fn test_json_field_helpers() {
        let v = serde_json::json!({"a": "37", "b": 37, "c": 3.5, "d": "", "e": null});
        assert_eq!(field_str(&v, "a").as_deref(), Some("37"));
        assert_eq!(field_str(&v, "b").as_deref(), Some("37"));
        assert_eq!(field_str(&v, "d"), None);
        assert_eq!(field_str(&v, "e"), None);
        assert_eq!(field_i64(&v, "a"), Some(37));
        assert_eq!(field_i64(&v, "b"), Some(37));
        assert_eq!(field_i64(&v, "c"), Some(3));
        assert_eq!(field_i64(&v, "missing"), None);
    }

    #[test]
    fn test_factory_dispatch() {
        let timeout = Duration::from_secs(5);
        for (server_type, _) in [
            ("plex", ServerKind::Plex),
            ("jellyfin", ServerKind::Jellyfin),
            ("emby", ServerKind::Emby),
            ("audiobookshelf", ServerKind::Audiobookshelf),
            ("somethingelse", ServerKind::Generic),
        ] {
            let client = create_client(&server(server_type, "http://localhost:1234"), timeout);
            assert!(client.is_ok(), "client for {} should build", server_type);
        }
    }
}
