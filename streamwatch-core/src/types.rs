//! Core domain types for streamwatch
//!
//! These types form the canonical data model that normalizes playback
//! activity from all supported media server backends.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **MediaServer** | A configured backend (Plex, Jellyfin, Emby, Audiobookshelf, ...) |
//! | **ActivityEvent** | Normalized, protocol-agnostic description of a playback occurrence |
//! | **ActivitySession** | Persisted record of one contiguous playback attempt |
//! | **ActivitySnapshot** | One timestamped sample of a session's position and state |
//! | **NowPlayingSession** | A live session row as reported by a backend's API |
//! | **Session key** | Plex's transient per-connection identifier, distinct from the durable session id |
//! | **Grouping** | Collapsing reconnect-fragmented sessions into one logical viewing session via `reference_id` |
//!
//! ### "Unknown" placeholders
//!
//! Backends frequently report sessions before usernames, titles, or device
//! details are resolvable. Missing fields are stored as the literal
//! placeholder [`UNKNOWN`] and progressively replaced as enrichment data
//! arrives. A resolved value is never overwritten back to the placeholder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder for fields the backend has not resolved yet.
pub const UNKNOWN: &str = "Unknown";

/// Returns true if the value is present and not the "Unknown" placeholder.
pub fn is_known(value: Option<&str>) -> bool {
    matches!(value, Some(v) if !v.is_empty() && v != UNKNOWN)
}

// ============================================
// Media servers
// ============================================

/// Protocol family of a media server, derived from its free-form
/// `server_type` string. Anything unrecognized falls back to [`ServerKind::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Plex,
    Jellyfin,
    Emby,
    Audiobookshelf,
    Generic,
}

impl ServerKind {
    /// Map a registry `server_type` string to a protocol family.
    ///
    /// Unrecognized types are monitored with the generic polling collector.
    pub fn from_type_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "plex" => ServerKind::Plex,
            "jellyfin" => ServerKind::Jellyfin,
            "emby" => ServerKind::Emby,
            "audiobookshelf" | "abs" => ServerKind::Audiobookshelf,
            _ => ServerKind::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Plex => "plex",
            ServerKind::Jellyfin => "jellyfin",
            ServerKind::Emby => "emby",
            ServerKind::Audiobookshelf => "audiobookshelf",
            ServerKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A configured media server backend.
///
/// The registry is durable (stored in the `media_servers` table) and is
/// read-only input to the monitoring engine; only `verified` servers get
/// collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaServer {
    /// Database id
    pub id: i64,
    /// Human-friendly name
    pub name: String,
    /// Free-form backend type ("plex", "jellyfin", "emby", ...)
    pub server_type: String,
    /// Base URL, e.g. `http://plex.local:32400`
    pub url: String,
    /// API token / key for the backend
    pub api_key: String,
    /// Whether the connection has been verified; unverified servers are not monitored
    pub verified: bool,
    /// When the server was registered
    pub created_at: DateTime<Utc>,
}

impl MediaServer {
    /// Protocol family for collector/client dispatch.
    pub fn kind(&self) -> ServerKind {
        ServerKind::from_type_str(&self.server_type)
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

// ============================================
// Playback state
// ============================================

/// Playback state of a session.
///
/// One enum serves both the per-event `state` field and the Plex session
/// state machine; the variant sets are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Buffering,
    Error,
    Unknown,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Error => "error",
            PlaybackState::Unknown => "unknown",
        }
    }

    /// Parse a backend state string; anything unrecognized maps to `Unknown`.
    pub fn from_state_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "playing" => PlaybackState::Playing,
            "paused" => PlaybackState::Paused,
            "stopped" => PlaybackState::Stopped,
            "buffering" => PlaybackState::Buffering,
            "error" => PlaybackState::Error,
            _ => PlaybackState::Unknown,
        }
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Activity events
// ============================================

/// Kind of activity event emitted by a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventKind {
    SessionStart,
    SessionProgress,
    SessionPause,
    SessionResume,
    SessionBuffer,
    SessionEnd,
    SessionError,
}

impl ActivityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityEventKind::SessionStart => "session_start",
            ActivityEventKind::SessionProgress => "session_progress",
            ActivityEventKind::SessionPause => "session_pause",
            ActivityEventKind::SessionResume => "session_resume",
            ActivityEventKind::SessionBuffer => "session_buffer",
            ActivityEventKind::SessionEnd => "session_end",
            ActivityEventKind::SessionError => "session_error",
        }
    }
}

impl std::str::FromStr for ActivityEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_start" => Ok(ActivityEventKind::SessionStart),
            "session_progress" => Ok(ActivityEventKind::SessionProgress),
            "session_pause" => Ok(ActivityEventKind::SessionPause),
            "session_resume" => Ok(ActivityEventKind::SessionResume),
            "session_buffer" => Ok(ActivityEventKind::SessionBuffer),
            "session_end" => Ok(ActivityEventKind::SessionEnd),
            "session_error" => Ok(ActivityEventKind::SessionError),
            _ => Err(format!("unknown event kind: {}", s)),
        }
    }
}

impl std::fmt::Display for ActivityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized playback event, produced by collectors and consumed by the
/// ingestion service. Ephemeral; never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// What happened
    pub kind: ActivityEventKind,
    /// Registry id of the server this event came from
    pub server_id: i64,
    /// External session id, protocol-scoped
    pub session_id: String,

    // Identity
    pub user_name: Option<String>,
    pub user_id: Option<String>,

    // Media
    pub media_title: Option<String>,
    pub media_type: Option<String>,
    pub media_id: Option<String>,
    pub series_name: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub position_ms: Option<i64>,

    // Device / client
    pub device_name: Option<String>,
    pub client_name: Option<String>,
    pub platform: Option<String>,
    pub ip_address: Option<String>,
    pub player_version: Option<String>,

    /// Playback state at event time
    pub state: Option<PlaybackState>,
    /// Raw transcoding details, when the backend reports any
    pub transcoding: Option<serde_json::Value>,
    /// Artwork URL for display
    pub artwork_url: Option<String>,

    /// When the event happened; defaults to now when the backend omits it
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    /// Create an event with all optional fields empty and timestamp = now.
    pub fn new(kind: ActivityEventKind, server_id: i64, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            server_id,
            session_id: session_id.into(),
            user_name: None,
            user_id: None,
            media_title: None,
            media_type: None,
            media_id: None,
            series_name: None,
            season_number: None,
            episode_number: None,
            duration_ms: None,
            position_ms: None,
            device_name: None,
            client_name: None,
            platform: None,
            ip_address: None,
            player_version: None,
            state: None,
            transcoding: None,
            artwork_url: None,
            timestamp: Utc::now(),
        }
    }
}

// ============================================
// Live sessions (as reported by backends)
// ============================================

/// One active session as reported by a backend's now-playing API.
///
/// This is the normalized output of every [`crate::clients::MediaClient`],
/// used both by polling collectors and as the startup-recovery oracle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NowPlayingSession {
    /// External session id, protocol-scoped
    pub session_id: String,
    /// Plex's transient per-connection key, when the backend has one
    pub session_key: Option<String>,
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub media_title: Option<String>,
    pub media_type: Option<String>,
    pub media_id: Option<String>,
    pub series_name: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub position_ms: Option<i64>,
    pub device_name: Option<String>,
    pub client_name: Option<String>,
    pub platform: Option<String>,
    pub ip_address: Option<String>,
    pub player_version: Option<String>,
    pub state: Option<PlaybackState>,
    pub transcoding: Option<serde_json::Value>,
    pub artwork_url: Option<String>,
}

// ============================================
// Persisted sessions and snapshots
// ============================================

/// Persisted record of one contiguous playback attempt as seen by the
/// protocol.
///
/// At most one row per `(server_id, session_id)` may be `active` at a time.
/// `reference_id` groups reconnect-fragmented sessions: it points at the id
/// of the first session in the group; null or self means standalone/head.
/// Mutated only by the ingestion service; deleted only by retention cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySession {
    /// Database id
    pub id: i64,
    pub server_id: i64,
    /// External session id, protocol-scoped
    pub session_id: String,
    /// Group key; id of the first session in a reconnect-fragmented group
    pub reference_id: Option<i64>,
    pub active: bool,

    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub media_title: Option<String>,
    pub media_type: Option<String>,
    pub media_id: Option<String>,
    pub series_name: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub device_name: Option<String>,
    pub client_name: Option<String>,
    pub platform: Option<String>,
    pub ip_address: Option<String>,
    pub player_version: Option<String>,
    pub artwork_url: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Final play duration once known
    pub duration_ms: Option<i64>,

    /// Raw transcoding details, when reported
    pub transcoding_info: Option<serde_json::Value>,
    /// Status, enrichment markers, pause accounting
    pub metadata: serde_json::Value,
}

impl ActivitySession {
    /// The group key this session belongs to (`reference_id`, or own id when
    /// standalone/head).
    pub fn group_key(&self) -> i64 {
        self.reference_id.unwrap_or(self.id)
    }
}

/// One timestamped position/state sample for a session.
///
/// Append-only: rows are inserted, never updated, and cascade-delete with
/// the owning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Database id
    pub id: i64,
    /// FK to `activity_sessions.id`
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub position_ms: i64,
    pub state: PlaybackState,
    pub transcoding: bool,
    pub quality: Option<String>,
    pub subtitle_track: Option<String>,
    pub audio_track: Option<String>,
}

// ============================================
// Collector status
// ============================================

/// Per-server collector health, exposed by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the collector currently has a working connection
    pub connected: bool,
    /// When the collector last emitted an event
    pub last_event: Option<DateTime<Utc>>,
    /// Events emitted since the collector started
    pub event_count: u64,
    /// Errors counted since the collector started
    pub error_count: u64,
}
