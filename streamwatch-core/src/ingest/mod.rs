//! Ingestion service: turns activity events into persisted state
//!
//! A single consumer drains the bounded collector channel and applies each
//! event to the store:
//!
//! ```text
//! ┌────────────┐  bounded mpsc  ┌───────────────┐      ┌──────────────────┐
//! │ Collectors │ ─────────────► │ IngestService │ ───► │ activity_sessions │
//! └────────────┘                └───────────────┘      │ activity_snapshots│
//!                                                      └──────────────────┘
//! ```
//!
//! Dispatch is a `match` over the event kind: start / update (progress,
//! pause, resume, buffer, error) / end. Handlers are idempotent where the
//! protocols require it — a duplicate `session_start` for an already-active
//! external session is treated as an update, never a second row.
//!
//! Enrichment is monotonic: a field resolved to a real value is never
//! overwritten back to the "Unknown" placeholder by late, degraded events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MonitoringConfig;
use crate::db::Database;
use crate::error::Result;
use crate::types::{
    is_known, ActivityEvent, ActivityEventKind, ActivitySession, ActivitySnapshot, PlaybackState,
    UNKNOWN,
};

use crate::clients::field_str;

pub struct IngestService {
    db: Arc<Database>,
    monitoring: MonitoringConfig,
}

impl IngestService {
    pub fn new(db: Arc<Database>, monitoring: MonitoringConfig) -> Self {
        Self { db, monitoring }
    }

    /// Spawn the consumer loop. Runs until every collector sender is gone.
    /// Persistence failures are logged and never crash the loop.
    pub fn start(self, mut rx: mpsc::Receiver<ActivityEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("ingestion service started");
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.handle_event(&event) {
                    tracing::error!(
                        kind = %event.kind,
                        server_id = event.server_id,
                        session_id = %event.session_id,
                        error = %e,
                        "failed to ingest event"
                    );
                }
            }
            tracing::info!("ingestion service stopped");
        })
    }

    /// Apply one event to the store.
    pub fn handle_event(&self, event: &ActivityEvent) -> Result<()> {
        if event.session_id.is_empty() {
            tracing::debug!(kind = %event.kind, "dropping event without session id");
            return Ok(());
        }
        match event.kind {
            ActivityEventKind::SessionStart => self.handle_start(event).map(|_| ()),
            ActivityEventKind::SessionProgress
            | ActivityEventKind::SessionPause
            | ActivityEventKind::SessionResume
            | ActivityEventKind::SessionBuffer
            | ActivityEventKind::SessionError => self.handle_update(event),
            ActivityEventKind::SessionEnd => self.handle_end(event),
        }
    }

    /// Create a session row, or fall through to the update path when one is
    /// already active for this external session (duplicate start).
    fn handle_start(&self, event: &ActivityEvent) -> Result<i64> {
        if let Some(existing) = self
            .db
            .get_active_session(event.server_id, &event.session_id)?
        {
            tracing::debug!(
                session_id = %event.session_id,
                "duplicate session_start, treating as update"
            );
            let id = existing.id;
            self.apply_update(existing, event)?;
            return Ok(id);
        }

        let mut session = self.session_from_event(event);
        self.resolve_identity(&mut session)?;
        let id = self.db.insert_session(&session)?;
        session.id = id;
        self.apply_grouping(&session)?;
        self.record_snapshot(id, event)?;
        tracing::info!(
            server_id = event.server_id,
            session_id = %event.session_id,
            user = session.user_name.as_deref().unwrap_or(UNKNOWN),
            media = session.media_title.as_deref().unwrap_or(UNKNOWN),
            "session started"
        );
        Ok(id)
    }

    fn handle_update(&self, event: &ActivityEvent) -> Result<()> {
        match self
            .db
            .get_active_session(event.server_id, &event.session_id)?
        {
            Some(session) => self.apply_update(session, event),
            None => {
                // Progress for a session we never saw start (process restart,
                // dropped events): create it so history is not lost
                tracing::debug!(
                    session_id = %event.session_id,
                    kind = %event.kind,
                    "update for unknown session, creating"
                );
                self.handle_start(event).map(|_| ())
            }
        }
    }

    fn handle_end(&self, event: &ActivityEvent) -> Result<()> {
        let Some(mut session) = self
            .db
            .get_active_session(event.server_id, &event.session_id)?
        else {
            tracing::debug!(
                session_id = %event.session_id,
                "end for unknown or already-ended session"
            );
            return Ok(());
        };

        self.merge_event_fields(&mut session, event);

        let metadata = ensure_object(&mut session.metadata);
        metadata.insert("status".to_string(), "stopped".into());
        // Duration from the event when the collector computed one, else the
        // running real-play estimate maintained by the update path
        let duration_ms = event.duration_ms.or_else(|| {
            metadata
                .get("total_duration_seconds")
                .and_then(|v| v.as_i64())
                .map(|secs| secs * 1000)
        });

        session.duration_ms = duration_ms;
        session.active = false;
        session.ended_at = Some(event.timestamp);
        session.updated_at = event.timestamp;
        self.db.update_session(&session)?;
        self.record_snapshot(session.id, event)?;
        tracing::info!(
            server_id = event.server_id,
            session_id = %event.session_id,
            duration_ms = duration_ms.unwrap_or_default(),
            "session ended"
        );
        Ok(())
    }

    /// Shared update body: merge fields monotonically, refresh status and
    /// pause accounting metadata, persist, append a snapshot.
    fn apply_update(&self, mut session: ActivitySession, event: &ActivityEvent) -> Result<()> {
        self.merge_event_fields(&mut session, event);

        let started_at = session.started_at;
        let metadata = ensure_object(&mut session.metadata);

        match event.kind {
            ActivityEventKind::SessionPause => {
                metadata.insert("status".to_string(), "paused".into());
                metadata.insert("paused_at".to_string(), event.timestamp.to_rfc3339().into());
            }
            ActivityEventKind::SessionResume => {
                metadata.insert("status".to_string(), "playing".into());
                if let Some(paused_at) = metadata
                    .get("paused_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                {
                    let pause_secs = (event.timestamp - paused_at.with_timezone(&Utc))
                        .num_seconds()
                        .max(0);
                    let total = metadata
                        .get("paused_seconds")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0)
                        + pause_secs;
                    metadata.insert("paused_seconds".to_string(), total.into());
                }
                metadata.remove("paused_at");
            }
            ActivityEventKind::SessionBuffer => {
                metadata.insert("status".to_string(), "buffering".into());
            }
            ActivityEventKind::SessionError => {
                metadata.insert("status".to_string(), "error".into());
            }
            _ => {
                let status = event
                    .state
                    .unwrap_or(PlaybackState::Playing)
                    .as_str();
                metadata.insert("status".to_string(), status.into());
            }
        }

        if let Some(position_ms) = event.position_ms {
            metadata.insert("position_ms".to_string(), position_ms.into());
        }
        if let Some(state) = event.state {
            metadata.insert("state".to_string(), state.as_str().into());
        }
        if let Some(duration_ms) = event.duration_ms {
            metadata.insert("media_duration_ms".to_string(), duration_ms.into());
        }

        // Running real-play estimate, consumed by the end handler when the
        // final event carries no duration
        let paused_seconds = metadata
            .get("paused_seconds")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let total = ((event.timestamp - started_at).num_seconds() - paused_seconds).max(0);
        metadata.insert("total_duration_seconds".to_string(), total.into());

        session.updated_at = event.timestamp;
        self.db.update_session(&session)?;
        self.record_snapshot(session.id, event)
    }

    /// Monotonic enrichment merge.
    ///
    /// The display fields are overwritten only by non-placeholder values,
    /// except that anything beats a stored placeholder. Plain optional
    /// fields are filled when missing.
    fn merge_event_fields(&self, session: &mut ActivitySession, event: &ActivityEvent) {
        merge_known(&mut session.user_name, event.user_name.as_deref());
        merge_known(&mut session.media_title, event.media_title.as_deref());
        merge_known(&mut session.device_name, event.device_name.as_deref());
        merge_known(&mut session.client_name, event.client_name.as_deref());
        merge_known(&mut session.platform, event.platform.as_deref());

        fill_missing(&mut session.user_id, event.user_id.as_deref());
        fill_missing(&mut session.media_type, event.media_type.as_deref());
        fill_missing(&mut session.media_id, event.media_id.as_deref());
        fill_missing(&mut session.series_name, event.series_name.as_deref());
        fill_missing(&mut session.ip_address, event.ip_address.as_deref());
        fill_missing(&mut session.player_version, event.player_version.as_deref());
        fill_missing(&mut session.artwork_url, event.artwork_url.as_deref());
        if session.season_number.is_none() {
            session.season_number = event.season_number;
        }
        if session.episode_number.is_none() {
            session.episode_number = event.episode_number;
        }
        if let Some(transcoding) = &event.transcoding {
            session.transcoding_info = Some(transcoding.clone());
        }
    }

    fn session_from_event(&self, event: &ActivityEvent) -> ActivitySession {
        let state = event.state.unwrap_or(PlaybackState::Playing);
        let mut metadata = serde_json::Map::new();
        metadata.insert("status".to_string(), state.as_str().into());
        if let Some(position_ms) = event.position_ms {
            metadata.insert("position_ms".to_string(), position_ms.into());
        }
        if let Some(duration_ms) = event.duration_ms {
            metadata.insert("media_duration_ms".to_string(), duration_ms.into());
        }

        ActivitySession {
            id: 0,
            server_id: event.server_id,
            session_id: event.session_id.clone(),
            reference_id: None,
            active: true,
            user_name: Some(placeholder(event.user_name.as_deref())),
            user_id: event.user_id.clone(),
            media_title: Some(placeholder(event.media_title.as_deref())),
            media_type: event.media_type.clone(),
            media_id: event.media_id.clone(),
            series_name: event.series_name.clone(),
            season_number: event.season_number,
            episode_number: event.episode_number,
            device_name: Some(placeholder(event.device_name.as_deref())),
            client_name: Some(placeholder(event.client_name.as_deref())),
            platform: Some(placeholder(event.platform.as_deref())),
            ip_address: event.ip_address.clone(),
            player_version: event.player_version.clone(),
            artwork_url: event.artwork_url.clone(),
            started_at: event.timestamp,
            ended_at: None,
            updated_at: event.timestamp,
            duration_ms: None,
            transcoding_info: event.transcoding.clone(),
            metadata: serde_json::Value::Object(metadata),
        }
    }

    /// Fill a missing user name from this user's most recent resolved
    /// session on the same server.
    fn resolve_identity(&self, session: &mut ActivitySession) -> Result<()> {
        if is_known(session.user_name.as_deref()) {
            return Ok(());
        }
        let Some(user_id) = session.user_id.as_deref() else {
            return Ok(());
        };
        if let Some(name) = self.db.latest_known_user_name(session.server_id, user_id)? {
            tracing::debug!(user_id, user_name = %name, "resolved user identity from history");
            session.user_name = Some(name);
        }
        Ok(())
    }

    /// Session grouping: collapse reconnect fragmentation.
    ///
    /// Among the two most recently created lower-id sessions for the same
    /// `(server_id, user_name, media_id)`, if the most recent was touched
    /// within the grouping window of this event, this session joins its
    /// group (assigning the candidate a head reference first if it has
    /// none). Otherwise the session heads its own group. A group's head
    /// reference is never reassigned.
    fn apply_grouping(&self, session: &ActivitySession) -> Result<()> {
        let window = self.monitoring.grouping_window_secs;
        let (Some(user_name), Some(media_id)) =
            (session.user_name.as_deref(), session.media_id.as_deref())
        else {
            return self.db.set_reference_id(session.id, session.id);
        };

        let candidates = self.db.recent_grouping_candidates(
            session.server_id,
            user_name,
            media_id,
            session.id,
            2,
        )?;
        if let Some(previous) = candidates.first() {
            let anchor = previous.updated_at.max(previous.started_at);
            if (session.started_at - anchor).num_seconds().abs() <= window {
                let head = match previous.reference_id {
                    Some(reference) => reference,
                    None => {
                        self.db.set_reference_id(previous.id, previous.id)?;
                        previous.id
                    }
                };
                tracing::debug!(
                    session = session.id,
                    head,
                    "grouping fragmented session with its predecessor"
                );
                return self.db.set_reference_id(session.id, head);
            }
        }
        self.db.set_reference_id(session.id, session.id)
    }

    /// Append a position/state sample when the event carries both.
    fn record_snapshot(&self, session_db_id: i64, event: &ActivityEvent) -> Result<()> {
        let (Some(position_ms), Some(state)) = (event.position_ms, event.state) else {
            return Ok(());
        };
        let transcoding = event.transcoding.as_ref();
        self.db.insert_snapshot(&ActivitySnapshot {
            id: 0,
            session_id: session_db_id,
            timestamp: event.timestamp,
            position_ms,
            state,
            transcoding: transcoding.is_some(),
            quality: transcoding.and_then(|t| field_str(t, "videoResolution")),
            subtitle_track: transcoding.and_then(|t| field_str(t, "subtitleDecision")),
            audio_track: transcoding.and_then(|t| field_str(t, "audioDecision")),
        })?;
        Ok(())
    }
}

/// Overwrite a display field only when the incoming value is resolved, or
/// when the stored value is still a placeholder.
fn merge_known(current: &mut Option<String>, incoming: Option<&str>) {
    let current_known = is_known(current.as_deref());
    if let Some(value) = incoming {
        if is_known(Some(value)) || !current_known {
            *current = Some(value.to_string());
        }
    }
}

fn fill_missing(current: &mut Option<String>, incoming: Option<&str>) {
    if current.is_none() {
        if let Some(value) = incoming {
            *current = Some(value.to_string());
        }
    }
}

fn placeholder(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

pub(crate) fn ensure_object(
    value: &mut serde_json::Value,
) -> &mut serde_json::Map<String, serde_json::Value> {
    if !value.is_object() {
        *value = serde_json::Value::Object(serde_json::Map::new());
    }
    value.as_object_mut().expect("object ensured above")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> IngestService {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.insert_server("test", "plex", "http://localhost", "k", true)
            .unwrap();
        IngestService::new(Arc::new(db), MonitoringConfig::default())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(kind: ActivityEventKind, session_id: &str, secs: i64) -> ActivityEvent {
        let mut event = ActivityEvent::new(kind, 1, session_id);
        event.user_name = Some("alice".to_string());
        event.user_id = Some("u1".to_string());
        event.media_title = Some("The Matrix".to_string());
        event.media_id = Some("m1".to_string());
        event.media_type = Some("movie".to_string());
        event.position_ms = Some(secs * 1000);
        event.state = Some(PlaybackState::Playing);
        event.timestamp = at(secs);
        event
    }

    #[test]
    fn test_duplicate_start_is_idempotent() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 0))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 5))
            .unwrap();

        let active = svc.db.list_active_sessions().unwrap();
        assert_eq!(active.len(), 1, "duplicate start must not create a second active row");
        // The duplicate was applied as an update
        assert_eq!(active[0].updated_at, at(5));
    }

    #[test]
    fn test_update_for_unknown_session_creates_row() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionProgress, "ext-9", 3))
            .unwrap();
        let session = svc.db.get_active_session(1, "ext-9").unwrap().unwrap();
        assert_eq!(session.started_at, at(3));
    }

    #[test]
    fn test_end_for_unknown_session_is_noop() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionEnd, "ghost", 0))
            .unwrap();
        assert!(svc.db.list_active_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_enrichment_monotonicity() {
        let svc = service();
        let mut start = event(ActivityEventKind::SessionStart, "ext-1", 0);
        start.user_name = None;
        start.device_name = Some(UNKNOWN.to_string());
        svc.handle_event(&start).unwrap();

        let session = svc.db.get_active_session(1, "ext-1").unwrap().unwrap();
        assert_eq!(session.user_name.as_deref(), Some(UNKNOWN));

        // Enrichment arrives
        let mut progress = event(ActivityEventKind::SessionProgress, "ext-1", 10);
        progress.device_name = Some("Living Room TV".to_string());
        svc.handle_event(&progress).unwrap();
        let session = svc.db.get_active_session(1, "ext-1").unwrap().unwrap();
        assert_eq!(session.user_name.as_deref(), Some("alice"));
        assert_eq!(session.device_name.as_deref(), Some("Living Room TV"));

        // A later degraded event must not regress resolved values
        let mut degraded = event(ActivityEventKind::SessionProgress, "ext-1", 20);
        degraded.user_name = Some(UNKNOWN.to_string());
        degraded.device_name = Some(UNKNOWN.to_string());
        svc.handle_event(&degraded).unwrap();
        let session = svc.db.get_active_session(1, "ext-1").unwrap().unwrap();
        assert_eq!(session.user_name.as_deref(), Some("alice"));
        assert_eq!(session.device_name.as_deref(), Some("Living Room TV"));
    }

    #[test]
    fn test_identity_resolution_from_history() {
        let svc = service();
        // First session resolves the user name for u1
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 0))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionEnd, "ext-1", 60))
            .unwrap();

        // Second session knows only the user id
        let mut start = event(ActivityEventKind::SessionStart, "ext-2", 5000);
        start.user_name = None;
        svc.handle_event(&start).unwrap();
        let session = svc.db.get_active_session(1, "ext-2").unwrap().unwrap();
        assert_eq!(session.user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_grouping_within_window() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "frag-1", 0))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionEnd, "frag-1", 60))
            .unwrap();

        // Reconnect 600s later: same user, same media
        svc.handle_event(&event(ActivityEventKind::SessionStart, "frag-2", 600))
            .unwrap();

        let first = svc.db.get_session(1).unwrap().unwrap();
        let second = svc.db.get_session(2).unwrap().unwrap();
        assert_eq!(first.reference_id, Some(first.id), "head points at itself");
        assert_eq!(second.reference_id, Some(first.id), "fragment joins the head's group");
    }

    #[test]
    fn test_grouping_outside_window() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "frag-1", 0))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionEnd, "frag-1", 60))
            .unwrap();

        // 2000s after the last touch: beyond the 1800s window
        svc.handle_event(&event(ActivityEventKind::SessionStart, "frag-2", 2060))
            .unwrap();

        let first = svc.db.get_session(1).unwrap().unwrap();
        let second = svc.db.get_session(2).unwrap().unwrap();
        assert_eq!(second.reference_id, Some(second.id), "distant session heads its own group");
        assert_ne!(second.reference_id, first.reference_id);
    }

    #[test]
    fn test_grouping_head_reference_is_stable() {
        let svc = service();
        for (i, external) in ["frag-1", "frag-2", "frag-3"].iter().enumerate() {
            let secs = i as i64 * 300;
            svc.handle_event(&event(ActivityEventKind::SessionStart, external, secs))
                .unwrap();
            svc.handle_event(&event(ActivityEventKind::SessionEnd, external, secs + 60))
                .unwrap();
        }

        // All three fragments share the first session's id as group head
        for id in 1..=3 {
            let session = svc.db.get_session(id).unwrap().unwrap();
            assert_eq!(session.reference_id, Some(1));
        }
    }

    #[test]
    fn test_pause_accounting_in_metadata() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 0))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionPause, "ext-1", 30))
            .unwrap();

        let session = svc.db.get_active_session(1, "ext-1").unwrap().unwrap();
        assert_eq!(session.metadata["status"], "paused");
        assert!(session.metadata.get("paused_at").is_some());

        svc.handle_event(&event(ActivityEventKind::SessionResume, "ext-1", 45))
            .unwrap();
        let session = svc.db.get_active_session(1, "ext-1").unwrap().unwrap();
        assert_eq!(session.metadata["status"], "playing");
        assert_eq!(session.metadata["paused_seconds"], 15);
        assert!(session.metadata.get("paused_at").is_none());
    }

    #[test]
    fn test_end_duration_from_event() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 0))
            .unwrap();
        let mut end = event(ActivityEventKind::SessionEnd, "ext-1", 20);
        end.duration_ms = Some(15_000);
        svc.handle_event(&end).unwrap();

        let session = svc.db.get_session(1).unwrap().unwrap();
        assert!(!session.active);
        assert_eq!(session.duration_ms, Some(15_000));
        assert_eq!(session.ended_at, Some(at(20)));
    }

    #[test]
    fn test_end_duration_falls_back_to_metadata() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 0))
            .unwrap();
        // Progress maintains the running real-play estimate
        svc.handle_event(&event(ActivityEventKind::SessionProgress, "ext-1", 120))
            .unwrap();

        let mut end = event(ActivityEventKind::SessionEnd, "ext-1", 125);
        end.duration_ms = None;
        end.position_ms = None;
        end.state = None;
        svc.handle_event(&end).unwrap();

        let session = svc.db.get_session(1).unwrap().unwrap();
        assert_eq!(session.duration_ms, Some(120_000));
    }

    #[test]
    fn test_snapshots_appended_for_position_and_state() {
        let svc = service();
        svc.handle_event(&event(ActivityEventKind::SessionStart, "ext-1", 0))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionProgress, "ext-1", 30))
            .unwrap();
        svc.handle_event(&event(ActivityEventKind::SessionProgress, "ext-1", 60))
            .unwrap();

        // Events without a position produce no snapshot
        let mut no_position = event(ActivityEventKind::SessionProgress, "ext-1", 90);
        no_position.position_ms = None;
        svc.handle_event(&no_position).unwrap();

        assert_eq!(svc.db.count_snapshots(1).unwrap(), 3);
        let snaps = svc.db.snapshots_for_session(1).unwrap();
        assert_eq!(snaps[1].position_ms, 30_000);
        assert_eq!(snaps[2].position_ms, 60_000);
    }
}
