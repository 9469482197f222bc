//! Plex session state machine
//!
//! Plex's alert stream reports raw `PlaySessionStateNotification` payloads
//! keyed by the transient `sessionKey`. This module turns that stream into
//! clean [`ActivityEvent`]s:
//!
//! - first sighting registers the session and synchronously enriches it from
//!   `/status/sessions` (username, title, device); on failure the session is
//!   marked `needs_enrichment` and retried on the fast cadence
//! - pause duration is accounted from transition timestamps and subtracted
//!   from elapsed time on stop
//! - sessions with less real play time than the configured minimum are
//!   discarded entirely: nothing is emitted, nothing is persisted. To make
//!   that possible the `session_start` emission is deferred until the
//!   session crosses the minimum; the deferred event carries the original
//!   start timestamp
//! - every alert resets a one-shot stale timer per session key; on fire the
//!   session is force-stopped so dropped connections never leave sessions
//!   open indefinitely
//!
//! All mutable per-session state lives behind one mutex; timers live in a
//! parallel map keyed by session key and are cancelled on clean stop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::{poll::event_from_row, CollectorContext};
use crate::clients::{field_i64, field_str};
use crate::types::{
    ActivityEvent, ActivityEventKind, NowPlayingSession, PlaybackState,
};

/// Alert types Plex sends that carry no playback state. Silently discarded.
const IGNORED_ALERT_TYPES: &[&str] = &[
    "timeline",
    "activity",
    "status",
    "progress",
    "transcodeSession.update",
    "update.statechange",
    "provider.content.change",
    "backgroundProcessingQueue",
];

/// One observed state change, the unit the state machine operates on.
#[derive(Debug, Clone)]
pub struct SessionTransition {
    /// Plex's transient per-connection key
    pub session_key: String,
    pub to: PlaybackState,
    pub timestamp: DateTime<Utc>,
    pub view_offset_ms: Option<i64>,
    pub rating_key: Option<String>,
}

struct TrackedSession {
    /// External session id events are emitted under: the durable Plex
    /// session id when enrichment resolved it at registration, else the
    /// transient key. Fixed for the session's lifetime so one playback
    /// attempt never fragments across ids.
    session_id: String,
    state: PlaybackState,
    started_at: DateTime<Utc>,
    last_alert_at: DateTime<Utc>,
    view_offset_ms: Option<i64>,
    paused_at: Option<DateTime<Utc>>,
    paused_ms: i64,
    buffer_count: u32,
    needs_enrichment: bool,
    start_emitted: bool,
    last_progress_at: Option<DateTime<Utc>>,
    /// Enrichment data; refreshed by the backup poll until resolved
    info: NowPlayingSession,
}

impl TrackedSession {
    /// Real play time so far: elapsed minus accumulated (and in-progress)
    /// pause time.
    fn real_play_ms(&self, now: DateTime<Utc>) -> i64 {
        let elapsed = (now - self.started_at).num_milliseconds().max(0);
        let mut paused = self.paused_ms;
        if let Some(paused_at) = self.paused_at {
            paused += (now - paused_at).num_milliseconds().max(0);
        }
        (elapsed - paused).max(0)
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, TrackedSession>,
    /// Keys with a registration (and its synchronous enrichment) in flight;
    /// guards against duplicate start alerts racing each other
    starting: HashSet<String>,
}

enum Decision {
    Ignore,
    Register,
    Emit {
        events: Vec<ActivityEvent>,
        stopped: bool,
        want_enrich: bool,
    },
}

/// Per-collector state machine over Plex session keys.
pub struct SessionManager {
    ctx: CollectorContext,
    inner: Mutex<Inner>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(ctx: CollectorContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inner: Mutex::new(Inner::default()),
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Number of sessions currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Current state of a tracked session, for diagnostics.
    pub fn session_state(&self, session_key: &str) -> Option<PlaybackState> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session_key)
            .map(|s| s.state)
    }

    /// Consume one alert container from the websocket.
    ///
    /// Non-playback alert types are silently discarded. Playback
    /// notifications missing a session key are dropped and counted.
    pub async fn handle_alert(self: &Arc<Self>, container: &serde_json::Value) {
        let alert_type = container
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default();
        if alert_type != "playing" {
            if !IGNORED_ALERT_TYPES.contains(&alert_type) {
                tracing::trace!(alert_type, "ignoring unrecognized alert type");
            }
            return;
        }

        let Some(notifications) = container
            .get("PlaySessionStateNotification")
            .and_then(|n| n.as_array())
        else {
            self.ctx.status.record_error();
            tracing::debug!("playing alert without PlaySessionStateNotification");
            return;
        };

        for notification in notifications {
            let Some(session_key) = field_str(notification, "sessionKey") else {
                self.ctx.status.record_error();
                tracing::debug!("dropping playback notification without sessionKey");
                continue;
            };
            let to = field_str(notification, "state")
                .map(|s| PlaybackState::from_state_str(&s))
                .unwrap_or(PlaybackState::Unknown);
            let transition = SessionTransition {
                session_key,
                to,
                timestamp: Utc::now(),
                view_offset_ms: field_i64(notification, "viewOffset"),
                rating_key: field_str(notification, "ratingKey"),
            };
            self.apply_transition(transition).await;
        }
    }

    /// Drive the state machine with one transition.
    pub async fn apply_transition(self: &Arc<Self>, transition: SessionTransition) {
        let decision = {
            let mut inner = self.inner.lock().unwrap();
            if inner.sessions.contains_key(&transition.session_key) {
                self.handle_tracked(&mut inner, &transition)
            } else if matches!(
                transition.to,
                PlaybackState::Stopped | PlaybackState::Unknown
            ) {
                // A stop for a session we never tracked carries no information
                Decision::Ignore
            } else if inner.starting.contains(&transition.session_key) {
                // Duplicate start alert while registration is in flight
                Decision::Ignore
            } else {
                inner.starting.insert(transition.session_key.clone());
                Decision::Register
            }
        };

        match decision {
            Decision::Ignore => {}
            Decision::Register => self.register_session(transition).await,
            Decision::Emit {
                events,
                stopped,
                want_enrich,
            } => {
                if stopped {
                    self.cancel_timer(&transition.session_key);
                } else {
                    self.reset_timer(&transition.session_key);
                }
                for event in events {
                    if !self.ctx.emit(event).await {
                        return;
                    }
                }
                if want_enrich {
                    self.try_enrich(&transition.session_key).await;
                }
            }
        }
    }

    /// Transition handling for an already-tracked session. Runs under the
    /// state lock; emits nothing itself.
    fn handle_tracked(&self, inner: &mut Inner, t: &SessionTransition) -> Decision {
        let cfg = &self.ctx.monitoring;
        let server_id = self.ctx.server.id;
        let min_play_ms = cfg.session_min_play_secs * 1000;

        let entry = inner
            .sessions
            .get_mut(&t.session_key)
            .expect("checked by caller");
        entry.last_alert_at = t.timestamp;
        if let Some(offset) = t.view_offset_ms {
            entry.view_offset_ms = Some(offset);
        }

        let mut events = Vec::new();

        // Deferred start: emit once the session crosses the minimum real
        // play time, stamped with the original start timestamp
        if !entry.start_emitted && entry.real_play_ms(t.timestamp) >= min_play_ms {
            entry.start_emitted = true;
            events.push(Self::event_for(
                entry,
                server_id,
                ActivityEventKind::SessionStart,
                PlaybackState::Playing,
                entry.started_at,
            ));
        }

        let mut stopped = false;
        match (entry.state, t.to) {
            (_, PlaybackState::Stopped) => {
                stopped = true;
            }
            (from, PlaybackState::Paused) if from != PlaybackState::Paused => {
                entry.paused_at = Some(t.timestamp);
                entry.state = PlaybackState::Paused;
                if entry.start_emitted {
                    events.push(Self::event_for(
                        entry,
                        server_id,
                        ActivityEventKind::SessionPause,
                        PlaybackState::Paused,
                        t.timestamp,
                    ));
                }
            }
            (PlaybackState::Paused, PlaybackState::Playing) => {
                if let Some(paused_at) = entry.paused_at.take() {
                    entry.paused_ms += (t.timestamp - paused_at).num_milliseconds().max(0);
                }
                entry.state = PlaybackState::Playing;
                if entry.start_emitted {
                    events.push(Self::event_for(
                        entry,
                        server_id,
                        ActivityEventKind::SessionResume,
                        PlaybackState::Playing,
                        t.timestamp,
                    ));
                }
            }
            (_, PlaybackState::Buffering) => {
                entry.buffer_count += 1;
                if entry.buffer_count >= cfg.buffer_warn_threshold {
                    tracing::warn!(
                        session_key = %t.session_key,
                        buffer_count = entry.buffer_count,
                        "session is buffering repeatedly"
                    );
                }
                entry.state = PlaybackState::Buffering;
                if entry.start_emitted {
                    events.push(Self::event_for(
                        entry,
                        server_id,
                        ActivityEventKind::SessionBuffer,
                        PlaybackState::Buffering,
                        t.timestamp,
                    ));
                }
            }
            (_, PlaybackState::Error) => {
                entry.state = PlaybackState::Error;
                if entry.start_emitted {
                    events.push(Self::event_for(
                        entry,
                        server_id,
                        ActivityEventKind::SessionError,
                        PlaybackState::Error,
                        t.timestamp,
                    ));
                }
            }
            (_, PlaybackState::Playing) => {
                entry.state = PlaybackState::Playing;
            }
            _ => {}
        }

        let mut want_enrich = false;
        if stopped {
            let entry = inner
                .sessions
                .remove(&t.session_key)
                .expect("present above");
            let real_play_ms = entry.real_play_ms(t.timestamp);
            if real_play_ms < min_play_ms {
                tracing::debug!(
                    session_key = %t.session_key,
                    real_play_ms,
                    "discarding session below minimum play time"
                );
            } else {
                if !entry.start_emitted {
                    events.push(Self::event_for(
                        &entry,
                        server_id,
                        ActivityEventKind::SessionStart,
                        PlaybackState::Playing,
                        entry.started_at,
                    ));
                }
                let mut end = Self::event_for(
                    &entry,
                    server_id,
                    ActivityEventKind::SessionEnd,
                    PlaybackState::Stopped,
                    t.timestamp,
                );
                end.duration_ms = Some(real_play_ms);
                events.push(end);
            }
        } else if matches!(entry.state, PlaybackState::Playing | PlaybackState::Paused)
            && entry.start_emitted
        {
            // Conditional progress: fast cadence while enrichment is
            // outstanding, slow cadence once resolved
            let interval_secs = if entry.needs_enrichment {
                cfg.enrichment_retry_secs
            } else {
                cfg.progress_interval_secs
            };
            let due = entry
                .last_progress_at
                .map(|last| (t.timestamp - last).num_seconds() >= interval_secs)
                .unwrap_or(true);
            if due {
                entry.last_progress_at = Some(t.timestamp);
                events.push(Self::event_for(
                    entry,
                    server_id,
                    ActivityEventKind::SessionProgress,
                    entry.state,
                    t.timestamp,
                ));
                want_enrich = entry.needs_enrichment;
            }
        }

        Decision::Emit {
            events,
            stopped,
            want_enrich,
        }
    }

    /// First sighting: enrich synchronously from the now-playing list, then
    /// insert the tracked entry. The `starting` guard held by the caller
    /// keeps duplicate start alerts out while enrichment is in flight.
    async fn register_session(self: &Arc<Self>, t: SessionTransition) {
        let enriched = match self.ctx.client.now_playing().await {
            Ok(rows) => rows
                .into_iter()
                .find(|row| row.session_key.as_deref() == Some(t.session_key.as_str())),
            Err(e) => {
                tracing::debug!(
                    session_key = %t.session_key,
                    error = %e,
                    "initial enrichment failed"
                );
                None
            }
        };

        let needs_enrichment = enriched.is_none();
        let mut info = enriched.unwrap_or_else(|| NowPlayingSession {
            session_id: t.session_key.clone(),
            session_key: Some(t.session_key.clone()),
            ..Default::default()
        });
        if info.media_id.is_none() {
            info.media_id = t.rating_key.clone();
        }
        let session_id = info.session_id.clone();
        let min_play_ms = self.ctx.monitoring.session_min_play_secs * 1000;

        let start_event = {
            let mut inner = self.inner.lock().unwrap();
            inner.starting.remove(&t.session_key);
            if inner.sessions.contains_key(&t.session_key) {
                None
            } else {
                let mut entry = TrackedSession {
                    session_id,
                    state: if t.to == PlaybackState::Unknown {
                        PlaybackState::Playing
                    } else {
                        t.to
                    },
                    started_at: t.timestamp,
                    last_alert_at: t.timestamp,
                    view_offset_ms: t.view_offset_ms,
                    paused_at: (t.to == PlaybackState::Paused).then_some(t.timestamp),
                    paused_ms: 0,
                    buffer_count: 0,
                    needs_enrichment,
                    start_emitted: false,
                    last_progress_at: Some(t.timestamp),
                    info,
                };
                let event = (entry.real_play_ms(t.timestamp) >= min_play_ms).then(|| {
                    entry.start_emitted = true;
                    Self::event_for(
                        &entry,
                        self.ctx.server.id,
                        ActivityEventKind::SessionStart,
                        PlaybackState::Playing,
                        entry.started_at,
                    )
                });
                inner.sessions.insert(t.session_key.clone(), entry);
                event
            }
        };

        if needs_enrichment {
            tracing::debug!(
                session_key = %t.session_key,
                "session registered without enrichment, retrying on progress cadence"
            );
        }
        self.reset_timer(&t.session_key);
        if let Some(event) = start_event {
            self.ctx.emit(event).await;
        }
    }

    /// Synthesize a stop for a session the server went quiet about.
    pub async fn force_stop(self: &Arc<Self>, session_key: &str) {
        self.apply_transition(SessionTransition {
            session_key: session_key.to_string(),
            to: PlaybackState::Stopped,
            timestamp: Utc::now(),
            view_offset_ms: None,
            rating_key: None,
        })
        .await;
    }

    /// Backup-poll hook: resolve outstanding enrichment from fresh
    /// now-playing rows and force-stop tracked sessions the server has not
    /// reported (live or via alerts) for longer than the orphan window.
    pub async fn refresh_from_poll(self: &Arc<Self>, rows: &[NowPlayingSession]) {
        let now = Utc::now();
        let orphan_window =
            chrono::Duration::seconds(self.ctx.monitoring.plex_orphan_secs as i64);

        let orphans: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            let live: HashSet<&str> = rows
                .iter()
                .filter_map(|row| row.session_key.as_deref())
                .collect();

            let mut orphans = Vec::new();
            for (key, entry) in inner.sessions.iter_mut() {
                if entry.needs_enrichment {
                    if let Some(row) = rows
                        .iter()
                        .find(|row| row.session_key.as_deref() == Some(key.as_str()))
                    {
                        entry.info = row.clone();
                        entry.needs_enrichment = false;
                        tracing::debug!(session_key = %key, "session enriched by backup poll");
                    }
                }
                if !live.contains(key.as_str()) && now - entry.last_alert_at > orphan_window {
                    orphans.push(key.clone());
                }
            }
            orphans
        };

        for key in orphans {
            tracing::warn!(session_key = %key, "tracked session missing from live sessions, forcing stop");
            self.force_stop(&key).await;
        }
    }

    /// Opportunistic enrichment retry on the progress cadence.
    async fn try_enrich(self: &Arc<Self>, session_key: &str) {
        let rows = match self.ctx.client.now_playing().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!(session_key, error = %e, "enrichment retry failed");
                return;
            }
        };
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.sessions.get_mut(session_key) {
            if let Some(row) = rows
                .iter()
                .find(|row| row.session_key.as_deref() == Some(session_key))
            {
                entry.info = row.clone();
                entry.needs_enrichment = false;
                tracing::debug!(session_key, "session enriched");
            }
        }
    }

    /// Cancel all timers. Tracked sessions are left for startup recovery.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    fn reset_timer(self: &Arc<Self>, session_key: &str) {
        let stale = Duration::from_secs(self.ctx.monitoring.session_stale_secs);
        let weak = Arc::downgrade(self);
        let key = session_key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(stale).await;
            if let Some(manager) = weak.upgrade() {
                tracing::warn!(session_key = %key, "no alerts within stale window, forcing stop");
                manager.force_stop(&key).await;
            }
        });
        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.insert(session_key.to_string(), handle) {
            old.abort();
        }
    }

    fn cancel_timer(&self, session_key: &str) {
        if let Some(handle) = self.timers.lock().unwrap().remove(session_key) {
            handle.abort();
        }
    }

    fn event_for(
        entry: &TrackedSession,
        server_id: i64,
        kind: ActivityEventKind,
        state: PlaybackState,
        timestamp: DateTime<Utc>,
    ) -> ActivityEvent {
        let mut event = event_from_row(kind, server_id, &entry.info, timestamp);
        event.session_id = entry.session_id.clone();
        event.position_ms = entry.view_offset_ms.or(entry.info.position_ms);
        event.state = Some(state);
        event
    }
}
