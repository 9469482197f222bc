//! Diff-based polling collection
//!
//! Jellyfin, Audiobookshelf, and generic backends have no usable push
//! channel, so their collectors poll `now_playing()` on an interval and diff
//! the result against the previously seen session ids to synthesize
//! start/progress/pause-resume/end events. The same differ also powers the
//! permanent polling fallback of the push collectors (Plex, Emby).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::CollectorContext;
use crate::types::{ActivityEvent, ActivityEventKind, NowPlayingSession, PlaybackState};

/// Tracks previously seen sessions and synthesizes events from successive
/// now-playing lists.
#[derive(Default)]
pub struct SessionDiffer {
    tracked: HashMap<String, TrackedPoll>,
}

struct TrackedPoll {
    state: PlaybackState,
    started_at: DateTime<Utc>,
    /// Latest row, kept so the end event carries the last known fields
    last: NowPlayingSession,
}

impl SessionDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Diff a fresh now-playing list against tracked state, returning the
    /// synthesized events in a stable order (updates first, then ends).
    pub fn diff(
        &mut self,
        server_id: i64,
        rows: &[NowPlayingSession],
        now: DateTime<Utc>,
    ) -> Vec<ActivityEvent> {
        let mut events = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for row in rows {
            if row.session_id.is_empty() {
                continue;
            }
            seen.insert(row.session_id.as_str());
            let state = row.state.unwrap_or(PlaybackState::Playing);

            match self.tracked.get_mut(&row.session_id) {
                None => {
                    events.push(event_from_row(
                        ActivityEventKind::SessionStart,
                        server_id,
                        row,
                        now,
                    ));
                    self.tracked.insert(
                        row.session_id.clone(),
                        TrackedPoll {
                            state,
                            started_at: now,
                            last: row.clone(),
                        },
                    );
                }
                Some(tracked) => {
                    let kind = match (tracked.state, state) {
                        (from, to) if from == to => ActivityEventKind::SessionProgress,
                        (_, PlaybackState::Paused) => ActivityEventKind::SessionPause,
                        (PlaybackState::Paused, PlaybackState::Playing) => {
                            ActivityEventKind::SessionResume
                        }
                        (_, PlaybackState::Buffering) => ActivityEventKind::SessionBuffer,
                        (_, PlaybackState::Error) => ActivityEventKind::SessionError,
                        _ => ActivityEventKind::SessionProgress,
                    };
                    events.push(event_from_row(kind, server_id, row, now));
                    tracked.state = state;
                    tracked.last = row.clone();
                }
            }
        }

        // Sessions that vanished since the last poll have ended
        let ended: Vec<String> = self
            .tracked
            .keys()
            .filter(|k| !seen.contains(k.as_str()))
            .cloned()
            .collect();
        for key in ended {
            if let Some(tracked) = self.tracked.remove(&key) {
                let mut event =
                    event_from_row(ActivityEventKind::SessionEnd, server_id, &tracked.last, now);
                event.state = Some(PlaybackState::Stopped);
                // Best estimate for a polled backend: wall time since first seen
                event.duration_ms = Some((now - tracked.started_at).num_milliseconds().max(0));
                events.push(event);
            }
        }

        events
    }
}

/// Build a normalized event from a now-playing row.
pub(crate) fn event_from_row(
    kind: ActivityEventKind,
    server_id: i64,
    row: &NowPlayingSession,
    timestamp: DateTime<Utc>,
) -> ActivityEvent {
    let mut event = ActivityEvent::new(kind, server_id, row.session_id.clone());
    event.user_name = row.user_name.clone();
    event.user_id = row.user_id.clone();
    event.media_title = row.media_title.clone();
    event.media_type = row.media_type.clone();
    event.media_id = row.media_id.clone();
    event.series_name = row.series_name.clone();
    event.season_number = row.season_number;
    event.episode_number = row.episode_number;
    event.duration_ms = row.duration_ms;
    event.position_ms = row.position_ms;
    event.device_name = row.device_name.clone();
    event.client_name = row.client_name.clone();
    event.platform = row.platform.clone();
    event.ip_address = row.ip_address.clone();
    event.player_version = row.player_version.clone();
    event.state = row.state;
    event.transcoding = row.transcoding.clone();
    event.artwork_url = row.artwork_url.clone();
    event.timestamp = timestamp;
    event
}

/// Shared poll loop: poll, diff, emit, back off on failure.
///
/// A failed iteration is logged, counted, and backed off (interval doubled
/// up to the configured cap); the loop only exits on shutdown or when the
/// event channel closes.
pub(crate) async fn run_poll_loop(
    ctx: &CollectorContext,
    interval: Duration,
    differ: &mut SessionDiffer,
) {
    let mut shutdown = ctx.shutdown.clone();
    let cap = Duration::from_secs(ctx.monitoring.poll_backoff_cap_secs);
    let mut delay = interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.client.now_playing().await {
            Ok(rows) => {
                ctx.status.set_connected(true);
                delay = interval;
                let events = differ.diff(ctx.server.id, &rows, Utc::now());
                for event in events {
                    if !ctx.emit(event).await {
                        return;
                    }
                }
            }
            Err(e) => {
                ctx.status.set_connected(false);
                ctx.status.record_error();
                tracing::warn!(
                    server = %ctx.server.name,
                    error = %e,
                    "poll iteration failed, backing off"
                );
                delay = (delay * 2).min(cap);
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ctx.status.set_connected(false);
    tracing::info!(server = %ctx.server.name, "collector stopped");
}

/// Jellyfin: diff-polling every `jellyfin_poll_secs` (default 10s).
pub async fn run_jellyfin(ctx: CollectorContext) {
    let interval = Duration::from_secs(ctx.monitoring.jellyfin_poll_secs);
    let mut differ = SessionDiffer::new();
    run_poll_loop(&ctx, interval, &mut differ).await;
}

/// Audiobookshelf: diff-polling every `audiobookshelf_poll_secs` (default 30s).
pub async fn run_audiobookshelf(ctx: CollectorContext) {
    let interval = Duration::from_secs(ctx.monitoring.audiobookshelf_poll_secs);
    let mut differ = SessionDiffer::new();
    run_poll_loop(&ctx, interval, &mut differ).await;
}

/// Generic fallback: diff-polling every `generic_poll_secs` (default 30s),
/// used for any unrecognized server type.
pub async fn run_generic(ctx: CollectorContext) {
    let interval = Duration::from_secs(ctx.monitoring.generic_poll_secs);
    let mut differ = SessionDiffer::new();
    run_poll_loop(&ctx, interval, &mut differ).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(id: &str, state: PlaybackState, position_ms: i64) -> NowPlayingSession {
        NowPlayingSession {
            session_id: id.to_string(),
            user_name: Some("alice".to_string()),
            media_title: Some("The Matrix".to_string()),
            media_id: Some("m1".to_string()),
            position_ms: Some(position_ms),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_session_synthesizes_start() {
        let mut differ = SessionDiffer::new();
        let events = differ.diff(1, &[row("a", PlaybackState::Playing, 0)], at(0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ActivityEventKind::SessionStart);
        assert_eq!(events[0].session_id, "a");
        assert_eq!(differ.tracked_count(), 1);
    }

    #[test]
    fn test_state_changes_synthesize_pause_resume() {
        let mut differ = SessionDiffer::new();
        differ.diff(1, &[row("a", PlaybackState::Playing, 0)], at(0));

        let events = differ.diff(1, &[row("a", PlaybackState::Paused, 5000)], at(10));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ActivityEventKind::SessionPause);

        let events = differ.diff(1, &[row("a", PlaybackState::Playing, 5000)], at(20));
        assert_eq!(events[0].kind, ActivityEventKind::SessionResume);

        // Unchanged state yields progress
        let events = differ.diff(1, &[row("a", PlaybackState::Playing, 15_000)], at(30));
        assert_eq!(events[0].kind, ActivityEventKind::SessionProgress);
        assert_eq!(events[0].position_ms, Some(15_000));
    }

    #[test]
    fn test_vanished_session_synthesizes_end() {
        let mut differ = SessionDiffer::new();
        differ.diff(1, &[row("a", PlaybackState::Playing, 0)], at(0));

        let events = differ.diff(1, &[], at(120));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ActivityEventKind::SessionEnd);
        assert_eq!(events[0].state, Some(PlaybackState::Stopped));
        // Duration estimated from wall time since first sighting
        assert_eq!(events[0].duration_ms, Some(120_000));
        assert_eq!(differ.tracked_count(), 0);
    }

    #[test]
    fn test_rows_without_ids_are_dropped() {
        let mut differ = SessionDiffer::new();
        let mut bad = row("", PlaybackState::Playing, 0);
        bad.session_id = String::new();
        let events = differ.diff(1, &[bad], at(0));
        assert!(events.is_empty());
        assert_eq!(differ.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_loop_emits_and_counts_errors() {
        use super::super::testing::{test_context, test_server, FakeClient};
        use std::sync::Arc;

        let server = test_server(1, "jellyfin");
        let client = Arc::new(FakeClient::new(
            server.clone(),
            vec![row("a", PlaybackState::Playing, 0)],
        ));
        let monitoring = crate::config::MonitoringConfig {
            jellyfin_poll_secs: 3600, // effectively one iteration per test run
            ..Default::default()
        };
        let (ctx, mut rx, shutdown) = test_context(server, client.clone(), monitoring);

        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            run_jellyfin(loop_ctx).await;
        });

        // First iteration emits the synthesized start
        let event = rx.recv().await.expect("start event");
        assert_eq!(event.kind, ActivityEventKind::SessionStart);
        assert!(ctx.status.is_connected());
        assert_eq!(ctx.status.snapshot().event_count, 1);

        // Shutdown is observed at the iteration boundary
        shutdown.send(true).unwrap();
        handle.await.unwrap();
        assert!(!ctx.status.is_connected());
    }
}
