//! Read-side consolidation of grouped sessions
//!
//! History pages operate on session *groups*: fragments created by client
//! reconnects share a `reference_id` and are merged into one consolidated
//! row for display. Within a group, later resolved values win over earlier
//! placeholders; durations are summed across fragments.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{ActivityFilter, Database};
use crate::error::Result;
use crate::types::{is_known, ActivitySession};

/// One consolidated viewing session (a whole `reference_id` group).
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidatedSession {
    /// Group head id (`reference_id`, or the sole session's id)
    pub id: i64,
    pub server_id: i64,
    pub user_name: Option<String>,
    pub media_title: Option<String>,
    pub media_type: Option<String>,
    pub series_name: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub device_name: Option<String>,
    pub client_name: Option<String>,
    pub platform: Option<String>,
    pub artwork_url: Option<String>,
    /// True when any fragment is still active
    pub active: bool,
    /// Earliest fragment start
    pub started_at: DateTime<Utc>,
    /// Latest fragment activity
    pub last_activity_at: DateTime<Utc>,
    /// Summed play duration across fragments
    pub duration_ms: Option<i64>,
    /// Latest status string from the fragments' metadata
    pub status: Option<String>,
    /// External session ids of the constituent fragments
    pub grouped_session_ids: Vec<String>,
}

/// One page of consolidated history.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityPage {
    pub sessions: Vec<ConsolidatedSession>,
    pub total_groups: i64,
    pub page: usize,
    pub per_page: usize,
}

/// Read-side service over the activity store.
pub struct QueryService {
    db: Arc<Database>,
}

impl QueryService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// One page of consolidated history matching the filter.
    ///
    /// Groups are selected and ordered in SQL; the rows of the selected
    /// groups are then fetched and merged here.
    pub fn history(&self, filter: &ActivityFilter) -> Result<ActivityPage> {
        let total_groups = self.db.count_session_groups(filter)?;
        let group_keys = self.db.list_session_groups(filter)?;
        let rows = self.db.sessions_in_groups(&group_keys)?;

        // Bucket rows by group key, then consolidate preserving the SQL
        // group ordering
        let mut by_group: HashMap<i64, Vec<ActivitySession>> = HashMap::new();
        for row in rows {
            by_group.entry(row.group_key()).or_default().push(row);
        }

        let sessions = group_keys
            .iter()
            .filter_map(|key| by_group.remove(key))
            .map(consolidate)
            .collect();

        Ok(ActivityPage {
            sessions,
            total_groups,
            page: filter.page.max(1),
            per_page: filter.per_page,
        })
    }

    /// Per-server activity totals for the status surface.
    pub fn server_activity(&self) -> Result<Vec<crate::db::ServerActivity>> {
        self.db.server_activity()
    }
}

/// Merge a group's fragments (ordered oldest first) into one display row.
fn consolidate(fragments: Vec<ActivitySession>) -> ConsolidatedSession {
    debug_assert!(!fragments.is_empty());
    let head_id = fragments[0].group_key();
    let server_id = fragments[0].server_id;
    let started_at = fragments.iter().map(|f| f.started_at).min().unwrap_or_else(Utc::now);
    let last_activity_at = fragments.iter().map(|f| f.updated_at).max().unwrap_or_else(Utc::now);
    let active = fragments.iter().any(|f| f.active);

    let mut duration_ms: Option<i64> = None;
    for fragment in &fragments {
        if let Some(d) = fragment.duration_ms {
            duration_ms = Some(duration_ms.unwrap_or(0) + d);
        }
    }

    let mut merged = ConsolidatedSession {
        id: head_id,
        server_id,
        user_name: None,
        media_title: None,
        media_type: None,
        series_name: None,
        season_number: None,
        episode_number: None,
        device_name: None,
        client_name: None,
        platform: None,
        artwork_url: None,
        active,
        started_at,
        last_activity_at,
        duration_ms,
        status: None,
        grouped_session_ids: Vec::new(),
    };

    // Oldest to newest: later resolved values overwrite earlier ones, but
    // placeholders never clobber resolved data
    for fragment in &fragments {
        prefer_known(&mut merged.user_name, fragment.user_name.as_deref());
        prefer_known(&mut merged.media_title, fragment.media_title.as_deref());
        prefer_known(&mut merged.device_name, fragment.device_name.as_deref());
        prefer_known(&mut merged.client_name, fragment.client_name.as_deref());
        prefer_known(&mut merged.platform, fragment.platform.as_deref());
        prefer_some(&mut merged.media_type, fragment.media_type.as_deref());
        prefer_some(&mut merged.series_name, fragment.series_name.as_deref());
        prefer_some(&mut merged.artwork_url, fragment.artwork_url.as_deref());
        if fragment.season_number.is_some() {
            merged.season_number = fragment.season_number;
        }
        if fragment.episode_number.is_some() {
            merged.episode_number = fragment.episode_number;
        }
        if let Some(status) = fragment.metadata.get("status").and_then(|s| s.as_str()) {
            merged.status = Some(status.to_string());
        }
        merged.grouped_session_ids.push(fragment.session_id.clone());
    }

    merged
}

fn prefer_known(current: &mut Option<String>, incoming: Option<&str>) {
    if let Some(value) = incoming {
        if is_known(Some(value)) || current.is_none() {
            *current = Some(value.to_string());
        }
    }
}

fn prefer_some(current: &mut Option<String>, incoming: Option<&str>) {
    if let Some(value) = incoming {
        *current = Some(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SortField;
    use crate::types::{ActivityEvent, ActivityEventKind, PlaybackState, UNKNOWN};
    use crate::{config::MonitoringConfig, ingest::IngestService};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup() -> (IngestService, QueryService, Arc<Database>) {
        let db = Arc::new({
            let db = Database::open_in_memory().unwrap();
            db.migrate().unwrap();
            db.insert_server("test", "plex", "http://localhost", "k", true)
                .unwrap();
            db
        });
        (
            IngestService::new(Arc::clone(&db), MonitoringConfig::default()),
            QueryService::new(Arc::clone(&db)),
            db,
        )
    }

    fn event(
        kind: ActivityEventKind,
        session_id: &str,
        user: &str,
        media: &str,
        secs: i64,
    ) -> ActivityEvent {
        let mut event = ActivityEvent::new(kind, 1, session_id);
        event.user_name = Some(user.to_string());
        event.media_title = Some(media.to_string());
        event.media_id = Some(format!("id-{}", media));
        event.media_type = Some("movie".to_string());
        event.position_ms = Some(secs * 1000);
        event.state = Some(PlaybackState::Playing);
        event.timestamp = at(secs);
        event
    }

    #[test]
    fn test_history_consolidates_fragments() {
        let (ingest, query, _db) = setup();

        // One fragmented viewing session (reconnect at 600s) ...
        ingest
            .handle_event(&event(ActivityEventKind::SessionStart, "frag-1", "alice", "Matrix", 0))
            .unwrap();
        ingest
            .handle_event(&event(ActivityEventKind::SessionEnd, "frag-1", "alice", "Matrix", 300))
            .unwrap();
        ingest
            .handle_event(&event(ActivityEventKind::SessionStart, "frag-2", "alice", "Matrix", 600))
            .unwrap();
        ingest
            .handle_event(&event(ActivityEventKind::SessionEnd, "frag-2", "alice", "Matrix", 900))
            .unwrap();
        // ... and one unrelated session
        ingest
            .handle_event(&event(ActivityEventKind::SessionStart, "solo", "bob", "Dune", 100))
            .unwrap();

        let page = query.history(&ActivityFilter::default()).unwrap();
        assert_eq!(page.total_groups, 2);
        assert_eq!(page.sessions.len(), 2);

        let matrix = page
            .sessions
            .iter()
            .find(|s| s.media_title.as_deref() == Some("Matrix"))
            .unwrap();
        assert_eq!(matrix.grouped_session_ids, vec!["frag-1", "frag-2"]);
        assert_eq!(matrix.started_at, at(0));
        assert!(!matrix.active);

        let dune = page
            .sessions
            .iter()
            .find(|s| s.media_title.as_deref() == Some("Dune"))
            .unwrap();
        assert!(dune.active);
        assert_eq!(dune.grouped_session_ids, vec!["solo"]);
    }

    #[test]
    fn test_history_filters_by_user_substring() {
        let (ingest, query, _db) = setup();
        ingest
            .handle_event(&event(ActivityEventKind::SessionStart, "a", "alice", "Matrix", 0))
            .unwrap();
        ingest
            .handle_event(&event(ActivityEventKind::SessionStart, "b", "bob", "Dune", 10))
            .unwrap();

        let filter = ActivityFilter {
            user_name: Some("LIC".to_string()),
            ..Default::default()
        };
        let page = query.history(&filter).unwrap();
        assert_eq!(page.total_groups, 1);
        assert_eq!(page.sessions[0].user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_history_pagination_and_sort() {
        let (ingest, query, _db) = setup();
        for i in 0..5 {
            ingest
                .handle_event(&event(
                    ActivityEventKind::SessionStart,
                    &format!("s-{}", i),
                    "alice",
                    // Distinct media so nothing groups
                    &format!("Movie {}", i),
                    i * 4000,
                ))
                .unwrap();
        }

        let filter = ActivityFilter {
            per_page: 2,
            page: 1,
            sort: SortField::StartedAt,
            descending: true,
            ..Default::default()
        };
        let page = query.history(&filter).unwrap();
        assert_eq!(page.total_groups, 5);
        assert_eq!(page.sessions.len(), 2);
        // Newest first
        assert_eq!(page.sessions[0].media_title.as_deref(), Some("Movie 4"));
        assert_eq!(page.sessions[1].media_title.as_deref(), Some("Movie 3"));

        let filter = ActivityFilter {
            per_page: 2,
            page: 3,
            ..filter
        };
        let page = query.history(&filter).unwrap();
        assert_eq!(page.sessions.len(), 1);
        assert_eq!(page.sessions[0].media_title.as_deref(), Some("Movie 0"));
    }

    #[test]
    fn test_consolidate_merge_rule() {
        use serde_json::json;
        let base = ActivitySession {
            id: 1,
            server_id: 1,
            session_id: "frag-1".to_string(),
            reference_id: Some(1),
            active: false,
            user_name: Some(UNKNOWN.to_string()),
            user_id: None,
            media_title: Some("Matrix".to_string()),
            media_type: Some("movie".to_string()),
            media_id: Some("m1".to_string()),
            series_name: None,
            season_number: None,
            episode_number: None,
            device_name: Some("TV".to_string()),
            client_name: None,
            platform: None,
            ip_address: None,
            player_version: None,
            artwork_url: None,
            started_at: at(0),
            ended_at: Some(at(60)),
            updated_at: at(60),
            duration_ms: Some(60_000),
            transcoding_info: None,
            metadata: json!({"status": "stopped"}),
        };
        let mut second = base.clone();
        second.id = 2;
        second.session_id = "frag-2".to_string();
        second.user_name = Some("alice".to_string());
        // A later placeholder must not clobber the earlier resolved device
        second.device_name = Some(UNKNOWN.to_string());
        second.started_at = at(600);
        second.updated_at = at(900);
        second.duration_ms = Some(30_000);

        let merged = consolidate(vec![base, second]);
        assert_eq!(merged.id, 1);
        assert_eq!(merged.user_name.as_deref(), Some("alice"));
        assert_eq!(merged.device_name.as_deref(), Some("TV"));
        assert_eq!(merged.duration_ms, Some(90_000));
        assert_eq!(merged.started_at, at(0));
        assert_eq!(merged.last_activity_at, at(900));
        assert_eq!(merged.grouped_session_ids, vec!["frag-1", "frag-2"]);
    }
}
