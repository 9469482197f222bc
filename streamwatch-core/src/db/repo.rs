//! Database repository layer
//!
//! Provides query and insert operations for the media server registry,
//! activity sessions, and activity snapshots.
//!
//! All writes go through [`Database::with_retry`]: the store is
//! single-writer, and contention between the request side and the background
//! ingestion task is expected. Lock errors are retried with exponential
//! backoff; everything else propagates immediately.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Column to sort consolidated history by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    StartedAt,
    UpdatedAt,
    UserName,
    MediaTitle,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            SortField::StartedAt => "started_at",
            SortField::UpdatedAt => "updated_at",
            SortField::UserName => "user_name",
            SortField::MediaTitle => "media_title",
        }
    }
}

/// Filter for activity history queries.
///
/// Pagination operates on session *groups* (`COALESCE(reference_id, id)`),
/// not raw rows, so a reconnect-fragmented viewing session counts once.
#[derive(Debug, Clone)]
pub struct ActivityFilter {
    /// Restrict to these servers; empty means all
    pub server_ids: Vec<i64>,
    /// Case-insensitive substring match on user_name
    pub user_name: Option<String>,
    /// Exact media type ("movie", "episode", ...)
    pub media_type: Option<String>,
    /// Sessions started at or after this time
    pub from: Option<DateTime<Utc>>,
    /// Sessions started at or before this time
    pub to: Option<DateTime<Utc>>,
    /// Only currently active sessions
    pub active_only: bool,
    pub sort: SortField,
    pub descending: bool,
    /// 1-based page number
    pub page: usize,
    pub per_page: usize,
}

impl Default for ActivityFilter {
    fn default() -> Self {
        Self {
            server_ids: Vec::new(),
            user_name: None,
            media_type: None,
            from: None,
            to: None,
            active_only: false,
            sort: SortField::StartedAt,
            descending: true,
            page: 1,
            per_page: 25,
        }
    }
}

/// Per-server activity totals for the status surface.
#[derive(Debug, Clone)]
pub struct ServerActivity {
    pub server_id: i64,
    pub server_name: String,
    pub active_sessions: i64,
    pub total_sessions: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
    retry_attempts: u32,
    retry_base: Duration,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

fn parse_json(s: Option<String>) -> serde_json::Value {
    s.and_then(|v| serde_json::from_str(&v).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn parse_opt_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|v| serde_json::from_str(&v).ok())
}

/// True for SQLITE_BUSY / SQLITE_LOCKED, the only errors worth retrying.
fn is_lock_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(fe, _)
            if fe.code == rusqlite::ErrorCode::DatabaseBusy
                || fe.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            retry_attempts: 3,
            retry_base: Duration::from_millis(100),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry_attempts: 3,
            retry_base: Duration::from_millis(100),
        })
    }

    /// Override the commit retry policy (attempts, base delay).
    pub fn with_retry_policy(mut self, attempts: u32, base: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base = base;
        self
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run a write with the commit-with-retry policy.
    ///
    /// Lock errors (SQLITE_BUSY / SQLITE_LOCKED) are retried up to the
    /// configured attempt count with exponential backoff (100ms, 200ms,
    /// 400ms by default). Any other error propagates immediately.
    fn with_retry<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let mut delay = self.retry_base;
        let mut attempt = 1;
        loop {
            let result = {
                let conn = self.conn.lock().unwrap();
                f(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_lock_error(&e) && attempt < self.retry_attempts => {
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "database locked, retrying commit");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    // ============================================
    // Media server registry
    // ============================================

    /// Register a media server.
    pub fn insert_server(
        &self,
        name: &str,
        server_type: &str,
        url: &str,
        api_key: &str,
        verified: bool,
    ) -> Result<MediaServer> {
        let created_at = Utc::now();
        let id = self.with_retry(|conn| {
            conn.execute(
                r#"
                INSERT INTO media_servers (name, server_type, url, api_key, verified, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![name, server_type, url, api_key, verified as i64, ts(&created_at)],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(MediaServer {
            id,
            name: name.to_string(),
            server_type: server_type.to_string(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            verified,
            created_at,
        })
    }

    /// Get a media server by id
    pub fn get_server(&self, id: i64) -> Result<Option<MediaServer>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM media_servers WHERE id = ?", [id], |row| {
            Self::row_to_server(row)
        })
        .optional()
        .map_err(Error::from)
    }

    /// List all registered media servers
    pub fn list_servers(&self) -> Result<Vec<MediaServer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM media_servers ORDER BY id")?;
        let rows = stmt.query_map([], |row| Self::row_to_server(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// List verified media servers (the set the orchestrator monitors)
    pub fn list_verified_servers(&self) -> Result<Vec<MediaServer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM media_servers WHERE verified = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| Self::row_to_server(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Mark a server verified/unverified
    pub fn set_server_verified(&self, id: i64, verified: bool) -> Result<()> {
        let changed = self.with_retry(|conn| {
            conn.execute(
                "UPDATE media_servers SET verified = ?1 WHERE id = ?2",
                params![verified as i64, id],
            )
        })?;
        if changed == 0 {
            return Err(Error::ServerNotFound(id));
        }
        Ok(())
    }

    /// Remove a server from the registry
    pub fn delete_server(&self, id: i64) -> Result<()> {
        let changed =
            self.with_retry(|conn| conn.execute("DELETE FROM media_servers WHERE id = ?", [id]))?;
        if changed == 0 {
            return Err(Error::ServerNotFound(id));
        }
        Ok(())
    }

    fn row_to_server(row: &Row) -> rusqlite::Result<MediaServer> {
        let created_at: String = row.get("created_at")?;
        Ok(MediaServer {
            id: row.get("id")?,
            name: row.get("name")?,
            server_type: row.get("server_type")?,
            url: row.get("url")?,
            api_key: row.get("api_key")?,
            verified: row.get::<_, i64>("verified")? != 0,
            created_at: parse_ts(&created_at),
        })
    }

    // ============================================
    // Activity sessions
    // ============================================

    /// Insert a new activity session, returning its database id.
    pub fn insert_session(&self, s: &ActivitySession) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                r#"
                INSERT INTO activity_sessions (
                    server_id, session_id, reference_id, active,
                    user_name, user_id,
                    media_title, media_type, media_id, series_name, season_number, episode_number,
                    device_name, client_name, platform, ip_address, player_version, artwork_url,
                    started_at, ended_at, updated_at, duration_ms,
                    transcoding_info, metadata
                ) VALUES (
                    ?1, ?2, ?3, ?4,
                    ?5, ?6,
                    ?7, ?8, ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15, ?16, ?17, ?18,
                    ?19, ?20, ?21, ?22,
                    ?23, ?24
                )
                "#,
                params![
                    s.server_id,
                    s.session_id,
                    s.reference_id,
                    s.active as i64,
                    s.user_name,
                    s.user_id,
                    s.media_title,
                    s.media_type,
                    s.media_id,
                    s.series_name,
                    s.season_number,
                    s.episode_number,
                    s.device_name,
                    s.client_name,
                    s.platform,
                    s.ip_address,
                    s.player_version,
                    s.artwork_url,
                    ts(&s.started_at),
                    s.ended_at.as_ref().map(ts),
                    ts(&s.updated_at),
                    s.duration_ms,
                    s.transcoding_info.as_ref().map(|v| v.to_string()),
                    s.metadata.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Update every mutable column of a session.
    pub fn update_session(&self, s: &ActivitySession) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                r#"
                UPDATE activity_sessions SET
                    reference_id = ?1, active = ?2,
                    user_name = ?3, user_id = ?4,
                    media_title = ?5, media_type = ?6, media_id = ?7,
                    series_name = ?8, season_number = ?9, episode_number = ?10,
                    device_name = ?11, client_name = ?12, platform = ?13,
                    ip_address = ?14, player_version = ?15, artwork_url = ?16,
                    ended_at = ?17, updated_at = ?18, duration_ms = ?19,
                    transcoding_info = ?20, metadata = ?21
                WHERE id = ?22
                "#,
                params![
                    s.reference_id,
                    s.active as i64,
                    s.user_name,
                    s.user_id,
                    s.media_title,
                    s.media_type,
                    s.media_id,
                    s.series_name,
                    s.season_number,
                    s.episode_number,
                    s.device_name,
                    s.client_name,
                    s.platform,
                    s.ip_address,
                    s.player_version,
                    s.artwork_url,
                    s.ended_at.as_ref().map(ts),
                    ts(&s.updated_at),
                    s.duration_ms,
                    s.transcoding_info.as_ref().map(|v| v.to_string()),
                    s.metadata.to_string(),
                    s.id,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a session by database id
    pub fn get_session(&self, id: i64) -> Result<Option<ActivitySession>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM activity_sessions WHERE id = ?", [id], |row| {
            Self::row_to_session(row)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Get the active session for an external `(server_id, session_id)`, if any.
    ///
    /// The partial unique index guarantees at most one such row.
    pub fn get_active_session(
        &self,
        server_id: i64,
        session_id: &str,
    ) -> Result<Option<ActivitySession>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM activity_sessions WHERE server_id = ?1 AND session_id = ?2 AND active = 1",
            params![server_id, session_id],
            |row| Self::row_to_session(row),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Assign the group key of a session.
    pub fn set_reference_id(&self, id: i64, reference_id: i64) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE activity_sessions SET reference_id = ?1 WHERE id = ?2",
                params![reference_id, id],
            )?;
            Ok(())
        })
    }

    /// The most recently created sessions with a lower id for the same
    /// `(server_id, user_name, media_id)`, newest first. Used by grouping.
    pub fn recent_grouping_candidates(
        &self,
        server_id: i64,
        user_name: &str,
        media_id: &str,
        before_id: i64,
        limit: usize,
    ) -> Result<Vec<ActivitySession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM activity_sessions
            WHERE server_id = ?1 AND user_name = ?2 AND media_id = ?3 AND id < ?4
            ORDER BY id DESC LIMIT ?5
            "#,
        )?;
        let rows = stmt.query_map(
            params![server_id, user_name, media_id, before_id, limit as i64],
            |row| Self::row_to_session(row),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Most recent resolved user name for a `(server_id, user_id)` pair.
    /// Used by identity resolution when an event carries an id but no name.
    pub fn latest_known_user_name(
        &self,
        server_id: i64,
        user_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT user_name FROM activity_sessions
            WHERE server_id = ?1 AND user_id = ?2
              AND user_name IS NOT NULL AND user_name != ?3
            ORDER BY id DESC LIMIT 1
            "#,
            params![server_id, user_id, UNKNOWN],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// All currently active sessions
    pub fn list_active_sessions(&self) -> Result<Vec<ActivitySession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM activity_sessions WHERE active = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| Self::row_to_session(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Active sessions for one server
    pub fn active_sessions_for_server(&self, server_id: i64) -> Result<Vec<ActivitySession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM activity_sessions WHERE active = 1 AND server_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([server_id], |row| Self::row_to_session(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Active sessions whose `updated_at` is older than the cutoff.
    pub fn stale_active_sessions(&self, cutoff: &DateTime<Utc>) -> Result<Vec<ActivitySession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM activity_sessions WHERE active = 1 AND updated_at < ? ORDER BY id",
        )?;
        let rows = stmt.query_map([ts(cutoff)], |row| Self::row_to_session(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Delete sessions started before the cutoff; snapshots cascade.
    /// Returns the number of sessions removed.
    pub fn delete_sessions_before(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        self.with_retry(|conn| {
            conn.execute(
                "DELETE FROM activity_sessions WHERE started_at < ?",
                [ts(cutoff)],
            )
        })
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<ActivitySession> {
        let started_at: String = row.get("started_at")?;
        let updated_at: String = row.get("updated_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        let transcoding_info: Option<String> = row.get("transcoding_info")?;
        let metadata: Option<String> = row.get("metadata")?;

        Ok(ActivitySession {
            id: row.get("id")?,
            server_id: row.get("server_id")?,
            session_id: row.get("session_id")?,
            reference_id: row.get("reference_id")?,
            active: row.get::<_, i64>("active")? != 0,
            user_name: row.get("user_name")?,
            user_id: row.get("user_id")?,
            media_title: row.get("media_title")?,
            media_type: row.get("media_type")?,
            media_id: row.get("media_id")?,
            series_name: row.get("series_name")?,
            season_number: row.get("season_number")?,
            episode_number: row.get("episode_number")?,
            device_name: row.get("device_name")?,
            client_name: row.get("client_name")?,
            platform: row.get("platform")?,
            ip_address: row.get("ip_address")?,
            player_version: row.get("player_version")?,
            artwork_url: row.get("artwork_url")?,
            started_at: parse_ts(&started_at),
            ended_at: parse_opt_ts(ended_at),
            updated_at: parse_ts(&updated_at),
            duration_ms: row.get("duration_ms")?,
            transcoding_info: parse_opt_json(transcoding_info),
            metadata: parse_json(metadata),
        })
    }

    // ============================================
    // Activity snapshots (append-only)
    // ============================================

    /// Append one position/state sample. Never merged or deduplicated.
    pub fn insert_snapshot(&self, snap: &ActivitySnapshot) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                r#"
                INSERT INTO activity_snapshots (
                    session_id, timestamp, position_ms, state,
                    transcoding, quality, subtitle_track, audio_track
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    snap.session_id,
                    ts(&snap.timestamp),
                    snap.position_ms,
                    snap.state.as_str(),
                    snap.transcoding as i64,
                    snap.quality,
                    snap.subtitle_track,
                    snap.audio_track,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Samples for a session, oldest first.
    pub fn snapshots_for_session(&self, session_id: i64) -> Result<Vec<ActivitySnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM activity_snapshots WHERE session_id = ? ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map([session_id], |row| Self::row_to_snapshot(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Number of samples recorded for a session.
    pub fn count_snapshots(&self, session_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM activity_snapshots WHERE session_id = ?",
            [session_id],
            |r| r.get(0),
        )
        .map_err(Error::from)
    }

    fn row_to_snapshot(row: &Row) -> rusqlite::Result<ActivitySnapshot> {
        let timestamp: String = row.get("timestamp")?;
        let state: String = row.get("state")?;
        Ok(ActivitySnapshot {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            timestamp: parse_ts(&timestamp),
            position_ms: row.get("position_ms")?,
            state: PlaybackState::from_state_str(&state),
            transcoding: row.get::<_, i64>("transcoding")? != 0,
            quality: row.get("quality")?,
            subtitle_track: row.get("subtitle_track")?,
            audio_track: row.get("audio_track")?,
        })
    }

    // ============================================
    // History queries (grouped)
    // ============================================

    fn filter_clauses(filter: &ActivityFilter) -> (String, Vec<Value>) {
        let mut conds: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.server_ids.is_empty() {
            let marks = vec!["?"; filter.server_ids.len()].join(", ");
            conds.push(format!("server_id IN ({})", marks));
            values.extend(filter.server_ids.iter().map(|id| Value::Integer(*id)));
        }
        if let Some(user) = &filter.user_name {
            conds.push("LOWER(user_name) LIKE ?".to_string());
            values.push(Value::Text(format!("%{}%", user.to_lowercase())));
        }
        if let Some(media_type) = &filter.media_type {
            conds.push("media_type = ?".to_string());
            values.push(Value::Text(media_type.clone()));
        }
        if let Some(from) = &filter.from {
            conds.push("started_at >= ?".to_string());
            values.push(Value::Text(ts(from)));
        }
        if let Some(to) = &filter.to {
            conds.push("started_at <= ?".to_string());
            values.push(Value::Text(ts(to)));
        }
        if filter.active_only {
            conds.push("active = 1".to_string());
        }

        let clause = if conds.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conds.join(" AND "))
        };
        (clause, values)
    }

    /// Total number of session groups matching the filter.
    pub fn count_session_groups(&self, filter: &ActivityFilter) -> Result<i64> {
        let (clause, values) = Self::filter_clauses(filter);
        let sql = format!(
            "SELECT COUNT(DISTINCT COALESCE(reference_id, id)) FROM activity_sessions {}",
            clause
        );
        let conn = self.conn.lock().unwrap();
        conn.query_row(&sql, params_from_iter(values), |r| r.get(0))
            .map_err(Error::from)
    }

    /// Group keys for one page of results, ordered by the aggregate of the
    /// requested sort column (MAX when descending, MIN when ascending).
    pub fn list_session_groups(&self, filter: &ActivityFilter) -> Result<Vec<i64>> {
        let (clause, mut values) = Self::filter_clauses(filter);
        let (agg, dir) = if filter.descending {
            ("MAX", "DESC")
        } else {
            ("MIN", "ASC")
        };
        let sql = format!(
            r#"
            SELECT COALESCE(reference_id, id) AS group_key
            FROM activity_sessions {}
            GROUP BY group_key
            ORDER BY {}({}) {}
            LIMIT ? OFFSET ?
            "#,
            clause,
            agg,
            filter.sort.column(),
            dir
        );
        let page = filter.page.max(1);
        values.push(Value::Integer(filter.per_page as i64));
        values.push(Value::Integer(((page - 1) * filter.per_page) as i64));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |r| r.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// All rows belonging to the given groups, oldest first.
    pub fn sessions_in_groups(&self, group_keys: &[i64]) -> Result<Vec<ActivitySession>> {
        if group_keys.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; group_keys.len()].join(", ");
        let sql = format!(
            "SELECT * FROM activity_sessions WHERE COALESCE(reference_id, id) IN ({}) ORDER BY id",
            marks
        );
        let values: Vec<Value> = group_keys.iter().map(|k| Value::Integer(*k)).collect();

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| Self::row_to_session(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Per-server activity totals, one row per registered server.
    pub fn server_activity(&self) -> Result<Vec<ServerActivity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT
                ms.id,
                ms.name,
                COALESCE(SUM(CASE WHEN a.active = 1 THEN 1 ELSE 0 END), 0) AS active_sessions,
                COUNT(a.id) AS total_sessions,
                MAX(a.updated_at) AS last_activity
            FROM media_servers ms
            LEFT JOIN activity_sessions a ON a.server_id = ms.id
            GROUP BY ms.id
            ORDER BY ms.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let last_activity: Option<String> = row.get("last_activity")?;
            Ok(ServerActivity {
                server_id: row.get("id")?,
                server_name: row.get("name")?,
                active_sessions: row.get("active_sessions")?,
                total_sessions: row.get("total_sessions")?,
                last_activity: parse_opt_ts(last_activity),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn test_session(server_id: i64, external_id: &str, started_at: DateTime<Utc>) -> ActivitySession {
        ActivitySession {
            id: 0,
            server_id,
            session_id: external_id.to_string(),
            reference_id: None,
            active: true,
            user_name: Some("alice".to_string()),
            user_id: Some("u1".to_string()),
            media_title: Some("The Matrix".to_string()),
            media_type: Some("movie".to_string()),
            media_id: Some("m1".to_string()),
            series_name: None,
            season_number: None,
            episode_number: None,
            device_name: Some("Living Room TV".to_string()),
            client_name: Some("Plex for TV".to_string()),
            platform: Some("tvOS".to_string()),
            ip_address: None,
            player_version: None,
            artwork_url: None,
            started_at,
            ended_at: None,
            updated_at: started_at,
            duration_ms: None,
            transcoding_info: None,
            metadata: serde_json::json!({}),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        {
            let db = Database::open(&path).unwrap();
            db.migrate().unwrap();
            db.insert_server("den", "plex", "http://plex.local", "k", true)
                .unwrap();
        }
        // Reopen: parent dirs were created, data survived
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        assert_eq!(db.list_servers().unwrap().len(), 1);
    }

    #[test]
    fn test_server_crud() {
        let db = test_db();

        let server = db
            .insert_server("den", "plex", "http://plex.local:32400", "token", false)
            .unwrap();
        assert_eq!(server.kind(), ServerKind::Plex);
        assert!(db.list_verified_servers().unwrap().is_empty());

        db.set_server_verified(server.id, true).unwrap();
        let verified = db.list_verified_servers().unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].name, "den");

        db.delete_server(server.id).unwrap();
        assert!(db.get_server(server.id).unwrap().is_none());
        assert!(matches!(
            db.set_server_verified(server.id, true),
            Err(Error::ServerNotFound(_))
        ));
    }

    #[test]
    fn test_session_round_trip() {
        let db = test_db();
        let server = db
            .insert_server("den", "plex", "http://plex.local", "k", true)
            .unwrap();

        let mut session = test_session(server.id, "ext-1", at(0));
        session.metadata = serde_json::json!({"status": "playing"});
        let id = db.insert_session(&session).unwrap();

        let stored = db.get_session(id).unwrap().unwrap();
        assert_eq!(stored.session_id, "ext-1");
        assert_eq!(stored.user_name.as_deref(), Some("alice"));
        assert_eq!(stored.metadata["status"], "playing");
        assert!(stored.active);

        let active = db.get_active_session(server.id, "ext-1").unwrap();
        assert!(active.is_some());
        assert!(db.get_active_session(server.id, "other").unwrap().is_none());
    }

    #[test]
    fn test_grouping_candidates_order() {
        let db = test_db();
        let server = db
            .insert_server("den", "plex", "http://plex.local", "k", true)
            .unwrap();

        let mut first = test_session(server.id, "a", at(0));
        first.active = false;
        let first_id = db.insert_session(&first).unwrap();

        let mut second = test_session(server.id, "b", at(100));
        second.active = false;
        let second_id = db.insert_session(&second).unwrap();

        let third = test_session(server.id, "c", at(200));
        let third_id = db.insert_session(&third).unwrap();

        let candidates = db
            .recent_grouping_candidates(server.id, "alice", "m1", third_id, 2)
            .unwrap();
        assert_eq!(candidates.len(), 2);
        // Newest first, own id excluded
        assert_eq!(candidates[0].id, second_id);
        assert_eq!(candidates[1].id, first_id);
    }

    #[test]
    fn test_stale_and_retention_queries() {
        let db = test_db();
        let server = db
            .insert_server("den", "plex", "http://plex.local", "k", true)
            .unwrap();

        let old = test_session(server.id, "old", at(0));
        let old_id = db.insert_session(&old).unwrap();

        let fresh = test_session(server.id, "fresh", at(5000));
        db.insert_session(&fresh).unwrap();

        let stale = db.stale_active_sessions(&at(2500)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old_id);

        let removed = db.delete_sessions_before(&at(2500)).unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_session(old_id).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_append_and_count() {
        let db = test_db();
        let server = db
            .insert_server("den", "plex", "http://plex.local", "k", true)
            .unwrap();
        let id = db.insert_session(&test_session(server.id, "a", at(0))).unwrap();

        for i in 0..3 {
            db.insert_snapshot(&ActivitySnapshot {
                id: 0,
                session_id: id,
                timestamp: at(i * 10),
                position_ms: i * 10_000,
                state: PlaybackState::Playing,
                transcoding: false,
                quality: Some("1080p".to_string()),
                subtitle_track: None,
                audio_track: None,
            })
            .unwrap();
        }

        assert_eq!(db.count_snapshots(id).unwrap(), 3);
        let snaps = db.snapshots_for_session(id).unwrap();
        assert_eq!(snaps[0].position_ms, 0);
        assert_eq!(snaps[2].position_ms, 20_000);
    }

    #[test]
    fn test_group_pagination() {
        let db = test_db();
        let server = db
            .insert_server("den", "plex", "http://plex.local", "k", true)
            .unwrap();

        // Two fragments in one group, one standalone session
        let mut head = test_session(server.id, "a", at(0));
        head.active = false;
        let head_id = db.insert_session(&head).unwrap();
        db.set_reference_id(head_id, head_id).unwrap();

        let mut frag = test_session(server.id, "b", at(60));
        frag.active = false;
        frag.reference_id = Some(head_id);
        db.insert_session(&frag).unwrap();

        let mut other = test_session(server.id, "c", at(120));
        other.user_name = Some("bob".to_string());
        let other_id = db.insert_session(&other).unwrap();

        let filter = ActivityFilter::default();
        assert_eq!(db.count_session_groups(&filter).unwrap(), 2);

        let groups = db.list_session_groups(&filter).unwrap();
        assert_eq!(groups.len(), 2);
        // Descending by started_at: the standalone (newest) group first
        assert_eq!(groups[0], other_id);
        assert_eq!(groups[1], head_id);

        let rows = db.sessions_in_groups(&[head_id]).unwrap();
        assert_eq!(rows.len(), 2);

        // User filter is a case-insensitive substring match
        let filter = ActivityFilter {
            user_name: Some("ALI".to_string()),
            ..Default::default()
        };
        assert_eq!(db.count_session_groups(&filter).unwrap(), 1);
    }

    #[test]
    fn test_server_activity_totals() {
        let db = test_db();
        let server = db
            .insert_server("den", "plex", "http://plex.local", "k", true)
            .unwrap();
        let quiet = db
            .insert_server("attic", "emby", "http://emby.local", "k", true)
            .unwrap();

        db.insert_session(&test_session(server.id, "a", at(0))).unwrap();
        let mut done = test_session(server.id, "b", at(10));
        done.active = false;
        db.insert_session(&done).unwrap();

        let activity = db.server_activity().unwrap();
        assert_eq!(activity.len(), 2);
        let den = activity.iter().find(|a| a.server_id == server.id).unwrap();
        assert_eq!(den.active_sessions, 1);
        assert_eq!(den.total_sessions, 2);
        let attic = activity.iter().find(|a| a.server_id == quiet.id).unwrap();
        assert_eq!(attic.total_sessions, 0);
        assert!(attic.last_activity.is_none());
    }
}
