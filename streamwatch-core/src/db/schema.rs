//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Media server registry (read-only input to the engine)
    -- ============================================

    CREATE TABLE IF NOT EXISTS media_servers (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        name         TEXT NOT NULL,
        server_type  TEXT NOT NULL,       -- 'plex', 'jellyfin', 'emby', 'audiobookshelf', ...
        url          TEXT NOT NULL,
        api_key      TEXT NOT NULL,
        verified     INTEGER NOT NULL DEFAULT 0,
        created_at   DATETIME NOT NULL
    );

    -- ============================================
    -- Activity history
    -- ============================================

    CREATE TABLE IF NOT EXISTS activity_sessions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id        INTEGER NOT NULL REFERENCES media_servers(id),
        session_id       TEXT NOT NULL,    -- external, protocol-scoped
        reference_id     INTEGER REFERENCES activity_sessions(id),
        active           INTEGER NOT NULL DEFAULT 1,

        -- Identity
        user_name        TEXT,
        user_id          TEXT,

        -- Media
        media_title      TEXT,
        media_type       TEXT,
        media_id         TEXT,
        series_name      TEXT,
        season_number    INTEGER,
        episode_number   INTEGER,

        -- Device / client
        device_name      TEXT,
        client_name      TEXT,
        platform         TEXT,
        ip_address       TEXT,
        player_version   TEXT,
        artwork_url      TEXT,

        started_at       DATETIME NOT NULL,
        ended_at         DATETIME,
        updated_at       DATETIME NOT NULL,
        duration_ms      INTEGER,          -- final, once known

        transcoding_info JSON,
        metadata         JSON
    );

    CREATE INDEX IF NOT EXISTS idx_activity_sessions_server ON activity_sessions(server_id);
    CREATE INDEX IF NOT EXISTS idx_activity_sessions_external ON activity_sessions(server_id, session_id);
    CREATE INDEX IF NOT EXISTS idx_activity_sessions_reference ON activity_sessions(reference_id);
    CREATE INDEX IF NOT EXISTS idx_activity_sessions_updated ON activity_sessions(updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_activity_sessions_started ON activity_sessions(started_at DESC);

    -- At most one active row per external session
    CREATE UNIQUE INDEX IF NOT EXISTS idx_activity_sessions_active_external
        ON activity_sessions(server_id, session_id) WHERE active = 1;

    CREATE TABLE IF NOT EXISTS activity_snapshots (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id     INTEGER NOT NULL REFERENCES activity_sessions(id) ON DELETE CASCADE,
        timestamp      DATETIME NOT NULL,
        position_ms    INTEGER NOT NULL,
        state          TEXT NOT NULL,
        transcoding    INTEGER NOT NULL DEFAULT 0,
        quality        TEXT,
        subtitle_track TEXT,
        audio_track    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_activity_snapshots_session ON activity_snapshots(session_id);
    CREATE INDEX IF NOT EXISTS idx_activity_snapshots_ts ON activity_snapshots(timestamp);
    "#,
    // Version 2: Covering index for the session grouping lookup
    r#"
    CREATE INDEX IF NOT EXISTS idx_activity_sessions_grouping
        ON activity_sessions(server_id, user_name, media_id, id DESC);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        // Check version
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = ["media_servers", "activity_sessions", "activity_snapshots"];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_active_uniqueness_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO media_servers (name, server_type, url, api_key, verified, created_at)
             VALUES ('test', 'plex', 'http://localhost', 'k', 1, '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO activity_sessions
             (server_id, session_id, active, started_at, updated_at, metadata)
             VALUES (1, 'abc', 1, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', '{}')";
        conn.execute(insert, []).unwrap();

        // A second active row for the same external session violates the
        // partial unique index
        assert!(conn.execute(insert, []).is_err());

        // But an inactive duplicate is fine
        conn.execute(
            "INSERT INTO activity_sessions
             (server_id, session_id, active, started_at, updated_at, metadata)
             VALUES (1, 'abc', 0, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', '{}')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_snapshot_cascade_delete() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO media_servers (name, server_type, url, api_key, verified, created_at)
             VALUES ('test', 'plex', 'http://localhost', 'k', 1, '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO activity_sessions
             (server_id, session_id, active, started_at, updated_at, metadata)
             VALUES (1, 'abc', 1, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', '{}')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO activity_snapshots (session_id, timestamp, position_ms, state)
             VALUES (1, '2024-01-01T00:00:10Z', 10000, 'playing')",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM activity_sessions WHERE id = 1", [])
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM activity_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "snapshots should cascade-delete with sessions");
    }
}
