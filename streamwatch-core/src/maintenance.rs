//! Maintenance: retention cleanup, stale-session reaping, startup recovery
//!
//! Runs independently of the collectors: a periodic loop handles retention
//! and the stale sweep, and a one-shot recovery pass runs at process boot
//! before the orchestrator starts. Recovery revalidates every session left
//! `active` in the store against the owning server's live now-playing list;
//! when the server is unreachable a conservative `updated_at` cutoff is
//! used instead of assuming liveness.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clients::{create_client, MediaClient};
use crate::config::MonitoringConfig;
use crate::db::Database;
use crate::error::Result;
use crate::ingest::ensure_object;
use crate::registry::ServerRegistry;
use crate::types::ActivitySession;

/// Outcome of a startup recovery pass.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Servers that had active sessions to revalidate
    pub servers_checked: usize,
    /// Servers where the live oracle was unavailable (cutoff fallback used)
    pub fallback_servers: usize,
    pub sessions_kept: usize,
    pub sessions_ended: usize,
}

pub struct MaintenanceService {
    db: Arc<Database>,
    monitoring: MonitoringConfig,
}

impl MaintenanceService {
    pub fn new(db: Arc<Database>, monitoring: MonitoringConfig) -> Self {
        Self { db, monitoring }
    }

    /// Delete sessions older than the retention horizon. Snapshots cascade.
    pub fn cleanup_retention(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(self.monitoring.retention_days);
        let removed = self.db.delete_sessions_before(&cutoff)?;
        if removed > 0 {
            tracing::info!(removed, retention_days = self.monitoring.retention_days, "retention cleanup");
        }
        Ok(removed)
    }

    /// End active sessions whose `updated_at` is older than the stale
    /// timeout. Best-effort final metadata; never fails the sweep for one
    /// bad row.
    pub fn sweep_stale(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.monitoring.stale_session_hours);
        let stale = self.db.stale_active_sessions(&cutoff)?;
        let mut ended = 0;
        for session in stale {
            let id = session.id;
            match self.end_session(session, "stale_timeout") {
                Ok(()) => ended += 1,
                Err(e) => {
                    tracing::warn!(session = id, error = %e, "failed to end stale session");
                }
            }
        }
        if ended > 0 {
            tracing::info!(ended, "stale session sweep");
        }
        Ok(ended)
    }

    /// Revalidate every `active` session against live server state.
    pub async fn startup_recovery(&self, registry: &dyn ServerRegistry) -> Result<RecoveryReport> {
        let active = self.db.list_active_sessions()?;
        if active.is_empty() {
            tracing::info!("startup recovery: no active sessions to validate");
            return Ok(RecoveryReport::default());
        }

        let server_ids: HashSet<i64> = active.iter().map(|s| s.server_id).collect();
        let mut report = RecoveryReport::default();

        for server_id in server_ids {
            report.servers_checked += 1;
            let live = self.live_session_ids(registry, server_id).await;
            if live.is_none() {
                report.fallback_servers += 1;
            }
            let (kept, ended) = self.recover_server_sessions(server_id, live.as_ref())?;
            report.sessions_kept += kept;
            report.sessions_ended += ended;
        }

        tracing::info!(
            servers = report.servers_checked,
            kept = report.sessions_kept,
            ended = report.sessions_ended,
            fallbacks = report.fallback_servers,
            "startup recovery complete"
        );
        Ok(report)
    }

    /// Live external session ids for a server, or None when the server,
    /// its client, or the poll is unavailable.
    async fn live_session_ids(
        &self,
        registry: &dyn ServerRegistry,
        server_id: i64,
    ) -> Option<HashSet<String>> {
        let server = match registry.get(server_id) {
            Ok(Some(server)) => server,
            Ok(None) => {
                tracing::warn!(server_id, "active sessions reference an unregistered server");
                return None;
            }
            Err(e) => {
                tracing::warn!(server_id, error = %e, "registry lookup failed");
                return None;
            }
        };
        let client = match create_client(
            &server,
            Duration::from_secs(self.monitoring.http_timeout_secs),
        ) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(server = %server.name, error = %e, "failed to construct client for recovery");
                return None;
            }
        };
        Self::poll_live_ids(client).await
    }

    async fn poll_live_ids(client: Arc<dyn MediaClient>) -> Option<HashSet<String>> {
        match client.now_playing().await {
            Ok(rows) => Some(rows.into_iter().map(|r| r.session_id).collect()),
            Err(e) => {
                tracing::warn!(
                    server = %client.server().name,
                    error = %e,
                    "recovery poll failed, using updated_at cutoff"
                );
                None
            }
        }
    }

    /// Apply recovery to one server's active sessions.
    ///
    /// With a live oracle, sessions present in it are kept and the rest are
    /// ended. Without one, sessions updated within the recovery cutoff are
    /// kept (conservative: a recently-touched session may still be live).
    pub fn recover_server_sessions(
        &self,
        server_id: i64,
        live: Option<&HashSet<String>>,
    ) -> Result<(usize, usize)> {
        let sessions = self.db.active_sessions_for_server(server_id)?;
        let cutoff = Utc::now() - chrono::Duration::seconds(self.monitoring.recovery_cutoff_secs);
        let mut kept = 0;
        let mut ended = 0;
        for session in sessions {
            let keep = match live {
                Some(ids) => ids.contains(&session.session_id),
                None => session.updated_at >= cutoff,
            };
            if keep {
                kept += 1;
            } else {
                self.end_session(session, "startup_recovery")?;
                ended += 1;
            }
        }
        Ok((kept, ended))
    }

    /// Periodic loop running retention and the stale sweep.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = Duration::from_secs(self.monitoring.maintenance_interval_secs);
            tracing::info!(interval_secs = interval.as_secs(), "maintenance service started");
            loop {
                if let Err(e) = self.cleanup_retention() {
                    tracing::warn!(error = %e, "retention cleanup failed");
                }
                if let Err(e) = self.sweep_stale() {
                    tracing::warn!(error = %e, "stale sweep failed");
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("maintenance service stopped");
        })
    }

    fn end_session(&self, mut session: ActivitySession, reason: &str) -> Result<()> {
        let now = Utc::now();
        session.active = false;
        session.ended_at = Some(now);
        session.updated_at = now;
        let metadata = ensure_object(&mut session.metadata);
        metadata.insert("status".to_string(), "stopped".into());
        metadata.insert("end_reason".to_string(), reason.into());
        if session.duration_ms.is_none() {
            session.duration_ms = metadata
                .get("total_duration_seconds")
                .and_then(|v| v.as_i64())
                .map(|secs| secs * 1000);
        }
        self.db.update_session(&session)
    }
}
