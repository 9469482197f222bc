//! Collectors: per-server workers that turn a media server's native
//! event/polling API into [`ActivityEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   spawn/retire   ┌──────────────────────────┐
//! │ Orchestrator │ ───────────────► │ Collector (1 per server) │
//! └──────────────┘                  │  plex: alerts + backup   │
//!                                   │  emby: websocket         │
//!                                   │  others: diff polling    │
//!                                   └───────────┬──────────────┘
//!                                               │ bounded mpsc
//!                                               ▼
//!                                   ┌──────────────────────────┐
//!                                   │   Ingestion service      │
//!                                   └──────────────────────────┘
//! ```
//!
//! Every collector gets an explicit [`CollectorContext`] — there is no
//! process-wide singleton for background tasks to reach into. A collector
//! never terminates on a single bad cycle: per-iteration errors are caught,
//! counted, and backed off.

pub mod emby;
pub mod plex;
pub mod poll;
pub mod session_manager;

pub use poll::SessionDiffer;
pub use session_manager::{SessionManager, SessionTransition};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clients::MediaClient;
use crate::config::MonitoringConfig;
use crate::types::{ActivityEvent, ConnectionStatus, MediaServer, ServerKind};

/// Shared counters for one collector, read by the orchestrator's status API.
#[derive(Debug, Default)]
pub struct CollectorStatus {
    connected: AtomicBool,
    event_count: AtomicU64,
    error_count: AtomicU64,
    last_event: Mutex<Option<DateTime<Utc>>>,
}

impl CollectorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_event(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        *self.last_event.lock().unwrap() = Some(Utc::now());
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.connected.load(Ordering::Relaxed),
            last_event: *self.last_event.lock().unwrap(),
            event_count: self.event_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Everything a collector task needs, passed in explicitly at spawn time.
#[derive(Clone)]
pub struct CollectorContext {
    pub server: MediaServer,
    pub client: Arc<dyn MediaClient>,
    pub events: mpsc::Sender<ActivityEvent>,
    pub status: Arc<CollectorStatus>,
    pub shutdown: watch::Receiver<bool>,
    pub monitoring: MonitoringConfig,
}

impl CollectorContext {
    /// Send an event to the ingestion service and bump counters.
    ///
    /// Returns false once the channel is closed (ingestion gone); callers
    /// should wind down.
    pub async fn emit(&self, event: ActivityEvent) -> bool {
        match self.events.send(event).await {
            Ok(()) => {
                self.status.record_event();
                true
            }
            Err(_) => {
                tracing::debug!(server = %self.server.name, "event channel closed");
                false
            }
        }
    }

    /// Non-blocking shutdown check for iteration boundaries.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Run the protocol-specific collector for the context's server.
///
/// Dispatch is keyed on [`ServerKind`]; unrecognized server types fall back
/// to the generic polling collector.
pub async fn run(ctx: CollectorContext) {
    let kind = ctx.server.kind();
    tracing::info!(server = %ctx.server.name, kind = %kind, "collector starting");
    match kind {
        ServerKind::Plex => plex::run(ctx).await,
        ServerKind::Emby => emby::run(ctx).await,
        ServerKind::Jellyfin => poll::run_jellyfin(ctx).await,
        ServerKind::Audiobookshelf => poll::run_audiobookshelf(ctx).await,
        ServerKind::Generic => poll::run_generic(ctx).await,
    }
}

/// Spawn [`run`] as its own task.
pub fn spawn(ctx: CollectorContext) -> JoinHandle<()> {
    tokio::spawn(run(ctx))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_snapshot() {
        let status = CollectorStatus::new();
        let snap = status.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.event_count, 0);
        assert!(snap.last_event.is_none());

        status.set_connected(true);
        status.record_event();
        status.record_event();
        status.record_error();

        let snap = status.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.event_count, 2);
        assert_eq!(snap.error_count, 1);
        assert!(snap.last_event.is_some());
    }
}
