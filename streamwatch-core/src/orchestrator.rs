//! Collector orchestration
//!
//! The orchestrator owns the set of running collectors and reconciles it
//! against the media server registry on a fixed cadence: verified servers
//! gain a collector, vanished servers lose theirs, and collectors that died
//! (error or panic) are reaped so the next pass recreates them. The
//! supervisor itself never dies with a collector.
//!
//! Collectors run one task each on a semaphore-bounded pool and observe a
//! per-collector stop signal; `stop()` signals everything and waits a
//! bounded time before aborting stragglers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::clients::create_client;
use crate::collector::{self, CollectorContext, CollectorStatus};
use crate::config::MonitoringConfig;
use crate::registry::ServerRegistry;
use crate::types::{ActivityEvent, ConnectionStatus, MediaServer, ServerKind};

/// Bounded wait for a collector to drain before it is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningCollector {
    server_name: String,
    kind: ServerKind,
    status: Arc<CollectorStatus>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Supervisor for the per-server collector fleet.
pub struct Orchestrator {
    registry: Arc<dyn ServerRegistry>,
    events: mpsc::Sender<ActivityEvent>,
    monitoring: MonitoringConfig,
    collectors: Mutex<HashMap<i64, RunningCollector>>,
    limiter: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        events: mpsc::Sender<ActivityEvent>,
        monitoring: MonitoringConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let limiter = Arc::new(Semaphore::new(monitoring.max_collectors));
        Arc::new(Self {
            registry,
            events,
            monitoring,
            collectors: Mutex::new(HashMap::new()),
            limiter,
            shutdown_tx,
        })
    }

    /// Start the supervisor loop. Reconciles immediately, then on the
    /// configured cadence until `stop()`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = this.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let interval = Duration::from_secs(this.monitoring.reconcile_interval_secs);
            tracing::info!(interval_secs = interval.as_secs(), "orchestrator started");
            loop {
                this.reconcile().await;
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("orchestrator supervisor stopped");
        })
    }

    /// One reconciliation pass: reap dead collectors, retire collectors for
    /// vanished servers, spawn collectors for new ones.
    pub async fn reconcile(&self) {
        self.reap_finished().await;

        let servers = match self.registry.list_verified() {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list media servers, keeping current collectors");
                return;
            }
        };
        let desired: HashMap<i64, MediaServer> =
            servers.into_iter().map(|s| (s.id, s)).collect();

        // Retire collectors whose server is gone or no longer verified
        let stale: Vec<RunningCollector> = {
            let mut collectors = self.collectors.lock().unwrap();
            let stale_ids: Vec<i64> = collectors
                .keys()
                .filter(|id| !desired.contains_key(id))
                .copied()
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| collectors.remove(&id))
                .collect()
        };
        for collector in stale {
            tracing::info!(server = %collector.server_name, "retiring collector");
            Self::stop_collector(collector).await;
        }

        // Spawn collectors for servers that lack one
        for (id, server) in desired {
            let missing = !self.collectors.lock().unwrap().contains_key(&id);
            if missing {
                self.spawn_collector(server);
            }
        }
    }

    /// Remove finished collector tasks so the next pass can recreate them.
    async fn reap_finished(&self) {
        let finished: Vec<RunningCollector> = {
            let mut collectors = self.collectors.lock().unwrap();
            let ids: Vec<i64> = collectors
                .iter()
                .filter(|(_, c)| c.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| collectors.remove(&id))
                .collect()
        };
        for collector in finished {
            match collector.handle.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(
                        server = %collector.server_name,
                        kind = %collector.kind,
                        "collector task panicked; server is unmonitored until the next pass"
                    );
                }
                _ => {
                    tracing::warn!(
                        server = %collector.server_name,
                        "collector exited; server is unmonitored until the next pass"
                    );
                }
            }
        }
    }

    fn spawn_collector(&self, server: MediaServer) {
        let permit = match Arc::clone(&self.limiter).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    server = %server.name,
                    cap = self.monitoring.max_collectors,
                    "collector pool exhausted, deferring to a later pass"
                );
                return;
            }
        };

        let client = match create_client(
            &server,
            Duration::from_secs(self.monitoring.http_timeout_secs),
        ) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(server = %server.name, error = %e, "failed to construct media client");
                return;
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(CollectorStatus::new());
        let ctx = CollectorContext {
            server: server.clone(),
            client,
            events: self.events.clone(),
            status: Arc::clone(&status),
            shutdown: stop_rx,
            monitoring: self.monitoring.clone(),
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            collector::run(ctx).await;
        });

        self.collectors.lock().unwrap().insert(
            server.id,
            RunningCollector {
                kind: server.kind(),
                server_name: server.name,
                status,
                stop_tx,
                handle,
            },
        );
    }

    async fn stop_collector(collector: RunningCollector) {
        let _ = collector.stop_tx.send(true);
        let abort = collector.handle.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, collector.handle)
            .await
            .is_err()
        {
            tracing::warn!(
                server = %collector.server_name,
                "collector did not stop within the drain window, aborting"
            );
            abort.abort();
        }
    }

    /// Per-server collector health.
    pub fn connection_status(&self) -> HashMap<i64, ConnectionStatus> {
        self.collectors
            .lock()
            .unwrap()
            .iter()
            .map(|(id, c)| (*id, c.status.snapshot()))
            .collect()
    }

    /// Signal every collector and the supervisor loop, then wait (bounded)
    /// for the fleet to drain.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let entries: Vec<RunningCollector> = {
            let mut collectors = self.collectors.lock().unwrap();
            collectors.drain().map(|(_, c)| c).collect()
        };
        for collector in entries {
            Self::stop_collector(collector).await;
        }
        tracing::info!("all collectors stopped");
    }
}
