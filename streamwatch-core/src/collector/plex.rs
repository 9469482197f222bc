//! Plex collector
//!
//! Primary channel is the persistent alert websocket; payloads feed the
//! [`SessionManager`] state machine. A backup poll of `/status/sessions`
//! runs while the stream is live to (a) resolve sessions that failed their
//! initial enrichment and (b) force-stop tracked sessions the server has
//! gone quiet about. Subscription failures are retried with capped backoff;
//! once the retry budget is exhausted the collector permanently falls back
//! to diff-polling for the remainder of its life.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::poll::{run_poll_loop, SessionDiffer};
use super::session_manager::SessionManager;
use super::CollectorContext;
use crate::clients::PlexClient;
use crate::error::{Error, Result};

pub async fn run(ctx: CollectorContext) {
    let plex = match PlexClient::new(
        ctx.server.clone(),
        Duration::from_secs(ctx.monitoring.http_timeout_secs),
    ) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(server = %ctx.server.name, error = %e, "failed to construct plex client");
            return;
        }
    };
    let manager = SessionManager::new(ctx.clone());
    let mut attempts: u32 = 0;

    loop {
        if ctx.is_shutdown() {
            break;
        }
        match subscribe_alerts(&ctx, &plex, &manager, &mut attempts).await {
            Ok(()) => break,
            Err(e) => {
                ctx.status.set_connected(false);
                ctx.status.record_error();
                attempts += 1;
                tracing::warn!(
                    server = %ctx.server.name,
                    attempt = attempts,
                    error = %e,
                    "plex alert subscription failed"
                );
                if attempts >= ctx.monitoring.transport_retry_attempts {
                    tracing::warn!(
                        server = %ctx.server.name,
                        "alert stream unavailable, permanently falling back to polling"
                    );
                    let mut differ = SessionDiffer::new();
                    run_poll_loop(
                        &ctx,
                        Duration::from_secs(ctx.monitoring.fallback_poll_secs),
                        &mut differ,
                    )
                    .await;
                    break;
                }
                let delay = ctx.monitoring.transport_backoff(attempts);
                let mut shutdown = ctx.shutdown.clone();
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    manager.shutdown();
    ctx.status.set_connected(false);
    tracing::info!(server = %ctx.server.name, "collector stopped");
}

/// Blocking read loop over the alert stream. Returns Ok on shutdown and Err
/// on any transport failure; the caller decides whether to retry.
async fn subscribe_alerts(
    ctx: &CollectorContext,
    plex: &PlexClient,
    manager: &Arc<SessionManager>,
    attempts: &mut u32,
) -> Result<()> {
    let url = plex.alert_url()?;
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::Transport(format!("alert connect failed: {}", e)))?;

    // Connected: the retry budget only counts consecutive failures
    *attempts = 0;
    ctx.status.set_connected(true);
    tracing::info!(server = %ctx.server.name, "subscribed to plex alert stream");

    let mut shutdown = ctx.shutdown.clone();
    let mut backup = tokio::time::interval(Duration::from_secs(ctx.monitoring.plex_backup_poll_secs));
    backup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick so the backup runs on cadence
    backup.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => {
                            // Plex wraps alerts in a NotificationContainer
                            let container = value.get("NotificationContainer").unwrap_or(&value);
                            manager.handle_alert(container).await;
                        }
                        Err(e) => {
                            ctx.status.record_error();
                            tracing::debug!(server = %ctx.server.name, error = %e, "malformed alert payload");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| Error::Transport(format!("pong failed: {}", e)))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::Transport("alert stream closed".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(Error::Transport(format!("alert read failed: {}", e)));
                }
            },
            _ = backup.tick() => {
                backup_poll(ctx, manager).await;
            }
        }
    }
}

/// Backup poll: refresh enrichment and sweep orphaned sessions. A failed
/// poll is logged and skipped; the alert stream stays primary.
async fn backup_poll(ctx: &CollectorContext, manager: &Arc<SessionManager>) {
    match ctx.client.now_playing().await {
        Ok(rows) => manager.refresh_from_poll(&rows).await,
        Err(e) => {
            tracing::debug!(server = %ctx.server.name, error = %e, "plex backup poll failed");
        }
    }
}
