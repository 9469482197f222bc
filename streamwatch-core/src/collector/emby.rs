//! Emby collector
//!
//! Primary channel is the `/embywebsocket` push socket: after a
//! `SessionsStart` subscription the server pushes full session lists, which
//! go through the shared [`SessionDiffer`] exactly like a poll result. The
//! socket is kept alive with periodic `KeepAlive` messages. Connect/auth/
//! send failures follow the same capped-backoff-then-permanent-polling
//! policy as the Plex collector (fallback interval 30s).

use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::poll::{run_poll_loop, SessionDiffer};
use super::CollectorContext;
use crate::clients::EmbyClient;
use crate::error::{Error, Result};

pub async fn run(ctx: CollectorContext) {
    let emby = match EmbyClient::new(
        ctx.server.clone(),
        Duration::from_secs(ctx.monitoring.http_timeout_secs),
    ) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(server = %ctx.server.name, error = %e, "failed to construct emby client");
            return;
        }
    };
    // One differ across push and fallback so sessions survive the demotion
    let mut differ = SessionDiffer::new();
    let mut attempts: u32 = 0;

    loop {
        if ctx.is_shutdown() {
            break;
        }
        match subscribe_socket(&ctx, &emby, &mut differ, &mut attempts).await {
            Ok(()) => break,
            Err(e) => {
                ctx.status.set_connected(false);
                ctx.status.record_error();
                attempts += 1;
                tracing::warn!(
                    server = %ctx.server.name,
                    attempt = attempts,
                    error = %e,
                    "emby websocket failed"
                );
                if attempts >= ctx.monitoring.transport_retry_attempts {
                    tracing::warn!(
                        server = %ctx.server.name,
                        "websocket unavailable, permanently falling back to polling"
                    );
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

    ctx.status.set_connected(false);
    tracing::info!(server = %ctx.server.name, "collector stopped");
}

/// Read loop over the session push socket. Returns Ok on shutdown and Err
/// on any transport failure.
async fn subscribe_socket(
    ctx: &CollectorContext,
    emby: &EmbyClient,
    differ: &mut SessionDiffer,
    attempts: &mut u32,
) -> Result<()> {
    let url = emby.socket_url()?;
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::Transport(format!("websocket connect failed: {}", e)))?;

    socket
        .send(Message::Text(EmbyClient::sessions_start_message()))
        .await
        .map_err(|e| Error::Transport(format!("session subscription failed: {}", e)))?;

    *attempts = 0;
    ctx.status.set_connected(true);
    tracing::info!(server = %ctx.server.name, "subscribed to emby session socket");

    let mut shutdown = ctx.shutdown.clone();
    let mut keepalive = tokio::time::interval(Duration::from_secs(ctx.monitoring.keepalive_secs));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = keepalive.tick() => {
                socket
                    .send(Message::Text(EmbyClient::keepalive_message()))
                    .await
                    .map_err(|e| Error::Transport(format!("keep-alive failed: {}", e)))?;
            }
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(rows) =
                        EmbyClient::parse_socket_message(ctx.server.base_url(), &text)
                    {
                        let events = differ.diff(ctx.server.id, &rows, Utc::now());
                        for event in events {
                            if !ctx.emit(event).await {
                                // Ingestion gone; wind down cleanly
                                return Ok(());
                            }
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
                    return Err(Error::Transport("websocket closed".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(Error::Transport(format!("websocket read failed: {}", e)));
                }
            },
        }
    }
}
