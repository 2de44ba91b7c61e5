//! Websocket transport for change notifications.

use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, Interval};

use super::BridgeError;
use crate::watcher::{ChangeWatcher, WatcherState};

/// Text frame sent for every change event.
pub const CHANGE_MESSAGE: &str = "changed";

#[derive(Clone)]
struct WsState {
    watcher: ChangeWatcher,
    ping_interval: Option<Duration>,
}

pub fn routes(watcher: ChangeWatcher, ping_interval: Option<Duration>) -> Router {
    Router::new().route("/ws", get(subscribe)).with_state(WsState {
        watcher,
        ping_interval,
    })
}

async fn subscribe(
    State(state): State<WsState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, BridgeError> {
    if state.watcher.state() == WatcherState::Terminated {
        return Err(BridgeError::WatcherUnavailable);
    }
    let upgrade = upgrade.map_err(|rejection| BridgeError::Upgrade(rejection.body_text()))?;

    Ok(upgrade
        .on_failed_upgrade(|err| tracing::warn!("[ws] upgrade failed: {err}"))
        .on_upgrade(move |socket| serve_subscriber(socket, state)))
}

/// Forward change events to one browser until either side goes away.
///
/// With a ping interval set, the server pings periodically and drops a
/// connection that has sent nothing (pongs included) for two intervals.
async fn serve_subscriber(socket: WebSocket, state: WsState) {
    let mut subscription = match state.watcher.subscribe() {
        Ok(subscription) => subscription,
        Err(err) => {
            crate::debug_event!("ws", "rejected", "{err}");
            return;
        }
    };
    let id = subscription.id();
    crate::log_event!("ws", "connected", "subscriber {id}");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = state
        .ping_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(_) => {
                    if sink.send(Message::Text(CHANGE_MESSAGE.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Pruned by a broadcast or the watcher shut down.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(err)) => {
                    crate::debug_event!("ws", "read error", "subscriber {id}: {err}");
                    break;
                }
            },
            _ = tick(&mut heartbeat) => {
                if let Some(period) = state.ping_interval {
                    if last_seen.elapsed() > period * 2 {
                        crate::debug_event!("ws", "idle", "subscriber {id}");
                        break;
                    }
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(subscription);
    crate::log_event!("ws", "disconnected", "subscriber {id}");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
