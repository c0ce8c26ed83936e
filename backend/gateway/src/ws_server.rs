//! WebSocket entrypoint for observers (`/ws/plugins`).
//!
//! Upgrades HTTP to WS and bridges the socket to a [`FanoutGateway`] session.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::server::GatewayState;
use crate::ws_protocol::OutboundEvent;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: GatewayState) {
    info!("Observer connected to /ws/plugins");
    let (mut sender, mut receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundEvent>();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode observer payload");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Observer socket error");
                    break;
                }
            }
        }
    });

    let gateway = state.gateway.clone();
    let mut session = tokio::spawn(async move {
        gateway.run_session(inbound_rx, outbound_tx).await;
    });

    // Whichever side finishes first tears the others down.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            session.abort();
        }
        _ = &mut recv_task => {
            session.abort();
            send_task.abort();
        }
        _ = &mut session => {
            recv_task.abort();
            let _ = (&mut send_task).await;
        }
    }

    info!("Observer disconnected from /ws/plugins");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use plugbus_core::{PluginConfig, PluginPort, Registration};
    use plugbus_hub::{Hub, HubConfig, PluginConnection};
    use plugbus_supervisor::{ManagerOptions, NativeLauncher, PluginManager, SqliteConfigStore};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
    };

    use crate::server::build_router;

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve() -> (TempDir, GatewayState, String) {
        let dir = tempfile::tempdir().unwrap();
        let manager = PluginManager::new(
            Hub::new(HubConfig::default()),
            Arc::new(NativeLauncher),
            Arc::new(SqliteConfigStore::in_memory().unwrap()),
            ManagerOptions::new(dir.path().join("plugins"), dir.path().join("bus.db")),
        );
        let state = GatewayState::new(manager);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (dir, state, format!("ws://{addr}/ws/plugins"))
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_observer_socket_streams_status() {
        let (_dir, state, url) = serve().await;
        state
            .manager
            .save_config(PluginConfig::new("llmserver", "run.sh"))
            .await
            .unwrap();

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let bootstrap = next_json(&mut ws).await;
        assert_eq!(bootstrap["type"], "bootstrap");
        assert_eq!(bootstrap["payload"]["plugins"][0]["name"], "llmserver");

        let sub = json!({ "action": "SUB", "topic": "status", "pluginId": "llmserver" });
        ws.send(WsMessage::Text(sub.to_string())).await.unwrap();
        let initial = next_json(&mut ws).await;
        assert_eq!(initial["type"], "status");
        assert_eq!(initial["payload"]["status"], "stopped");

        let (connection, rx) = PluginConnection::new();
        std::mem::forget(rx);
        state
            .manager
            .hub()
            .register(
                connection,
                Registration {
                    plugin: "llmserver".into(),
                    port: PluginPort::Tcp(5100),
                    capabilities: Vec::new(),
                    config_schema: None,
                    meta: None,
                },
            )
            .await;
        let running = next_json(&mut ws).await;
        assert_eq!(running["type"], "status");
        assert_eq!(running["payload"]["name"], "llmserver");
        assert_eq!(running["payload"]["status"], "running");
    }

    #[tokio::test]
    async fn test_observer_close_tears_down_session() {
        let (_dir, state, url) = serve().await;
        let hub = state.manager.hub().clone();

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "bootstrap");
        assert_eq!(hub.subscriber_count(), 1);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The server keeps accepting observers afterwards.
        let (mut again, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_json(&mut again).await["type"], "bootstrap");
    }
}
