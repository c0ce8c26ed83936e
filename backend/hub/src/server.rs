//! Plugin bus listener.
//!
//! Upgrades plugin HTTP connections to WebSockets, enforces the registration
//! handshake and pumps frames between the socket and the hub.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{Outbound, PluginConnection};
use crate::hub::Hub;

impl Hub {
    /// Bind the bus listener (port `0` picks a free port) and serve it in
    /// the background until `shutdown` is called.
    pub async fn listen(&self, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind plugin bus on {addr}"))?;
        let local = listener.local_addr()?;
        self.set_port(local.port());
        info!(port = local.port(), "Plugin bus listening");

        let mut shutdown = self.shutdown_signal();
        let app = router(self.clone());
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                loop {
                    if *shutdown.borrow_and_update() {
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Plugin bus listener failed");
            }
            debug!("Plugin bus listener released");
        });
        Ok((local, handle))
    }
}

/// Router accepting plugin connections on `/`.
pub fn router(hub: Hub) -> Router {
    Router::new().route("/", get(plugin_ws)).with_state(hub)
}

async fn plugin_ws(ws: WebSocketUpgrade, State(hub): State<Hub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_plugin_socket(socket, hub))
}

fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        _ => None,
    }
}

async fn handle_plugin_socket(socket: WebSocket, hub: Hub) {
    let (mut sink, mut stream) = socket.split();
    let (connection, mut outbound) = PluginConnection::new();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Handshake: the first data frame decides the connection's fate.
    let plugin = loop {
        match stream.next().await {
            Some(Ok(Message::Close(_))) | None => {
                connection.close();
                let _ = send_task.await;
                return;
            }
            Some(Ok(message)) => {
                let Some(text) = frame_text(message) else {
                    continue;
                };
                match hub.accept(&connection, &text).await {
                    Ok(state) => break state.name,
                    Err(e) => {
                        error!(error = %e, "Failed to process plugin registration");
                        let _ = send_task.await;
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Plugin socket failed before registering");
                connection.close();
                let _ = send_task.await;
                return;
            }
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(message) => {
                if let Some(text) = frame_text(message) {
                    hub.handle_frame(&plugin, &text).await;
                }
            }
            Err(e) => {
                error!(plugin = %plugin, error = %e, "Plugin connection error");
                break;
            }
        }
    }

    hub.disconnect(&plugin, connection.id()).await;
    connection.close();
    let _ = send_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::hub::HubConfig;
    use plugbus_core::{BusMessage, HubEvent, PluginStatus, ResponseMessage};
    use serde_json::json;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    async fn bus() -> (Hub, String) {
        let hub = Hub::new(HubConfig::default());
        let (addr, _handle) = hub.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (hub, format!("ws://{addr}/"))
    }

    fn register_frame(name: &str) -> String {
        json!({
            "type": "register",
            "plugin": name,
            "port": 5300,
            "capabilities": ["llm.chat"],
        })
        .to_string()
    }

    async fn next_event(events: &mut tokio::sync::broadcast::Receiver<HubEvent>) -> HubEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_non_register_first_frame_closes_socket() {
        let (hub, url) = bus().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let log = json!({ "type": "log", "plugin": "rogue", "level": "info", "message": "hi" });
        ws.send(WsMessage::Text(log.to_string())).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(hub.plugins().await.is_empty());
        assert!(hub.logs("rogue", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_register_then_close_unregisters() {
        let (hub, url) = bus().await;
        let mut events = hub.subscribe();
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(WsMessage::Text(register_frame("llmserver"))).await.unwrap();

        match next_event(&mut events).await {
            HubEvent::Registered(state) => {
                assert_eq!(state.name, "llmserver");
                assert_eq!(state.status, PluginStatus::Running);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(hub.is_connected("llmserver").await);

        ws.close(None).await.unwrap();
        loop {
            if let HubEvent::Unregistered(name) = next_event(&mut events).await {
                assert_eq!(name, "llmserver");
                break;
            }
        }
        assert!(!hub.is_connected("llmserver").await);
        assert_eq!(hub.plugin("llmserver").await.unwrap().status, PluginStatus::Stopped);
    }

    #[tokio::test]
    async fn test_binary_frames_and_request_over_socket() {
        let (hub, url) = bus().await;
        let mut events = hub.subscribe();
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(WsMessage::Binary(register_frame("candle").into_bytes()))
            .await
            .unwrap();
        assert!(matches!(next_event(&mut events).await, HubEvent::Registered(_)));

        let caller = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.request("candle", "llm.chat", json!({ "prompt": "hi" }), None)
                    .await
            })
        };

        let request = loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => match serde_json::from_str(&text).unwrap() {
                    BusMessage::Request(request) => break request,
                    other => panic!("unexpected {other:?}"),
                },
                _ => continue,
            }
        };
        assert_eq!(request.capability, "llm.chat");
        let response = BusMessage::Response(ResponseMessage {
            request_id: request.request_id,
            success: true,
            data: Some(json!({ "reply": "hello" })),
            error: None,
        });
        ws.send(WsMessage::Binary(serde_json::to_vec(&response).unwrap()))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, json!({ "reply": "hello" }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_plugin_sockets() {
        let (hub, url) = bus().await;
        let mut events = hub.subscribe();
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(WsMessage::Text(register_frame("goose"))).await.unwrap();
        assert!(matches!(next_event(&mut events).await, HubEvent::Registered(_)));

        hub.shutdown().await;
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
