//! Observer sessions.
//!
//! Each connected observer gets its own hub subscription and a list of
//! (topic, plugin) filters. Nothing is relayed until the observer subscribes.

use std::sync::Arc;

use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, warn};

use plugbus_core::HubEvent;
use plugbus_supervisor::PluginManager;

use crate::ws_protocol::{Action, BootstrapPayload, ClientMessage, OutboundEvent, Topic};

/// Log entries pushed when an observer subscribes to a plugin's logs.
pub const LOG_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: Topic,
    /// `None` matches every plugin.
    pub plugin: Option<String>,
}

impl From<&ClientMessage> for Subscription {
    fn from(message: &ClientMessage) -> Self {
        Self {
            topic: message.topic,
            plugin: message.plugin_id.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    entries: Vec<Subscription>,
}

impl Subscriptions {
    /// Returns `false` if the exact subscription already exists.
    pub fn add(&mut self, subscription: Subscription) -> bool {
        if self.entries.contains(&subscription) {
            return false;
        }
        self.entries.push(subscription);
        true
    }

    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s != subscription);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn wants(&self, event: &OutboundEvent) -> bool {
        let Some(topic) = event.topic() else {
            return false;
        };
        self.entries.iter().any(|s| {
            s.topic == topic
                && match &s.plugin {
                    None => true,
                    Some(plugin) => event.plugin() == Some(plugin.as_str()),
                }
        })
    }
}

/// Relays hub events to observers.
#[derive(Clone)]
pub struct FanoutGateway {
    manager: Arc<PluginManager>,
}

impl FanoutGateway {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    pub async fn bootstrap(&self) -> OutboundEvent {
        OutboundEvent::Bootstrap(BootstrapPayload {
            plugins: self.manager.list_plugins().await,
            telemetry: self.manager.telemetry_summary().await,
        })
    }

    /// Current data sent right after a new subscription.
    pub async fn initial_push(&self, subscription: &Subscription) -> Vec<OutboundEvent> {
        match (subscription.topic, subscription.plugin.as_deref()) {
            (Topic::Status, Some(plugin)) => self
                .manager
                .get_plugin(plugin)
                .await
                .map(OutboundEvent::Status)
                .into_iter()
                .collect(),
            (Topic::Status, None) => self
                .manager
                .list_plugins()
                .await
                .into_iter()
                .map(OutboundEvent::Status)
                .collect(),
            (Topic::Telemetry, Some(plugin)) => self
                .manager
                .get_telemetry(plugin)
                .await
                .map(OutboundEvent::Telemetry)
                .into_iter()
                .collect(),
            (Topic::Telemetry, None) => self
                .manager
                .telemetry_summary()
                .await
                .into_iter()
                .map(OutboundEvent::Telemetry)
                .collect(),
            (Topic::Logs, Some(plugin)) => self
                .manager
                .get_logs(plugin, LOG_HISTORY)
                .await
                .into_iter()
                .map(OutboundEvent::Logs)
                .collect(),
            (Topic::Logs, None) => Vec::new(),
        }
    }

    /// Map a hub event onto the observer protocol. Health reports are
    /// skipped; the `Updated` event published alongside carries them.
    pub async fn translate(&self, event: HubEvent) -> Option<OutboundEvent> {
        match event {
            HubEvent::Registered(state) | HubEvent::Updated(state) => {
                Some(OutboundEvent::Status(state))
            }
            HubEvent::Unregistered(name) => {
                self.manager.get_plugin(&name).await.map(OutboundEvent::Status)
            }
            HubEvent::Log(entry) => Some(OutboundEvent::Logs(entry)),
            HubEvent::Telemetry(snapshot) => Some(OutboundEvent::Telemetry(snapshot)),
            HubEvent::Health { .. } => None,
        }
    }

    /// Apply one client frame; returns the events to push back.
    pub async fn handle_client_frame(
        &self,
        subscriptions: &mut Subscriptions,
        raw: &str,
    ) -> Vec<OutboundEvent> {
        let message = match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Invalid WS payload");
                return Vec::new();
            }
        };
        let subscription = Subscription::from(&message);
        match message.action {
            Action::Sub => {
                if subscriptions.add(subscription.clone()) {
                    debug!(topic = ?subscription.topic, plugin = ?subscription.plugin, "Observer subscribed");
                    self.initial_push(&subscription).await
                } else {
                    Vec::new()
                }
            }
            Action::Unsub => {
                subscriptions.remove(&subscription);
                Vec::new()
            }
        }
    }

    /// Drive one observer until either side goes away.
    ///
    /// `inbound` carries raw client frames; `outbound` receives everything
    /// to send, starting with the bootstrap.
    pub async fn run_session(
        &self,
        mut inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<OutboundEvent>,
    ) {
        let mut events = self.manager.hub().subscribe();
        if outbound.send(self.bootstrap().await).is_err() {
            return;
        }

        let mut subscriptions = Subscriptions::default();
        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(raw) = frame else { break };
                    for event in self.handle_client_frame(&mut subscriptions, &raw).await {
                        if outbound.send(event).is_err() {
                            return;
                        }
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if subscriptions.is_empty() {
                            continue;
                        }
                        let Some(event) = self.translate(event).await else {
                            continue;
                        };
                        if subscriptions.wants(&event) && outbound.send(event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Observer fell behind; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Observer session ended");
    }
}
