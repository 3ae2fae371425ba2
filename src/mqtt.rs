use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const SENSOR_TOPIC: &str = "sensor-data";
const STATUS_TOPIC: &str = "status";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub type Callback = Arc<dyn Fn(&JsonValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
    pub keepalive: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            client_id: config.mqtt_client_id.clone(),
            topic_prefix: config.mqtt_topic_prefix.clone(),
            keepalive: config.mqtt_keepalive(),
        }
    }

    pub fn sensor_topic(&self) -> String {
        format!("{}/{SENSOR_TOPIC}", self.topic_prefix)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/{STATUS_TOPIC}", self.topic_prefix)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keepalive);
        if let (Some(username), Some(password)) =
            (self.username.as_deref(), self.password.as_deref())
        {
            options.set_credentials(username, password);
        }
        options
    }
}

/// Exact-topic callback table. Wildcard filters are not matched here.
#[derive(Default)]
pub struct TopicRegistry {
    next_id: u64,
    topics: HashMap<String, Vec<(SubscriptionId, Callback)>>,
}

impl TopicRegistry {
    pub fn insert(&mut self, topic: String, callback: Callback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.topics.entry(topic).or_default().push((id, callback));
        id
    }

    pub fn remove(&mut self, topic: &str, id: SubscriptionId) -> bool {
        let Some(entries) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    pub fn callbacks(&self, topic: &str) -> Vec<Callback> {
        self.topics
            .get(topic)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

struct Connection {
    client: AsyncClient,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Push channel for live readings. Owned by the application; nothing here is
/// global.
pub struct MqttBridge {
    settings: MqttSettings,
    registry: Arc<Mutex<TopicRegistry>>,
    connected: Arc<AtomicBool>,
    connection: Mutex<Option<Connection>>,
}

impl MqttBridge {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(Mutex::new(TopicRegistry::default())),
            connected: Arc::new(AtomicBool::new(false)),
            connection: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&JsonValue) + Send + Sync + 'static,
    {
        lock(&self.registry).insert(topic.into(), Arc::new(callback))
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        lock(&self.registry).remove(topic, id)
    }

    /// Spawns the event loop. Subscriptions to the sensor and status topics
    /// are (re)issued on every ConnAck. A second call while running is a no-op.
    pub fn connect(&self) {
        let mut connection = lock(&self.connection);
        if connection.is_some() {
            tracing::debug!("mqtt bridge already running");
            return;
        }

        let (client, mut eventloop) = AsyncClient::new(self.settings.options(), 10);
        let cancel = CancellationToken::new();
        let topics = [self.settings.sensor_topic(), self.settings.status_topic()];
        let registry = self.registry.clone();
        let connected = self.connected.clone();
        let loop_client = client.clone();
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            connected.store(true, Ordering::SeqCst);
                            for topic in &topics {
                                if let Err(err) = loop_client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                    tracing::warn!(topic = %topic, error = %err, "failed to subscribe to MQTT topic");
                                }
                            }
                            tracing::info!(topics = ?topics, "mqtt bridge connected");
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let delivered = dispatch(&registry, &publish.topic, &publish.payload);
                            tracing::trace!(topic = %publish.topic, delivered, "mqtt message");
                        }
                        Ok(Event::Incoming(Incoming::Disconnect)) => {
                            connected.store(false, Ordering::SeqCst);
                            tracing::warn!("mqtt broker closed the connection");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            connected.store(false, Ordering::SeqCst);
                            tracing::warn!(error = %err, "mqtt event loop error; retrying");
                            tokio::select! {
                                _ = loop_cancel.cancelled() => break,
                                _ = sleep(RECONNECT_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        *connection = Some(Connection {
            client,
            cancel,
            handle,
        });
        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            "mqtt bridge starting"
        );
    }

    /// Publishes `payload` as JSON. Returns `Ok(false)` without sending when
    /// the bridge is not connected.
    pub async fn publish(&self, topic: &str, payload: &JsonValue) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let Some(client) = lock(&self.connection).as_ref().map(|c| c.client.clone()) else {
            return Ok(false);
        };
        let bytes = serde_json::to_vec(payload)?;
        client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(true)
    }

    pub async fn disconnect(&self) {
        let Some(connection) = lock(&self.connection).take() else {
            return;
        };
        if let Err(err) = connection.client.try_disconnect() {
            tracing::debug!(error = %err, "mqtt disconnect request not queued");
        }
        connection.cancel.cancel();
        connection.handle.abort();
        let _ = connection.handle.await;
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("mqtt bridge disconnected");
    }
}

/// Decodes `payload` once and hands it to every callback on `topic`.
/// Returns how many callbacks ran.
fn dispatch(registry: &Mutex<TopicRegistry>, topic: &str, payload: &[u8]) -> usize {
    let callbacks = lock(registry).callbacks(topic);
    if callbacks.is_empty() {
        return 0;
    }
    let value: JsonValue = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(topic, error = %err, "dropping invalid JSON on mqtt topic");
            return 0;
        }
    };
    for callback in &callbacks {
        callback(&value);
    }
    callbacks.len()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "misting-test".to_string(),
            topic_prefix: "greenhouse".to_string(),
            keepalive: Duration::from_secs(30),
        }
    }

    fn counter(
        registry: &Arc<Mutex<TopicRegistry>>,
        topic: &str,
    ) -> (SubscriptionId, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let id = lock(registry).insert(
            topic.to_string(),
            Arc::new(move |_: &JsonValue| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (id, hits)
    }

    #[test]
    fn topics_are_built_from_prefix() {
        let settings = settings();
        assert_eq!(settings.sensor_topic(), "greenhouse/sensor-data");
        assert_eq!(settings.status_topic(), "greenhouse/status");
    }

    #[test]
    fn dispatch_reaches_only_exact_topic_subscribers() {
        let registry = Arc::new(Mutex::new(TopicRegistry::default()));
        let (_, sensor_a) = counter(&registry, "greenhouse/sensor-data");
        let (_, sensor_b) = counter(&registry, "greenhouse/sensor-data");
        let (_, status) = counter(&registry, "greenhouse/status");

        let delivered = dispatch(&registry, "greenhouse/sensor-data", br#"{"average":{}}"#);
        assert_eq!(delivered, 2);
        assert_eq!(sensor_a.load(Ordering::SeqCst), 1);
        assert_eq!(sensor_b.load(Ordering::SeqCst), 1);
        assert_eq!(status.load(Ordering::SeqCst), 0);

        assert_eq!(dispatch(&registry, "greenhouse/other", b"{}"), 0);
    }

    #[test]
    fn invalid_json_is_dropped() {
        let registry = Arc::new(Mutex::new(TopicRegistry::default()));
        let (_, hits) = counter(&registry, "greenhouse/status");
        assert_eq!(dispatch(&registry, "greenhouse/status", b"not json"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_removes_one_callback_and_empty_topics() {
        let registry = Arc::new(Mutex::new(TopicRegistry::default()));
        let (first, first_hits) = counter(&registry, "greenhouse/status");
        let (second, second_hits) = counter(&registry, "greenhouse/status");

        assert!(lock(&registry).remove("greenhouse/status", first));
        assert!(!lock(&registry).remove("greenhouse/status", first));
        dispatch(&registry, "greenhouse/status", b"{}");
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);

        assert!(lock(&registry).remove("greenhouse/status", second));
        assert_eq!(lock(&registry).topics().count(), 0);
    }

    #[test]
    fn callbacks_may_unsubscribe_while_being_dispatched() {
        let bridge = Arc::new(MqttBridge::new(settings()));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::default();
        let inner_bridge = Arc::downgrade(&bridge);
        let inner_slot = slot.clone();
        let id = bridge.subscribe("greenhouse/status", move |_| {
            let id = lock(&inner_slot).take();
            if let (Some(bridge), Some(id)) = (inner_bridge.upgrade(), id) {
                bridge.unsubscribe("greenhouse/status", id);
            }
        });
        *lock(&slot) = Some(id);

        assert_eq!(dispatch(&bridge.registry, "greenhouse/status", b"{}"), 1);
        assert_eq!(dispatch(&bridge.registry, "greenhouse/status", b"{}"), 0);
    }

    #[tokio::test]
    async fn publish_without_connection_reports_not_sent() {
        let bridge = MqttBridge::new(settings());
        assert!(!bridge.is_connected());
        let sent = bridge
            .publish("greenhouse/control", &serde_json::json!({"action": "ON"}))
            .await
            .unwrap();
        assert!(!sent);
        bridge.disconnect().await;
    }
}
