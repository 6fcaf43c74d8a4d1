//! MQTT Topic Manager (§4.6): subscription diffing against the configured
//! shadow set, driven by a `rumqttc::EventLoop`, following
//! `sonlexuan3000-MerkleKV`'s `AsyncClient`/`EventLoop` wiring — but with a
//! real reconnect/resubscribe cycle in place of that example's stub poll
//! loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, Publish, QoS};
use serde_json::Value;
use shadow_core::model::ShadowKey;
use shadow_harness::shutdown::ShutdownSignal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SUBSCRIBE_BASE_DELAY: Duration = Duration::from_secs(3);
const SUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(60);

/// Where parsed inbound shadow events land. Implemented by the Sync
/// Handler facade, kept as a trait so this module never depends on
/// `crate::handler`.
#[async_trait]
pub trait LocalRequestSink: Send + Sync {
    async fn push_local_update(&self, thing_name: &str, shadow_name: &str, payload: Value);
    async fn push_local_delete(
        &self,
        thing_name: &str,
        shadow_name: &str,
        deleted_version_hint: Option<u64>,
    );
}

fn update_topic(key: &ShadowKey) -> String {
    if key.is_classic() {
        format!("$aws/things/{}/shadow/update", key.thing_name)
    } else {
        format!(
            "$aws/things/{}/shadow/name/{}/update",
            key.thing_name, key.shadow_name
        )
    }
}

fn delete_topic(key: &ShadowKey) -> String {
    if key.is_classic() {
        format!("$aws/things/{}/shadow/delete", key.thing_name)
    } else {
        format!(
            "$aws/things/{}/shadow/name/{}/delete",
            key.thing_name, key.shadow_name
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TopicAction {
    Update,
    Delete,
}

struct ParsedTopic {
    key: ShadowKey,
    action: TopicAction,
}

/// Parses `$aws/things/{thing}/shadow[/name/{shadow}]/{update|delete}`.
struct TopicPattern {
    regex: Regex,
}

impl TopicPattern {
    fn new() -> Self {
        Self {
            regex: Regex::new(r"^\$aws/things/([^/]+)/shadow(?:/name/([^/]+))?/(update|delete)$")
                .expect("static regex is valid"),
        }
    }

    fn parse(&self, topic: &str) -> Option<ParsedTopic> {
        let caps = self.regex.captures(topic)?;
        let thing = caps.get(1)?.as_str().to_string();
        let shadow = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let action = match caps.get(3)?.as_str() {
            "update" => TopicAction::Update,
            "delete" => TopicAction::Delete,
            _ => return None,
        };
        Some(ParsedTopic {
            key: ShadowKey::new(thing, shadow),
            action,
        })
    }
}

/// Owns the MQTT client, the configured target subscription set, and the
/// set currently believed to be live on the broker.
pub struct MqttTopicManager {
    client: AsyncClient,
    pattern: TopicPattern,
    target: Mutex<HashSet<ShadowKey>>,
    subscribed: Mutex<HashSet<String>>,
    sink: Arc<dyn LocalRequestSink>,
    shutdown: ShutdownSignal,
}

impl MqttTopicManager {
    pub fn new(client: AsyncClient, sink: Arc<dyn LocalRequestSink>, shutdown: ShutdownSignal) -> Self {
        Self {
            client,
            pattern: TopicPattern::new(),
            target: Mutex::new(HashSet::new()),
            subscribed: Mutex::new(HashSet::new()),
            sink,
            shutdown,
        }
    }

    /// Replace the configured shadow set and reconcile subscriptions against
    /// it. Called on startup and whenever the synchronize set changes.
    pub async fn set_target(&self, keys: impl IntoIterator<Item = ShadowKey>) {
        *self.target.lock().await = keys.into_iter().collect();
        self.reconcile().await;
    }

    /// Diff the desired topic set against what's believed subscribed and
    /// apply the delta, retrying subscribes with backoff while connected.
    async fn reconcile(&self) {
        let desired: HashSet<String> = {
            let target = self.target.lock().await;
            target
                .iter()
                .flat_map(|key| [update_topic(key), delete_topic(key)])
                .collect()
        };

        let (to_subscribe, to_unsubscribe): (Vec<String>, Vec<String>) = {
            let subscribed = self.subscribed.lock().await;
            let to_subscribe = desired.difference(&subscribed).cloned().collect();
            let to_unsubscribe = subscribed.difference(&desired).cloned().collect();
            (to_subscribe, to_unsubscribe)
        };

        for topic in to_unsubscribe {
            if let Err(err) = self.client.unsubscribe(topic.as_str()).await {
                warn!(%err, topic, "failed to unsubscribe stale shadow topic");
            }
            self.subscribed.lock().await.remove(&topic);
        }

        for topic in to_subscribe {
            if self.subscribe_with_retry(&topic).await {
                self.subscribed.lock().await.insert(topic);
            }
        }
    }

    /// Subscribe to `topic`, retrying with exponential backoff (3s initial,
    /// 60s cap) for as long as the manager is not shutting down. There is no
    /// attempt ceiling — a shadow that is configured for sync must end up
    /// subscribed eventually.
    async fn subscribe_with_retry(&self, topic: &str) -> bool {
        let mut delay = SUBSCRIBE_BASE_DELAY;
        loop {
            if self.shutdown.is_shutting_down() {
                return false;
            }
            match self.client.subscribe(topic, QoS::AtLeastOnce).await {
                Ok(()) => {
                    debug!(topic, "subscribed to shadow topic");
                    return true;
                }
                Err(err) => {
                    warn!(%err, topic, ?delay, "subscribe failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(SUBSCRIBE_MAX_DELAY);
                }
            }
        }
    }

    /// Connection-resume callback: the broker forgot every subscription, so
    /// reconcile from the saved target set.
    async fn on_connect(&self) {
        info!("mqtt connected, reconciling subscriptions");
        self.subscribed.lock().await.clear();
        self.reconcile().await;
    }

    /// Disconnect callback: stop believing anything is subscribed; the
    /// target set is preserved for the next connect.
    async fn on_disconnect(&self) {
        warn!("mqtt disconnected");
        self.subscribed.lock().await.clear();
    }

    async fn handle_publish(&self, publish: &Publish) {
        let Some(parsed) = self.pattern.parse(&publish.topic) else {
            debug!(topic = %publish.topic, "ignoring publish on unrecognized topic");
            return;
        };

        match parsed.action {
            TopicAction::Update => {
                let payload: Value = match serde_json::from_slice(&publish.payload) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%err, topic = %publish.topic, "dropping malformed shadow update payload");
                        return;
                    }
                };
                self.sink
                    .push_local_update(&parsed.key.thing_name, &parsed.key.shadow_name, payload)
                    .await;
            }
            TopicAction::Delete => {
                let hint = serde_json::from_slice::<Value>(&publish.payload)
                    .ok()
                    .and_then(|v| v.get("version").and_then(Value::as_u64));
                self.sink
                    .push_local_delete(&parsed.key.thing_name, &parsed.key.shadow_name, hint)
                    .await;
            }
        }
    }

    /// Drive the MQTT event loop until shutdown is triggered. `rumqttc`
    /// reconnects internally on the next `poll()` after a transport error;
    /// this loop only needs to notice the error to reset local subscription
    /// state and keep polling.
    pub async fn run(self: Arc<Self>, mut eventloop: EventLoop) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let next = tokio::select! {
                event = eventloop.poll() => event,
                _ = shutdown_rx.recv() => break,
            };

            match next {
                Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connect().await,
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&publish).await
                }
                Ok(Event::Incoming(Packet::Disconnect)) => self.on_disconnect().await,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "mqtt eventloop error");
                    self.on_disconnect().await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_classic_update_topic() {
        let pattern = TopicPattern::new();
        let parsed = pattern.parse("$aws/things/robot-1/shadow/update").unwrap();
        assert_eq!(parsed.key, ShadowKey::classic("robot-1"));
        assert_eq!(parsed.action, TopicAction::Update);
    }

    #[test]
    fn parses_named_delete_topic() {
        let pattern = TopicPattern::new();
        let parsed = pattern
            .parse("$aws/things/robot-1/shadow/name/config/delete")
            .unwrap();
        assert_eq!(parsed.key, ShadowKey::new("robot-1", "config"));
        assert_eq!(parsed.action, TopicAction::Delete);
    }

    #[test]
    fn rejects_unrelated_topics() {
        let pattern = TopicPattern::new();
        assert!(pattern.parse("$aws/things/robot-1/shadow/get/accepted").is_none());
        assert!(pattern.parse("some/other/topic").is_none());
    }

    #[test]
    fn topic_builders_round_trip_through_the_parser() {
        let pattern = TopicPattern::new();
        let key = ShadowKey::new("robot-1", "config");
        let parsed = pattern.parse(&update_topic(&key)).unwrap();
        assert_eq!(parsed.key, key);
        assert_eq!(parsed.action, TopicAction::Update);

        let parsed = pattern.parse(&delete_topic(&key)).unwrap();
        assert_eq!(parsed.action, TopicAction::Delete);
    }
}
