use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{SessionError, SignalEnvelope};

/// one item delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// topic scoped publish/subscribe relay used for signaling.
///
/// delivery is at-least-once to subscribers connected at publish time.
/// nothing is replayed to late subscribers and there is no ordering across
/// senders.
///
/// the receiver returned by `subscribe` is unbounded: whatever arrives while
/// the subscriber is busy waits in the queue and is never overwritten. it
/// yields `None` once the subscription is gone.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn connect(&self) -> Result<(), SessionError>;
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, SessionError>;
    async fn unsubscribe(&self, topic: &str);
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError>;
}

type Subscribers = HashMap<u64, mpsc::UnboundedSender<ChannelMessage>>;

/// in-memory relay shared by every [`LocalChannel`] created from it.
/// used by tests and by the in-process demo
pub struct LocalRelay {
    /// topic -> (channel id -> queue)
    topics: RwLock<HashMap<String, Subscribers>>,
    next_channel: AtomicU64,
    reachable: AtomicBool,
    duplicate: bool,
    history: Mutex<Vec<ChannelMessage>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_channel: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            duplicate: false,
            history: Mutex::new(Vec::new()),
        }
    }
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// a relay which delivers every message twice
    pub fn duplicating() -> Arc<Self> {
        Arc::new(Self {
            duplicate: true,
            ..Self::default()
        })
    }

    /// a fresh client handle onto this relay
    pub fn channel(self: &Arc<Self>) -> LocalChannel {
        LocalChannel {
            id: self.next_channel.fetch_add(1, Ordering::Relaxed),
            relay: self.clone(),
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    /// makes `connect` and `publish` fail from now on
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// drops every subscription, as if the relay went away. subscribers see
    /// their queues end
    pub fn shut_down(&self) {
        self.topics.write().clear();
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// every payload ever accepted for `topic`, in publish order
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.history
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// like `published`, decoding whatever decodes
    pub fn published_envelopes(&self, topic: &str) -> Vec<SignalEnvelope> {
        self.published(topic)
            .iter()
            .filter_map(|p| SignalEnvelope::decode(p).ok())
            .collect()
    }

    fn add_subscriber(
        &self,
        topic: &str,
        channel: u64,
    ) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(channel, tx);
        rx
    }

    fn remove_subscriber(&self, topic: &str, channel: u64) -> bool {
        let mut topics = self.topics.write();
        let removed = match topics.get_mut(topic) {
            Some(subscribers) => subscribers.remove(&channel).is_some(),
            None => false,
        };
        if topics.get(topic).map_or(false, |s| s.is_empty()) {
            topics.remove(topic);
        }
        removed
    }

    fn deliver(&self, message: ChannelMessage) {
        self.history.lock().push(message.clone());
        let copies = if self.duplicate { 2 } else { 1 };
        let mut topics = self.topics.write();
        let subscribers = match topics.get_mut(&message.topic) {
            Some(subscribers) => subscribers,
            // no subscribers is not an error: the message is simply lost
            None => {
                log::debug!("no subscribers on {}", message.topic);
                return;
            }
        };
        // a dropped receiver means its subscriber is gone
        subscribers.retain(|_, tx| (0..copies).all(|_| tx.send(message.clone()).is_ok()));
    }
}

/// a single participant's connection to a [`LocalRelay`]
pub struct LocalChannel {
    id: u64,
    relay: Arc<LocalRelay>,
    connected: AtomicBool,
    subscriptions: Mutex<HashSet<String>>,
}

impl LocalChannel {
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains(topic)
    }
}

#[async_trait]
impl SignalChannel for LocalChannel {
    async fn connect(&self) -> Result<(), SessionError> {
        if !self.relay.is_reachable() {
            return Err(SessionError::ChannelUnavailable("local relay is offline".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelUnavailable("not connected".into()));
        }
        self.subscriptions.lock().insert(topic.to_string());
        Ok(self.relay.add_subscriber(topic, self.id))
    }

    async fn unsubscribe(&self, topic: &str) {
        let known = self.subscriptions.lock().remove(topic);
        if !self.relay.remove_subscriber(topic, self.id) && !known {
            log::debug!("unsubscribe from {} without a subscription", topic);
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::PublishFailed("channel is not connected".into()));
        }
        if !self.relay.is_reachable() {
            return Err(SessionError::PublishFailed("local relay is offline".into()));
        }
        self.relay.deliver(ChannelMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
