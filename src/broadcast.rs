//! Named broadcast channels.
//!
//! A channel is an ordered list of subscribers. Sending walks the list one
//! item at a time: the list lock is held only long enough to fetch the next
//! subscriber, then released before delivering to it, so a slow subscriber
//! never blocks `add`/`remove` on the same channel. Subscribers that report
//! themselves gone are pruned on the way.
//!
//! # Example
//!
//! ```ignore
//! let registry = BroadcastRegistry::new();
//! registry.add("chat", 1, handle.clone());
//! registry.send_all("chat", b"hello");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Receiver side of a channel.
pub trait Subscriber: Send + Sync {
    /// Returns `false` when the subscriber is gone and should be dropped.
    fn deliver(&self, payload: &[u8]) -> bool;
}

pub type SubscriberId = u64;

struct Entry<S> {
    id: SubscriberId,
    subscriber: S,
}

type Channel<S> = Arc<Mutex<Vec<Entry<S>>>>;

pub struct BroadcastRegistry<S> {
    channels: Mutex<HashMap<String, Channel<S>>>,
}

impl<S: Subscriber + Clone> BroadcastRegistry<S> {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, name: &str) -> Option<Channel<S>> {
        self.channels.lock().get(name).cloned()
    }

    /// Subscribes `subscriber` to `channel`, creating the channel on first use.
    /// An existing entry with the same id is replaced.
    pub fn add(&self, channel: &str, id: SubscriberId, subscriber: S) {
        let list = {
            let mut channels = self.channels.lock();
            Arc::clone(channels.entry(channel.to_string()).or_default())
        };

        let mut entries = list.lock();
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => entry.subscriber = subscriber,
            None => entries.push(Entry { id, subscriber }),
        }
    }

    pub fn remove(&self, channel: &str, id: SubscriberId) -> bool {
        let Some(list) = self.channel(channel) else {
            return false;
        };

        let mut entries = list.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Drops the channel and all its subscribers.
    pub fn clear(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }

    pub fn len(&self, channel: &str) -> usize {
        self.channel(channel).map_or(0, |list| list.lock().len())
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Delivers `payload` to every subscriber. Returns how many accepted it.
    pub fn send_all(&self, channel: &str, payload: &[u8]) -> usize {
        self.send_filtered(channel, payload, |_| true)
    }

    /// Delivers `payload` to the subscribers whose id passes `filter`.
    pub fn send_filtered<F>(&self, channel: &str, payload: &[u8], filter: F) -> usize
    where
        F: Fn(SubscriberId) -> bool,
    {
        let Some(list) = self.channel(channel) else {
            return 0;
        };

        let mut delivered = 0;
        let mut index = 0;

        loop {
            let (id, subscriber) = {
                let entries = list.lock();
                let Some(entry) = entries.get(index) else {
                    break;
                };
                (entry.id, entry.subscriber.clone())
            };

            if !filter(id) {
                index += 1;
                continue;
            }

            if subscriber.deliver(payload) {
                delivered += 1;
                index += 1;
            } else {
                debug!(channel, id, "dropping dead subscriber");
                let mut entries = list.lock();
                // The list may have changed while unlocked.
                match entries.get(index) {
                    Some(entry) if entry.id == id => {
                        entries.remove(index);
                    }
                    _ => {
                        entries.retain(|entry| entry.id != id);
                        index += 1;
                    }
                }
            }
        }

        delivered
    }
}

impl<S: Subscriber + Clone> Default for BroadcastRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
