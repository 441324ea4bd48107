use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::envelope::Destination;
use crate::error::{MqError, Result};
use crate::handler::MessageHandler;

/// Opaque key of a queue registration. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationIndex(u64);

impl RegistrationIndex {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// A handler bound to a (queue, topic, exchange) triple.
pub struct QueueRegistration {
    pub index: RegistrationIndex,
    /// Queue name; the broker-confirmed one after `update`.
    pub queue: String,
    pub topic: String,
    pub exchange: String,
    /// Receives every delivery of this registration's consumer.
    pub handler: Arc<dyn MessageHandler>,
    /// Broker consumer tag; `None` until the subscription is confirmed.
    pub consumer_tag: Option<String>,
    /// Extra logical subscribers sharing this registration.
    pub ref_count: usize,
}

impl QueueRegistration {
    fn matches(&self, queue: &str, topic: &str, exchange: &str) -> bool {
        self.queue == queue && self.topic == topic && self.exchange == exchange
    }
}

impl fmt::Debug for QueueRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistration")
            .field("index", &self.index)
            .field("queue", &self.queue)
            .field("topic", &self.topic)
            .field("exchange", &self.exchange)
            .field("consumer_tag", &self.consumer_tag)
            .field("ref_count", &self.ref_count)
            .finish_non_exhaustive()
    }
}

/// Result of [`QueuesRoutingTable::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    pub index: RegistrationIndex,
    /// True when the caller joined an existing registration and no new broker
    /// subscription is needed.
    pub shared: bool,
}

/// Keys of the first registration matching a triple. Both `None` when
/// nothing matches; `consumer_tag` is also `None` before `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerRefs {
    pub index: Option<RegistrationIndex>,
    pub consumer_tag: Option<String>,
}

/// Maps broker consumer tags back to application handlers.
///
/// Not synchronized; the owner serializes access.
pub struct QueuesRoutingTable {
    origin: String,
    next_index: u64,
    // ordered by index, so scans see registrations in creation order
    handlers: BTreeMap<RegistrationIndex, QueueRegistration>,
    consumer_tags: HashMap<String, RegistrationIndex>,
}

impl QueuesRoutingTable {
    pub fn new(name: &str) -> Self {
        Self {
            origin: format!("{name}.QueuesRoutingTable"),
            next_index: 0,
            handlers: BTreeMap::new(),
            consumer_tags: HashMap::new(),
        }
    }

    /// Stores `handler` for `destination`.
    ///
    /// With `allow_duplicate == false`, an existing registration for the same
    /// triple is shared: its `ref_count` grows and its index is returned.
    pub fn register(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        destination: &Destination,
        allow_duplicate: bool,
    ) -> Registered {
        if !allow_duplicate {
            if let Some(existing) = self.handlers.values_mut().find(|r| {
                r.matches(
                    &destination.queue,
                    &destination.topic,
                    &destination.exchange,
                )
            }) {
                existing.ref_count += 1;
                debug!(target: "queues_table", index = %existing.index, ref_count = existing.ref_count, "Sharing registration");
                return Registered {
                    index: existing.index,
                    shared: true,
                };
            }
        }

        self.next_index += 1;
        let index = RegistrationIndex(self.next_index);
        self.handlers.insert(
            index,
            QueueRegistration {
                index,
                queue: destination.queue.clone(),
                topic: destination.topic.clone(),
                exchange: destination.exchange.clone(),
                handler,
                consumer_tag: None,
                ref_count: 0,
            },
        );
        Registered {
            index,
            shared: false,
        }
    }

    /// Records the broker-confirmed queue name and consumer tag.
    pub fn update(
        &mut self,
        index: RegistrationIndex,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
    ) -> Result<()> {
        let registration = self
            .handlers
            .get_mut(&index)
            .ok_or_else(|| MqError::UnknownIndex {
                origin: format!("{}.update", self.origin),
                index: index.get(),
            })?;
        let consumer_tag = consumer_tag.into();
        if let Some(previous) = registration.consumer_tag.replace(consumer_tag.clone()) {
            self.consumer_tags.remove(&previous);
        }
        registration.queue = queue.into();
        self.consumer_tags.insert(consumer_tag, index);
        Ok(())
    }

    /// Drops one reference to a registration. Returns true once the
    /// registration itself is removed; unknown indexes return false.
    pub fn unregister(&mut self, index: RegistrationIndex) -> bool {
        let Some(registration) = self.handlers.get_mut(&index) else {
            return false;
        };
        if registration.ref_count > 0 {
            registration.ref_count -= 1;
            return false;
        }
        if let Some(removed) = self.handlers.remove(&index) {
            if let Some(tag) = removed.consumer_tag {
                self.consumer_tags.remove(&tag);
            }
        }
        true
    }

    pub fn handler_by_index(&self, index: RegistrationIndex) -> Result<&QueueRegistration> {
        self.handlers
            .get(&index)
            .ok_or_else(|| MqError::UnknownIndex {
                origin: format!("{}.getHandlerByIndex", self.origin),
                index: index.get(),
            })
    }

    /// Registration whose broker consumer is `consumer_tag`.
    pub fn handler_by_consumer_tag(&self, consumer_tag: &str) -> Result<&QueueRegistration> {
        self.consumer_tags
            .get(consumer_tag)
            .and_then(|index| self.handlers.get(index))
            .ok_or_else(|| MqError::UnknownConsumerTag {
                origin: format!("{}.getHandlerByConsumerTag", self.origin),
                consumer_tag: consumer_tag.to_string(),
            })
    }

    /// First registration (in creation order) bound to the triple.
    pub fn handler_refs_by_properties(&self, queue: &str, topic: &str, exchange: &str) -> HandlerRefs {
        self.handlers
            .values()
            .find(|r| r.matches(queue, topic, exchange))
            .map(|r| HandlerRefs {
                index: Some(r.index),
                consumer_tag: r.consumer_tag.clone(),
            })
            .unwrap_or_default()
    }

    pub fn ref_count(&self, index: RegistrationIndex) -> Option<usize> {
        self.handlers.get(&index).map(|r| r.ref_count)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
