//!
//! This module defines the Resolver, which tracks the sources and receivers bound to each topic of a
//! context and the connect/disconnect topology between them.
//!
use crate::message::Delivery;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

/// Delivery endpoint of a bound receiver.
#[derive(Clone, Debug)]
pub(crate) struct ReceiverPort {
    pub(crate) id: u64,
    pub(crate) name: Arc<str>,
    pub(crate) queue: mpsc::Sender<Delivery>,
    pub(crate) control_messages: bool,
}

/// Event endpoint of an advertised source.
#[derive(Debug)]
pub(crate) struct SourcePort {
    pub(crate) id: u64,
    pub(crate) name: Arc<str>,
    pub(crate) events: mpsc::UnboundedSender<PeerEvent>,
}

/// Receiver transition queued for a source's event callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerEvent {
    Connect(Arc<str>),
    Disconnect(Arc<str>),
}

struct TopicEntry {
    sources: Vec<SourcePort>,
    receivers: Vec<ReceiverPort>,

    /// Flipped to true once the first source is advertised.
    resolved: watch::Sender<bool>,
}

impl TopicEntry {
    fn new() -> Self {
        let (resolved, _) = watch::channel(false);
        Self {
            sources: Vec::new(),
            receivers: Vec::new(),
            resolved,
        }
    }
}

/// Resolver maintains the binding entries for each topic in use by one context.
pub(crate) struct Resolver {
    topics: Mutex<HashMap<String, TopicEntry>>,

    /// (topic, source) pairs already reported to the new-source notification callback.
    sightings: Mutex<HashSet<(Arc<str>, Arc<str>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("resolver lock poisoned, continuing with inner state");
            poisoned.into_inner()
        }
    }
}

/// Drops the entry for `topic` once nothing is bound to it and no `Topic` handle
/// still watches its resolution state.
fn release_if_unused(topics: &mut HashMap<String, TopicEntry>, topic: &str) {
    let unused = topics.get(topic).map_or(false, |entry| {
        entry.sources.is_empty() && entry.receivers.is_empty() && entry.resolved.receiver_count() == 0
    });
    if unused {
        topics.remove(topic);
    }
}

impl Resolver {
    pub(crate) fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            sightings: Mutex::new(HashSet::new()),
        }
    }

    /// Makes sure an entry exists for `topic` and returns a view of its resolution state.
    pub(crate) fn reserve(&self, topic: &str) -> watch::Receiver<bool> {
        let mut topics = lock(&self.topics);
        topics
            .entry(topic.to_owned())
            .or_insert_with(TopicEntry::new)
            .resolved
            .subscribe()
    }

    /// Adds a source to `topic`. Every receiver already bound gets connected to it.
    pub(crate) fn advertise_source(&self, topic: &str, port: SourcePort) {
        let mut topics = lock(&self.topics);
        let entry = topics.entry(topic.to_owned()).or_insert_with(TopicEntry::new);
        for receiver in &entry.receivers {
            let _ = port.events.send(PeerEvent::Connect(Arc::clone(&receiver.name)));
        }
        entry.sources.push(port);
        entry.resolved.send_replace(true);
    }

    /// Removes a source. Dropping its port closes the event queue once drained.
    pub(crate) fn withdraw_source(&self, topic: &str, id: u64) -> Option<SourcePort> {
        let mut topics = lock(&self.topics);
        let entry = topics.get_mut(topic)?;
        let index = entry.sources.iter().position(|port| port.id == id)?;
        let port = entry.sources.remove(index);
        release_if_unused(&mut topics, topic);
        Some(port)
    }

    /// Binds a receiver to `topic`, connecting it to every advertised source. Returns
    /// the identifiers of those sources.
    pub(crate) fn bind_receiver(&self, topic: &str, port: ReceiverPort) -> Vec<Arc<str>> {
        let mut topics = lock(&self.topics);
        let entry = topics.entry(topic.to_owned()).or_insert_with(TopicEntry::new);
        let sources = entry
            .sources
            .iter()
            .map(|source| {
                let _ = source.events.send(PeerEvent::Connect(Arc::clone(&port.name)));
                Arc::clone(&source.name)
            })
            .collect();
        entry.receivers.push(port);
        sources
    }

    /// Unbinds a receiver; every source on the topic sees it disconnect.
    pub(crate) fn unbind_receiver(&self, topic: &str, id: u64) -> bool {
        let mut topics = lock(&self.topics);
        let entry = match topics.get_mut(topic) {
            Some(entry) => entry,
            None => return false,
        };
        let index = match entry.receivers.iter().position(|port| port.id == id) {
            Some(index) => index,
            None => return false,
        };
        let port = entry.receivers.remove(index);
        for source in &entry.sources {
            let _ = source.events.send(PeerEvent::Disconnect(Arc::clone(&port.name)));
        }
        release_if_unused(&mut topics, topic);
        true
    }

    /// Snapshot of the receivers currently bound to `topic`.
    pub(crate) fn receivers(&self, topic: &str) -> Vec<ReceiverPort> {
        let topics = lock(&self.topics);
        match topics.get(topic) {
            Some(entry) => entry.receivers.clone(),
            None => Vec::new(),
        }
    }

    /// True exactly once per (topic, source) pair.
    pub(crate) fn first_sighting(&self, topic: &Arc<str>, source: &Arc<str>) -> bool {
        let mut sightings = lock(&self.sightings);
        sightings.insert((Arc::clone(topic), Arc::clone(source)))
    }

    pub(crate) fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }
}
