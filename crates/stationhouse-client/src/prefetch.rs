//! Prefetch cache shared by every consumer of a client.
//!
//! Keyed by (station, consumer group). Station names are lower-cased so
//! `Orders` and `orders` share an entry. A background prefetch appends its
//! whole batch under one shard lock, so a concurrent `take` sees either none
//! or all of it.

use crate::message::StationMessage;
use dashmap::DashMap;
use std::collections::VecDeque;

type CacheKey = (String, String);

#[derive(Debug)]
pub struct PrefetchCache<T = StationMessage> {
    entries: DashMap<CacheKey, VecDeque<T>>,
}

fn key(station: &str, group: &str) -> CacheKey {
    (station.to_lowercase(), group.to_string())
}

impl<T> PrefetchCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Append a batch at the back of the (station, group) entry.
    pub fn extend(&self, station: &str, group: &str, messages: Vec<T>) {
        if messages.is_empty() {
            return;
        }
        self.entries
            .entry(key(station, group))
            .or_default()
            .extend(messages);
    }

    /// Remove up to `max` messages from the front of the entry.
    pub fn take(&self, station: &str, group: &str, max: usize) -> Vec<T> {
        match self.entries.get_mut(&key(station, group)) {
            Some(mut queue) => {
                let take = max.min(queue.len());
                queue.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, station: &str, group: &str) -> usize {
        self.entries
            .get(&key(station, group))
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, station: &str, group: &str) -> bool {
        self.entries.contains_key(&key(station, group))
    }

    /// Drop the entry for one consumer group.
    pub fn remove(&self, station: &str, group: &str) -> usize {
        self.entries
            .remove(&key(station, group))
            .map(|(_, queue)| queue.len())
            .unwrap_or(0)
    }

    /// Drop every entry belonging to a station.
    pub fn remove_station(&self, station: &str) {
        let station = station.to_lowercase();
        self.entries.retain(|(s, _), _| *s != station);
    }
}

impl<T> Default for PrefetchCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
