//! Ordered query parameter sets and the shared merge map used by the relay.

use std::sync::{Arc, Mutex};

use url::form_urlencoded;

/// Query keys the relay consumes for routing. They never reach the upstream.
pub const ROUTING_KEYS: [&str; 3] = ["protocol", "hostname", "port"];

/// Returns true when `key` is one of the relay routing keys.
pub fn is_routing_key(key: &str) -> bool {
    ROUTING_KEYS.contains(&key)
}

/// An ordered multimap of query parameters.
///
/// Keys keep the position of their first insertion. Inserting an existing key
/// replaces all of its values in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    entries: Vec<(String, Vec<String>)>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw (undecoded) query string. Repeated keys collect their values.
    pub fn parse(query: &str) -> Self {
        let mut map = Self::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match map.entries.iter_mut().find(|(k, _)| *k == key) {
                Some((_, values)) => values.push(value.into_owned()),
                None => map.entries.push((key.into_owned(), vec![value.into_owned()])),
            }
        }
        map
    }

    /// Insert or overwrite `key` with the given values.
    pub fn set(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((key, values)),
        }
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Overwrite every non-routing key of `other` into `self`.
    pub fn merge_extra(&mut self, other: &QueryMap) {
        for (key, values) in &other.entries {
            if is_routing_key(key) {
                continue;
            }
            self.set(key.clone(), values.clone());
        }
    }

    /// Serialize as `application/x-www-form-urlencoded`.
    pub fn to_query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.entries {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }
}

/// The baseline query set shared by the connector and every relay request.
///
/// Writes from one tunneled request are visible to all others. The merge is
/// deliberately not scoped per connection.
#[derive(Debug, Clone, Default)]
pub struct SharedQuery {
    inner: Arc<Mutex<QueryMap>>,
}

impl SharedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole baseline, as each connect call does.
    pub fn replace(&self, query: QueryMap) {
        *self.lock() = query;
    }

    /// Merge the extra keys of an inbound request and return the merged set.
    pub fn merge_and_snapshot(&self, inbound: &QueryMap) -> QueryMap {
        let mut guard = self.lock();
        guard.merge_extra(inbound);
        guard.clone()
    }

    pub fn snapshot(&self) -> QueryMap {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueryMap> {
        // A poisoned map still holds a usable query set.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
