//! Event records, references and the append-only event log.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a stored event, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Ulid);

impl EventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse an event ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that happened. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Identity used for matching, e.g. `"sensor.on"`.
    pub name: String,
    /// Matchable key/value attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Free-form data carried with the event.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self::at(name, Utc::now())
    }

    /// Create an event with an explicit timestamp.
    pub fn at(name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            attributes: BTreeMap::new(),
            payload: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Reference that matches exactly this event's name and attributes.
    pub fn reference(&self) -> EventReference {
        EventReference {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Lightweight key for "has an event like this happened".
///
/// Matches an event when the names are equal and every attribute listed
/// here is present on the event with the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl EventReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.name == event.name
            && self
                .attributes
                .iter()
                .all(|(key, value)| event.attributes.get(key) == Some(value))
    }
}

impl From<&str> for EventReference {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl std::fmt::Display for EventReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.attributes.is_empty() {
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "[{}]", attrs.join(","))?;
        }
        Ok(())
    }
}

/// Read access to event history used by expression evaluation.
pub trait EventLookup {
    /// Most recent event matching `reference` with `timestamp <= at`.
    fn latest(&self, reference: &EventReference, at: DateTime<Utc>) -> Option<Event>;
}

/// Append-only event log with a name index.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<Event>,
    by_name: HashMap<String, Vec<usize>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and index it. Returns its position in the log.
    pub fn append(&mut self, event: Event) -> usize {
        let position = self.events.len();
        self.by_name
            .entry(event.name.clone())
            .or_default()
            .push(position);
        self.events.push(event);
        position
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Matches among the first `end` appended events.
    fn matching<'a, 'r>(
        &'a self,
        reference: &'r EventReference,
        end: usize,
    ) -> impl Iterator<Item = &'a Event> + use<'a, 'r> {
        self.by_name
            .get(&reference.name)
            .into_iter()
            .flatten()
            .take_while(move |&&position| position < end)
            .map(move |&position| &self.events[position])
            .filter(move |event| reference.matches(event))
    }

    /// True iff any stored event matches `reference`, regardless of time.
    pub fn happened(&self, reference: &EventReference) -> bool {
        self.matching(reference, self.events.len()).next().is_some()
    }

    /// Matching event with the greatest timestamp not after `at`.
    ///
    /// Append order and timestamp order can differ, so every match is
    /// inspected.
    pub fn latest_matching(&self, reference: &EventReference, at: DateTime<Utc>) -> Option<&Event> {
        self.latest_matching_before(reference, at, self.events.len())
    }

    /// Like [`EventLog::latest_matching`], considering only the first `end`
    /// appended events.
    pub fn latest_matching_before(
        &self,
        reference: &EventReference,
        at: DateTime<Utc>,
        end: usize,
    ) -> Option<&Event> {
        self.matching(reference, end)
            .filter(|event| event.timestamp <= at)
            .max_by_key(|event| event.timestamp)
    }

    /// The log as it was after its first `end` appends.
    pub fn prefix(&self, end: usize) -> LogPrefix<'_> {
        LogPrefix {
            log: self,
            end: end.min(self.events.len()),
        }
    }
}

/// Read-only view of the first `end` events of an [`EventLog`].
#[derive(Debug, Clone, Copy)]
pub struct LogPrefix<'a> {
    log: &'a EventLog,
    end: usize,
}

impl LogPrefix<'_> {
    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }
}

impl EventLookup for LogPrefix<'_> {
    fn latest(&self, reference: &EventReference, at: DateTime<Utc>) -> Option<Event> {
        self.log
            .latest_matching_before(reference, at, self.end)
            .cloned()
    }
}

impl EventLookup for EventLog {
    fn latest(&self, reference: &EventReference, at: DateTime<Utc>) -> Option<Event> {
        self.latest_matching(reference, at).cloned()
    }
}

/// Per-dispatch-round cache of already resolved events.
///
/// Shared by every handler notified for the same stored event so the log
/// is queried once per reference.
#[derive(Debug, Default, Clone)]
pub struct EventCache {
    entries: HashMap<EventReference, Event>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: EventReference, event: Event) {
        self.entries.insert(reference, event);
    }

    pub fn get(&self, reference: &EventReference) -> Option<&Event> {
        self.entries.get(reference)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lookup that consults a cache before falling back to another lookup.
pub struct CachedLookup<'a, L: ?Sized> {
    cache: Option<&'a EventCache>,
    fallback: &'a L,
}

impl<'a, L: EventLookup + ?Sized> CachedLookup<'a, L> {
    pub fn new(cache: Option<&'a EventCache>, fallback: &'a L) -> Self {
        Self { cache, fallback }
    }
}

impl<L: EventLookup + ?Sized> EventLookup for CachedLookup<'_, L> {
    fn latest(&self, reference: &EventReference, at: DateTime<Utc>) -> Option<Event> {
        if let Some(event) = self.cache.and_then(|cache| cache.get(reference))
            && event.timestamp <= at
        {
            return Some(event.clone());
        }
        self.fallback.latest(reference, at)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn reference_matches_on_name_and_attributes() {
        let event = Event::at("door", t(0))
            .with_attribute("room", "kitchen")
            .with_attribute("state", "open");

        assert!(EventReference::new("door").matches(&event));
        assert!(EventReference::new("door").with_attribute("room", "kitchen").matches(&event));
        assert!(!EventReference::new("door").with_attribute("room", "hall").matches(&event));
        assert!(!EventReference::new("window").matches(&event));
        assert!(event.reference().matches(&event));
    }

    #[test]
    fn latest_matching_uses_timestamp_not_append_order() {
        let mut log = EventLog::new();
        log.append(Event::at("tick", t(10)).with_payload(serde_json::json!(2)));
        log.append(Event::at("tick", t(5)).with_payload(serde_json::json!(1)));

        let latest = log.latest_matching(&"tick".into(), t(20)).unwrap();
        assert_eq!(latest.timestamp, t(10));

        let earlier = log.latest_matching(&"tick".into(), t(7)).unwrap();
        assert_eq!(earlier.timestamp, t(5));

        assert!(log.latest_matching(&"tick".into(), t(1)).is_none());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn happened_ignores_time() {
        let mut log = EventLog::new();
        assert!(!log.happened(&"boot".into()));
        log.append(Event::at("boot", t(0)));
        assert!(log.happened(&"boot".into()));
        assert!(!log.happened(&"shutdown".into()));
    }

    #[test]
    fn prefix_hides_later_appends() {
        let mut log = EventLog::new();
        let on = log.append(Event::at("sensor.on", t(0)));
        log.append(Event::at("sensor.off", t(1)));
        log.append(Event::at("sensor.on", t(2)));

        let first = log.prefix(on + 1);
        assert_eq!(first.len(), 1);
        assert!(first.latest(&"sensor.off".into(), t(10)).is_none());
        assert_eq!(first.latest(&"sensor.on".into(), t(10)).unwrap().timestamp, t(0));

        let all = log.prefix(usize::MAX);
        assert_eq!(all.len(), 3);
        assert_eq!(all.latest(&"sensor.on".into(), t(10)).unwrap().timestamp, t(2));
        assert!(log.prefix(0).is_empty());
    }

    #[test]
    fn cached_lookup_prefers_cache_within_time() {
        let mut log = EventLog::new();
        log.append(Event::at("a", t(0)));

        let mut cache = EventCache::new();
        cache.insert("a".into(), Event::at("a", t(3)));

        let lookup = CachedLookup::new(Some(&cache), &log);
        assert_eq!(lookup.latest(&"a".into(), t(5)).unwrap().timestamp, t(3));
        // Cached entry is in the future of `at`; fall back to the log.
        assert_eq!(lookup.latest(&"a".into(), t(1)).unwrap().timestamp, t(0));
        assert!(lookup.latest(&"b".into(), t(5)).is_none());

        let uncached = CachedLookup::new(None, &log);
        assert_eq!(
            uncached.latest(&"a".into(), t(0) + Duration::seconds(1)).unwrap().timestamp,
            t(0)
        );
    }
}
