//! Allow-set of event keys forwarded to listeners.

use std::collections::HashSet;

use crate::error::{DomainError, DomainResult};
use crate::event::Event;

/// Keys forwarded when no explicit allow-set is configured.
pub const DEFAULT_FORWARDED_KEYS: [&str; 2] = ["login", "card-read-error"];

/// Static predicate over event keys.
///
/// Only events whose key is in the allow-set are eligible for broadcast;
/// everything else is dropped without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    keys: HashSet<String>,
}

impl KeyFilter {
    /// Creates a filter from the given keys.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFieldValue` if a key is empty or
    /// surrounded by whitespace.
    pub fn new<I, S>(keys: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = HashSet::new();
        for key in keys {
            let key = key.into();
            if key.is_empty() || key.trim() != key {
                return Err(DomainError::InvalidFieldValue {
                    field: "event key".to_string(),
                    value: key,
                    expected: "non-empty key without surrounding whitespace".to_string(),
                });
            }
            set.insert(key);
        }
        Ok(Self { keys: set })
    }

    /// Returns true if events with this key are forwarded.
    pub fn allows(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns true if the event is forwarded.
    pub fn matches(&self, event: &Event) -> bool {
        self.allows(&event.key)
    }

    /// Returns the configured keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.keys.iter().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl Default for KeyFilter {
    fn default() -> Self {
        Self {
            keys: DEFAULT_FORWARDED_KEYS.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_login_and_card_errors() {
        let filter = KeyFilter::default();
        assert!(filter.allows("login"));
        assert!(filter.allows("card-read-error"));
        assert!(!filter.allows("heartbeat-data"));
        assert!(!filter.allows("websocket-count"));
        assert!(!filter.allows(""));
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let filter = KeyFilter::default();
        assert!(!filter.allows("Login"));
        assert!(!filter.allows("LOGIN"));
    }

    #[test]
    fn test_matches_event() {
        let filter = KeyFilter::default();
        assert!(filter.matches(&Event::new("login", "userX")));
        assert!(!filter.matches(&Event::new("heartbeat-data", "ignored")));
    }

    #[test]
    fn test_custom_keys() {
        let filter = KeyFilter::new(["room-state"]).unwrap();
        assert!(filter.allows("room-state"));
        assert!(!filter.allows("login"));
        assert_eq!(filter.keys(), vec!["room-state"]);
    }

    #[test]
    fn test_rejects_blank_keys() {
        assert!(KeyFilter::new([""]).is_err());
        assert!(KeyFilter::new([" login"]).is_err());
    }

    #[test]
    fn test_empty_filter_allows_nothing() {
        let filter = KeyFilter::new(Vec::<String>::new()).unwrap();
        assert!(!filter.allows("login"));
    }
}
