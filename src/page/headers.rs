//! Multi-valued header map keyed by lowercase name.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderBag(BTreeMap<String, Vec<String>>);

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every valid UTF-8 header out of an `http` header map.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut bag = Self::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                bag.append(name.as_str(), value);
            }
        }
        bag
    }

    /// Add a value, keeping existing ones. Duplicate values are dropped.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self.0.entry(name.to_ascii_lowercase()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Replace all values of `name`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Header names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Flattened `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Append every value of `other`.
    pub fn merge(&mut self, other: &HeaderBag) {
        for (name, value) in other.iter() {
            self.append(name, value);
        }
    }

    /// `self` layered over `defaults`: names present here win, the rest come from `defaults`.
    pub fn layered_over(&self, defaults: &HeaderBag) -> HeaderBag {
        let mut layered = defaults.clone();
        for (name, values) in &self.0 {
            layered.0.insert(name.clone(), values.clone());
        }
        layered
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderBag
where
    N: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut bag = Self::new();
        for (name, value) in iter {
            bag.append(name.as_ref(), value);
        }
        bag
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let mut bag = HeaderBag::new();
        bag.append("Content-Type", "text/html");
        assert!(bag.contains("content-type"));
        assert_eq!(bag.first("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn append_keeps_distinct_values() {
        let bag: HeaderBag = [("Vary", "Accept"), ("vary", "Cookie"), ("Vary", "Accept")]
            .into_iter()
            .collect();
        assert_eq!(
            bag.get("vary"),
            Some(&["Accept".to_string(), "Cookie".to_string()][..])
        );
    }

    #[test]
    fn live_headers_win_over_defaults() {
        let stored: HeaderBag = [("content-type", "text/html"), ("x-powered-by", "cache")]
            .into_iter()
            .collect();
        let live: HeaderBag = [("Content-Type", "application/json")].into_iter().collect();

        let layered = live.layered_over(&stored);
        assert_eq!(layered.first("content-type"), Some("application/json"));
        assert_eq!(layered.first("x-powered-by"), Some("cache"));
    }

    #[test]
    fn from_header_map_keeps_repeated_headers() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        let bag = HeaderBag::from_header_map(&map);
        assert_eq!(bag.get("set-cookie").map(<[String]>::len), Some(2));
    }
}
