//! Call metadata.
//!
//! Metadata travels next to a call, separate from the message body. Header
//! metadata is available before the first response message, trailer metadata
//! only once the call has completed.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Ordered multi-map of metadata entries
///
/// Keys are ASCII-lowercased on insertion. Entries keep insertion order and a
/// key may appear several times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap {
    entries: Vec<(String, String)>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping any existing values of the key
    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .push((key.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Replace all values of a key with a single value
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        let key = key.as_ref().to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    /// First value of a key
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a key, in insertion order
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove all values of a key
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every entry of `other` after the existing entries
    ///
    /// Nothing is overwritten: when both maps define a key, the key ends up
    /// with the values of `self` followed by the values of `other`.
    pub fn join(&mut self, other: &MetadataMap) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Collect headers whose name starts with `prefix`, stripping the prefix
    pub fn from_headers(headers: &HeaderMap, prefix: &str) -> Self {
        let prefix = prefix.to_ascii_lowercase();
        let mut map = Self::new();
        for (name, value) in headers {
            let Some(key) = name.as_str().strip_prefix(prefix.as_str()) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            match value.to_str() {
                Ok(v) => map.append(key, v),
                Err(_) => debug!("Skipping non-text metadata header {}", name),
            }
        }
        map
    }

    /// Write entries into `headers` as `{prefix}{key}`, preserving order
    ///
    /// Entries whose key or value is not a valid HTTP header are skipped.
    pub fn write_headers(&self, headers: &mut HeaderMap, prefix: &str) {
        for (key, value) in self.iter() {
            let name = match HeaderName::from_bytes(format!("{}{}", prefix, key).as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    debug!("Skipping metadata key {:?}: not a valid header name", key);
                    continue;
                }
            };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name, value);
                }
                Err(_) => debug!("Skipping metadata {:?}: not a valid header value", key),
            }
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for MetadataMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.append(k, v);
        }
        map
    }
}

/// Header and trailer metadata of one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    #[serde(default)]
    pub headers: MetadataMap,
    #[serde(default)]
    pub trailers: MetadataMap,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join two metadata sets; entries of `later` come after entries of `self`
    pub fn join(mut self, later: &CallMetadata) -> Self {
        self.headers.join(&later.headers);
        self.trailers.join(&later.trailers);
        self
    }
}

/// Shared, writable [`CallMetadata`]
///
/// Handed to whoever produces metadata during a call (a handler, a transport).
/// Clones share the same underlying metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataSink {
    inner: Arc<Mutex<CallMetadata>>,
}

impl MetadataSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CallMetadata> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append_header(&self, key: impl AsRef<str>, value: impl Into<String>) {
        self.lock().headers.append(key, value);
    }

    pub fn append_trailer(&self, key: impl AsRef<str>, value: impl Into<String>) {
        self.lock().trailers.append(key, value);
    }

    pub fn extend_headers(&self, headers: &MetadataMap) {
        self.lock().headers.join(headers);
    }

    pub fn extend_trailers(&self, trailers: &MetadataMap) {
        self.lock().trailers.join(trailers);
    }

    pub fn headers(&self) -> MetadataMap {
        self.lock().headers.clone()
    }

    pub fn trailers(&self) -> MetadataMap {
        self.lock().trailers.clone()
    }

    pub fn snapshot(&self) -> CallMetadata {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_lowercased_and_order_kept() {
        let mut md = MetadataMap::new();
        md.append("X-Request-Id", "a");
        md.append("x-b", "1");
        md.append("X-B", "2");

        assert_eq!(md.get("x-request-id"), Some("a"));
        assert_eq!(md.get_all("x-b").collect::<Vec<_>>(), vec!["1", "2"]);
        let keys: Vec<_> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["x-request-id", "x-b", "x-b"]);
    }

    #[test]
    fn test_insert_replaces() {
        let mut md = MetadataMap::new();
        md.append("k", "1");
        md.append("k", "2");
        md.insert("k", "3");
        assert_eq!(md.get_all("k").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn test_join_never_overwrites() {
        let mut handler = MetadataMap::new();
        handler.append("x-trace", "handler");
        let mut transport = MetadataMap::new();
        transport.append("x-trace", "transport");

        handler.join(&transport);
        assert_eq!(
            handler.get_all("x-trace").collect::<Vec<_>>(),
            vec!["handler", "transport"]
        );
    }

    #[test]
    fn test_header_roundtrip_with_prefix() {
        let mut md = MetadataMap::new();
        md.append("x-a", "1");
        md.append("x-a", "2");
        md.append("bad key", "skipped");

        let mut headers = HeaderMap::new();
        md.write_headers(&mut headers, "gantry-meta-");
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let back = MetadataMap::from_headers(&headers, "gantry-meta-");
        assert_eq!(back.get_all("x-a").collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn test_sink_shared_between_clones() {
        let sink = MetadataSink::new();
        let clone = sink.clone();
        clone.append_header("h", "1");
        clone.append_trailer("t", "2");

        let md = sink.snapshot();
        assert_eq!(md.headers.get("h"), Some("1"));
        assert_eq!(md.trailers.get("t"), Some("2"));
    }

    #[test]
    fn test_call_metadata_json() {
        let mut md = CallMetadata::new();
        md.trailers.append("x-count", "3");
        let json = serde_json::to_string(&md).unwrap();
        assert_eq!(json, r#"{"headers":[],"trailers":[["x-count","3"]]}"#);
    }
}
