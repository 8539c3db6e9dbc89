//! Header storage shared by transports.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::transport::Header;

/// Case-insensitive header map; keys are stored lower-cased.
#[derive(Debug, Default)]
pub struct Metadata {
    inner: RwLock<BTreeMap<String, String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = iter
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        Self {
            inner: RwLock::new(map),
        }
    }
}

impl Header for Metadata {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.read().get(&key.to_ascii_lowercase()).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.inner
            .write()
            .insert(key.to_ascii_lowercase(), value.to_string());
    }

    fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let md = Metadata::new();
        md.set("Content-Type", "application/json");
        assert_eq!(md.get("content-type").as_deref(), Some("application/json"));
        md.set("CONTENT-TYPE", "text/plain");
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("Content-Type").as_deref(), Some("text/plain"));
    }

    #[test]
    fn collects_from_pairs() {
        let md: Metadata = [("B", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(md.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(md.get("missing").is_none());
    }
}
