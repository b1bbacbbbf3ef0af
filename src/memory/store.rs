use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Mime marker recorded with every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mime {
    Text,
    Json,
    Binary,
}

impl Mime {
    fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }
}

/// A stored value: plain text, structured JSON, or raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    value: Stored,
    mime: Mime,
}

/// In-process key-value memory shared by all managers and agents of one task.
///
/// Writes append; reads return the most recent write for a key. Cloning the
/// store clones the handle, not the contents — every manager holds the same
/// underlying log. Single-threaded-cooperative: the mutex only guards against
/// interleaving across await points, there is no cross-task sharing.
#[derive(Clone, Default)]
pub struct KeyValueStore {
    inner: Arc<Mutex<Vec<Entry>>>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Stored) {
        let mime = match &value {
            Stored::Text(_) => Mime::Text,
            Stored::Json(_) => Mime::Json,
            Stored::Binary(_) => Mime::Binary,
        };
        self.set_with_mime(key, value, mime);
    }

    pub fn set_with_mime(&self, key: &str, value: Stored, mime: Mime) {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(Entry {
            key: key.to_string(),
            value,
            mime,
        });
        tracing::debug!(key, total = entries.len(), "memory set");
    }

    /// Latest write for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Stored> {
        let entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
    }

    /// Serialize `value` to JSON and store it under `key`.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json =
            serde_json::to_value(value).with_context(|| format!("serializing value for '{key}'"))?;
        self.set(key, Stored::Json(json));
        Ok(())
    }

    /// Latest JSON write for `key`, decoded into `T`. `None` when the key is
    /// missing; an error only when the stored value does not decode.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(Stored::Json(v)) => {
                let decoded = serde_json::from_value(v)
                    .with_context(|| format!("decoding value for '{key}'"))?;
                Ok(Some(decoded))
            }
            Some(Stored::Text(s)) => {
                // Tolerate JSON that arrived as text (agent-written blobs).
                let decoded = serde_json::from_str(&s)
                    .with_context(|| format!("decoding text value for '{key}'"))?;
                Ok(Some(decoded))
            }
            Some(Stored::Binary(_)) => Ok(None),
            None => Ok(None),
        }
    }

    pub fn set_text(&self, key: &str, value: impl Into<String>) {
        self.set(key, Stored::Text(value.into()));
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Stored::Text(s) => Some(s),
            Stored::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Unique keys in first-write order.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen = Vec::new();
        for e in entries.iter() {
            if !seen.iter().any(|k| k == &e.key) {
                seen.push(e.key.clone());
            }
        }
        seen
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Diagnostic listing: one line per unique key with mime and a short
    /// preview of the latest value.
    pub fn show_all(&self) -> String {
        let entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = vec![format!("=== Memory ({} writes) ===", entries.len())];
        let mut seen: Vec<&str> = Vec::new();
        for e in entries.iter().rev() {
            if seen.iter().any(|k| *k == e.key) {
                continue;
            }
            seen.push(&e.key);
            let preview = match &e.value {
                Stored::Text(s) => shorten(s, 60),
                Stored::Json(v) => shorten(&v.to_string(), 60),
                Stored::Binary(b) => format!("{} bytes", b.len()),
            };
            lines.push(format!("  {} ({}): {}", e.key, e.mime.label(), preview));
        }
        // Latest-first scan, but report in insertion order.
        let (head, rest) = lines.split_at(1);
        let mut rest: Vec<String> = rest.to_vec();
        rest.reverse();
        let mut out = head.to_vec();
        out.extend(rest);
        out.join("\n")
    }
}

fn shorten(s: &str, max_chars: usize) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::{KeyValueStore, Stored};
    use serde_json::json;

    #[test]
    fn latest_write_wins() {
        let store = KeyValueStore::new();
        store.set_text("k", "first");
        store.set_text("k", "second");
        assert_eq!(store.get_text("k").as_deref(), Some("second"));
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let store = KeyValueStore::new();
        assert!(store.get("nothing").is_none());
        let decoded: Option<serde_json::Value> = store.get_json("nothing").unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn keys_preserve_insertion_order_and_dedupe() {
        let store = KeyValueStore::new();
        store.set_text("a", "1");
        store.set_text("b", "2");
        store.set_text("a", "3");
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn json_round_trip() {
        let store = KeyValueStore::new();
        store.set_json("cfg", &json!({"n": 3, "name": "x"})).unwrap();
        let v: serde_json::Value = store.get_json("cfg").unwrap().unwrap();
        assert_eq!(v["n"], 3);
    }

    #[test]
    fn clear_empties_everything() {
        let store = KeyValueStore::new();
        store.set_text("a", "1");
        store.clear();
        assert!(store.keys().is_empty());
        assert!(store.get("a").is_none());
    }

    #[test]
    fn show_all_lists_unique_keys() {
        let store = KeyValueStore::new();
        store.set_text("a", "one");
        store.set_text("a", "two");
        store.set(
            "blob",
            Stored::Binary(vec![1, 2, 3]),
        );
        let listing = store.show_all();
        assert_eq!(listing.matches("  a (").count(), 1);
        assert!(listing.contains("3 bytes"));
    }
}
