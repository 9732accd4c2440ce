//! The pool of interchangeable API keys.
//!
//! Keys are parsed once from a delimited configuration string and never
//! change for the lifetime of the process.

use crate::error::{RelayError, Result};
use std::fmt;

/// An ordered, fixed, non-empty list of API keys.
#[derive(Clone)]
pub struct KeyPool {
    keys: Vec<String>,
}

impl KeyPool {
    /// Parse a pool from a comma- or newline-separated list.
    ///
    /// Entries are trimmed and empty entries dropped. Fails with
    /// [`RelayError::MissingApiKeys`] when nothing usable remains.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let keys: Vec<String> = raw
            .unwrap_or_default()
            .split([',', '\n'])
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        Self::new(keys)
    }

    /// Build a pool from already-split keys.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(RelayError::MissingApiKeys);
        }
        Ok(Self { keys })
    }

    /// Number of keys in the pool.
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// Key at position `index`, reduced modulo the pool size.
    pub fn at(&self, index: usize) -> &str {
        &self.keys[self.normalize(index)]
    }

    /// Bring an index from the store into `[0, size)`.
    ///
    /// A stored index can be out of range when the pool shrank between
    /// deployments.
    pub fn normalize(&self, index: usize) -> usize {
        index % self.keys.len()
    }

    /// The position after `index`, wrapping to the start.
    pub fn next(&self, index: usize) -> usize {
        (self.normalize(index) + 1) % self.keys.len()
    }

    /// A log-safe rendering of the key at `index`.
    pub fn masked(&self, index: usize) -> String {
        mask(self.at(index))
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.keys.iter().map(|k| mask(k)).collect::<Vec<_>>())
            .finish()
    }
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_and_drops_empty() {
        let pool = KeyPool::parse(Some(" key-a , key-b,,\nkey-c \n")).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.at(0), "key-a");
        assert_eq!(pool.at(1), "key-b");
        assert_eq!(pool.at(2), "key-c");
    }

    #[test]
    fn test_parse_rejects_missing_or_blank() {
        assert!(matches!(
            KeyPool::parse(None),
            Err(RelayError::MissingApiKeys)
        ));
        assert!(matches!(
            KeyPool::parse(Some("")),
            Err(RelayError::MissingApiKeys)
        ));
        assert!(matches!(
            KeyPool::parse(Some(" , ,\n")),
            Err(RelayError::MissingApiKeys)
        ));
    }

    #[test]
    fn test_next_wraps_for_every_size() {
        for size in 1..=7 {
            let keys = (0..size).map(|i| format!("key-{i}")).collect();
            let pool = KeyPool::new(keys).unwrap();
            for index in 0..size {
                assert_eq!(pool.next(index), (index + 1) % size);
            }
        }
    }

    #[test]
    fn test_out_of_range_index_is_normalized() {
        let pool = KeyPool::parse(Some("a,b")).unwrap();
        assert_eq!(pool.normalize(5), 1);
        assert_eq!(pool.at(4), "a");
    }

    #[test]
    fn test_debug_masks_keys() {
        let pool = KeyPool::parse(Some("AIzaSyDUMMY-secret-1234,short")).unwrap();
        let rendered = format!("{pool:?}");
        assert!(!rendered.contains("AIzaSyDUMMY"));
        assert!(rendered.contains("****1234"));
        assert_eq!(pool.masked(1), "****");
    }
}
