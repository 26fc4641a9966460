//! `KEY=value` conf-file parsing.

use std::collections::HashMap;
use std::path::Path;

use crate::{ConfigError, ConfigResult};

/// Parsed contents of a conf file.
///
/// Lines are `KEY=value`; blank lines and `#` comments are ignored.
/// `entries` preserves file order for callers that need it (groups).
#[derive(Debug, Default)]
pub struct ConfMap {
    values: HashMap<String, String>,
    entries: Vec<(String, String)>,
}

impl ConfMap {
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let mut values = HashMap::new();
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::MalformedLine {
                line: idx + 1,
                content: raw.to_string(),
            })?;
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            values.insert(key.clone(), value.clone());
            entries.push((key, value));
        }
        Ok(Self { values, entries })
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Integer value with a default when the key is absent.
    pub fn get_int(&self, key: &str, default: i64) -> ConfigResult<i64> {
        match self.values.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                message: format!("expected an integer, got {v:?}"),
            }),
        }
    }

    /// Comma-separated list value; absent key yields an empty list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Key/value pairs in file order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_skips_comments() {
        let conf = ConfMap::parse("# a comment\nEXECUTORS=3\n\nJOBS = a, b ,c\n").unwrap();
        assert_eq!(conf.get("EXECUTORS"), Some("3"));
        assert_eq!(conf.get_list("JOBS"), vec!["a", "b", "c"]);
        assert_eq!(conf.get("MISSING"), None);
    }

    #[test]
    fn rejects_lines_without_separator() {
        let err = ConfMap::parse("EXECUTORS\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedLine { line: 1, .. }));
    }

    #[test]
    fn typed_getters() {
        let conf = ConfMap::parse("EXECUTORS=4\nBAD=x\n").unwrap();
        assert_eq!(conf.get_int("EXECUTORS", 6).unwrap(), 4);
        assert_eq!(conf.get_int("ABSENT", 6).unwrap(), 6);
        assert!(conf.get_int("BAD", 0).is_err());
    }

    #[test]
    fn entries_preserve_order() {
        let conf = ConfMap::parse("B=2\nA=1\n").unwrap();
        let keys: Vec<_> = conf.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["B", "A"]);
    }
}
