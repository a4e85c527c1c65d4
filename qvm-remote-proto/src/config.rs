//! Shared `KEY=VALUE` config-file parsing for `remote.conf`.

use std::collections::BTreeMap;

/// A parsed config file: comments (`#`) and blank lines ignored, unknown
/// keys retained so the caller can warn rather than silently drop them.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    /// Parses `raw` line by line. Malformed lines (no `=`) are skipped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }
        Self { values }
    }

    /// Returns the raw string value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns `key` parsed as `T`, or `default` if absent or unparsable.
    #[must_use]
    pub fn get_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Returns `key` split on commas into a list of trimmed, non-empty
    /// entries (used for `QVM_REMOTE_VMS`).
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys present in the file but not in `known` — the caller should log
    /// a warning per entry and otherwise ignore them.
    #[must_use]
    pub fn unknown_keys<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        self.values
            .keys()
            .map(String::as_str)
            .filter(|k| !known.contains(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_and_ignores_comments() {
        let raw = "\
# comment
QVM_REMOTE_VMS = vm1, vm2 ,vm3
QVM_REMOTE_POLL_INTERVAL=2

QVM_REMOTE_WEIRD=unused
";
        let cfg = Config::parse(raw);
        assert_eq!(cfg.get_list("QVM_REMOTE_VMS"), vec!["vm1", "vm2", "vm3"]);
        assert_eq!(cfg.get_or("QVM_REMOTE_POLL_INTERVAL", 1u64), 2);
        assert_eq!(
            cfg.unknown_keys(&["QVM_REMOTE_VMS", "QVM_REMOTE_POLL_INTERVAL"]),
            vec!["QVM_REMOTE_WEIRD"]
        );
    }

    #[test]
    fn missing_keys_fall_back_to_default() {
        let cfg = Config::parse("");
        assert_eq!(cfg.get_or("QVM_REMOTE_EXEC_TIMEOUT", 300u64), 300);
        assert!(cfg.get_list("QVM_REMOTE_VMS").is_empty());
    }
}
