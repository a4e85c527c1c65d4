//! `.meta` result-bundle metadata: `key=value` lines.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Parsed or to-be-written `.meta` file contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultMeta {
    /// The request identifier this bundle belongs to.
    pub id: String,
    /// Process exit code, or the timeout/error sentinel.
    pub exit_code: i32,
    /// Wall-clock duration of the execution, in milliseconds.
    pub duration_ms: u64,
    /// Set when stdout was truncated at the output cap.
    pub truncated_out: bool,
    /// Set when stderr was truncated at the output cap.
    pub truncated_err: bool,
    /// Set when the execution hit the wall-clock timeout.
    pub timeout: bool,
}

impl ResultMeta {
    /// Serializes to the `key=value`-per-line format written to `.meta`.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "id={}", self.id);
        let _ = writeln!(out, "exit_code={}", self.exit_code);
        let _ = writeln!(out, "duration_ms={}", self.duration_ms);
        if self.truncated_out {
            let _ = writeln!(out, "truncated_out=1");
        }
        if self.truncated_err {
            let _ = writeln!(out, "truncated_err=1");
        }
        if self.timeout {
            let _ = writeln!(out, "timeout=1");
        }
        out
    }

    /// Parses the `key=value`-per-line format back into a [`ResultMeta`].
    #[must_use]
    pub fn decode(raw: &str) -> Self {
        let fields: BTreeMap<&str, &str> = raw
            .lines()
            .filter_map(|line| line.split_once('='))
            .collect();

        Self {
            id: fields.get("id").unwrap_or(&"").to_string(),
            exit_code: fields
                .get("exit_code")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            duration_ms: fields
                .get("duration_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            truncated_out: fields.get("truncated_out").copied() == Some("1"),
            truncated_err: fields.get("truncated_err").copied() == Some("1"),
            timeout: fields.get("timeout").copied() == Some("1"),
        }
    }
}

/// Sentinel exit code for a remote execution that hit the wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Sentinel exit code for a spawn/exec failure inside the sandbox.
pub const EXIT_EXEC_ERROR: i32 = 126;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let meta = ResultMeta {
            id: "cid-1".to_owned(),
            exit_code: 0,
            duration_ms: 42,
            truncated_out: true,
            truncated_err: false,
            timeout: false,
        };
        let decoded = ResultMeta::decode(&meta.encode());
        assert_eq!(decoded, meta);
    }

    #[test]
    fn omitted_flags_decode_false() {
        let meta = ResultMeta {
            id: "cid-2".to_owned(),
            exit_code: 1,
            duration_ms: 10,
            truncated_out: false,
            truncated_err: false,
            timeout: false,
        };
        let decoded = ResultMeta::decode(&meta.encode());
        assert!(!decoded.truncated_out && !decoded.truncated_err && !decoded.timeout);
    }
}
