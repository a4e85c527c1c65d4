//! Control-side configuration: `remote.conf` plus mtime-based reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use qvm_remote_proto::{Config as RawConfig, Error, Result};

const KNOWN_KEYS: &[&str] = &[
    "QVM_REMOTE_VMS",
    "QVM_REMOTE_POLL_INTERVAL",
    "QVM_REMOTE_EXEC_TIMEOUT",
    "QVM_REMOTE_MAX_CMD_BYTES",
    "QVM_REMOTE_MAX_OUT_BYTES",
];

/// Parsed `remote.conf` (§6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Authorised domain names (§3).
    pub vms: Vec<String>,
    /// Poll interval, seconds (default 1).
    pub poll_interval_secs: u64,
    /// Execution wall-clock timeout, seconds (default 300).
    pub exec_timeout_secs: u64,
    /// Maximum command body size, bytes (default 1 MiB).
    pub max_cmd_bytes: usize,
    /// Maximum captured output size per stream, bytes (default 10 MiB).
    pub max_out_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vms: Vec::new(),
            poll_interval_secs: 1,
            exec_timeout_secs: 300,
            max_cmd_bytes: 1024 * 1024,
            max_out_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    fn from_raw(raw: &RawConfig) -> Self {
        let defaults = Self::default();
        for unknown in raw.unknown_keys(KNOWN_KEYS) {
            tracing::warn!(key = unknown, "ignoring unrecognised config key");
        }
        Self {
            vms: raw
                .get("QVM_REMOTE_VMS")
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
            poll_interval_secs: raw.get_or("QVM_REMOTE_POLL_INTERVAL", defaults.poll_interval_secs),
            exec_timeout_secs: raw.get_or("QVM_REMOTE_EXEC_TIMEOUT", defaults.exec_timeout_secs),
            max_cmd_bytes: raw.get_or("QVM_REMOTE_MAX_CMD_BYTES", defaults.max_cmd_bytes),
            max_out_bytes: raw.get_or("QVM_REMOTE_MAX_OUT_BYTES", defaults.max_out_bytes),
        }
    }

    /// Loads configuration from `path`, defaulting an absent file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::io("read config file", e)),
        };
        Ok(Self::from_raw(&RawConfig::parse(&raw)))
    }
}

/// Reloads [`Config`] from disk only when the file's mtime has advanced
/// (§4.2 main loop step 1).
#[derive(Debug)]
pub struct ReloadingConfig {
    path: PathBuf,
    mtime: Option<SystemTime>,
    current: Config,
}

impl ReloadingConfig {
    /// Loads the initial configuration from `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = Config::load(&path)?;
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(Self { path, mtime, current })
    }

    /// Returns the current configuration, reloading first if the file on
    /// disk has changed since the last load.
    pub fn get(&mut self) -> Result<&Config> {
        let latest_mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if latest_mtime != self.mtime {
            self.current = Config::load(&self.path)?;
            self.mtime = latest_mtime;
        }
        Ok(&self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("remote.conf")).unwrap();
        assert!(config.vms.is_empty());
        assert_eq!(config.poll_interval_secs, 1);
    }

    #[test]
    fn parses_recognised_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.conf");
        fs::write(&path, "QVM_REMOTE_VMS=vm1 vm2\nQVM_REMOTE_EXEC_TIMEOUT=60\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.exec_timeout_secs, 60);
    }

    #[test]
    fn reload_picks_up_mtime_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.conf");
        fs::write(&path, "QVM_REMOTE_VMS=vm1\n").unwrap();
        let mut reloading = ReloadingConfig::open(&path).unwrap();
        assert_eq!(reloading.get().unwrap().vms, vec!["vm1".to_owned()]);

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&path, "QVM_REMOTE_VMS=vm1 vm2\n").unwrap();
        assert_eq!(
            reloading.get().unwrap().vms,
            vec!["vm1".to_owned(), "vm2".to_owned()]
        );
    }
}
