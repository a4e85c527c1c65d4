//! Guest-side filesystem layout, rooted at `${HOME}/.qvm-remote/`.

use std::fs;
use std::path::{Path, PathBuf};

use qvm_remote_proto::{Error, Result};

const LEGACY_DIR_NAME: &str = ".qvmrpc";
const CURRENT_DIR_NAME: &str = ".qvm-remote";

/// Guest-side directory layout for the submitter.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Resolves the layout rooted at the user's home directory, migrating
    /// a legacy directory in place if one exists and the current one does
    /// not (§4.1 migration path).
    pub fn resolve() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            Error::InvalidInput("could not determine the user's home directory".to_owned())
        })?;
        Self::resolve_under(&home)
    }

    /// Same as [`Self::resolve`] but rooted under an explicit home
    /// directory, for tests.
    pub fn resolve_under(home: &Path) -> Result<Self> {
        let current = home.join(CURRENT_DIR_NAME);
        let legacy = home.join(LEGACY_DIR_NAME);

        if legacy.exists() && current.exists() {
            return Err(Error::InvalidInput(format!(
                "both {} and {} exist; refusing to merge, remove one manually",
                legacy.display(),
                current.display()
            )));
        }
        if legacy.exists() {
            fs::rename(&legacy, &current).map_err(|e| Error::io("migrate legacy directory", e))?;
        }

        let layout = Self { root: current };
        layout.ensure_dirs()?;
        Ok(layout)
    }

    fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.pending_dir(),
            self.running_dir(),
            self.results_dir(),
            self.history_root(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io("create queue directory", e))?;
        }
        Ok(())
    }

    /// Path to the guest's mirrored HMAC key file.
    #[must_use]
    pub fn auth_key_path(&self) -> PathBuf {
        self.root.join("auth.key")
    }

    /// Path to the guest-side audit log.
    #[must_use]
    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    /// Directory for pending `<cid>`/`<cid>.auth` pairs.
    #[must_use]
    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("queue/pending")
    }

    /// Directory for running tombstones.
    #[must_use]
    pub fn running_dir(&self) -> PathBuf {
        self.root.join("queue/running")
    }

    /// Directory for result bundles.
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("queue/results")
    }

    /// Root directory for archived history.
    #[must_use]
    pub fn history_root(&self) -> PathBuf {
        self.root.join("history")
    }

    /// Directory for one day's archived transactions (`history/YYYY-MM-DD/`).
    #[must_use]
    pub fn history_day_dir(&self, day: &str) -> PathBuf {
        self.history_root().join(day)
    }
}
