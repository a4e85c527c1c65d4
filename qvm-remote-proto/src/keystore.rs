//! Per-domain key storage with strict filesystem permissions.
//!
//! Mirrors the teacher's `bux_oci::store::Store` shape (a root directory of
//! per-item files plus small helpers) but for 256-bit shared secrets instead
//! of OCI blobs: one `<domain>.key` file per authorised domain, directory
//! mode `0700`, file mode `0600`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::Key;
use crate::error::{Error, Result};

/// Manages per-domain key files under a single root directory.
///
/// State machine per key: `absent -> present` (install), `present -> absent`
/// (remove), `present -> present'` (rotate = remove + install). No
/// intermediate state is observable to callers.
#[derive(Debug)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Opens (creating if absent) a key store rooted at `root`, mode `0700`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io("create key store directory", e))?;
        set_dir_mode(&root, 0o700)?;
        Ok(Self { root })
    }

    fn path_for(&self, domain: &str) -> PathBuf {
        self.root.join(format!("{domain}.key"))
    }

    /// Loads `d`'s key, or `Ok(None)` if no file exists for it.
    ///
    /// Rejects keys that don't match `/^[0-9a-f]{64}$/` with
    /// [`Error::MalformedKey`] rather than silently treating them as absent.
    pub fn load(&self, domain: &str) -> Result<Option<Key>> {
        let path = self.path_for(domain);
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let trimmed = raw.trim();
                Key::parse(trimmed)
                    .map(Some)
                    .map_err(|_| Error::MalformedKey {
                        domain: domain.to_owned(),
                    })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io("read key file", e)),
        }
    }

    /// Installs `k_d`, creating the store directory if absent.
    ///
    /// Refuses to overwrite an existing key unless `replace` is set.
    pub fn install(&self, domain: &str, key: &Key, replace: bool) -> Result<()> {
        let path = self.path_for(domain);
        if !replace && path.exists() {
            return Err(Error::InvalidInput(format!(
                "a key already exists for domain {domain}; pass replace to overwrite"
            )));
        }
        fs::write(&path, key.to_hex()).map_err(|e| Error::io("write key file", e))?;
        set_file_mode(&path, 0o600)?;
        Ok(())
    }

    /// Removes `d`'s key file. A no-op if it does not exist.
    pub fn remove(&self, domain: &str) -> Result<()> {
        let path = self.path_for(domain);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("remove key file", e)),
        }
    }

    /// Enumerates `(domain, fingerprint)` pairs for every key on file.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::io("list key store", e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("list key store", e))?;
            let path = entry.path();
            let Some(domain) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|_| path.extension().is_some_and(|ext| ext == "key"))
            else {
                continue;
            };
            if let Some(key) = self.load(domain)? {
                out.push((domain.to_owned(), key.fingerprint()));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io("set key file permissions", e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io("set key store directory permissions", e))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_load_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();

        assert!(store.load("vm1").unwrap().is_none());

        let key = Key::generate();
        store.install("vm1", &key, false).unwrap();
        let loaded = store.load("vm1").unwrap().unwrap();
        assert_eq!(loaded.to_hex(), key.to_hex());

        store.remove("vm1").unwrap();
        assert!(store.load("vm1").unwrap().is_none());
    }

    #[test]
    fn install_refuses_overwrite_without_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();
        store.install("vm1", &Key::generate(), false).unwrap();
        assert!(store.install("vm1", &Key::generate(), false).is_err());
        assert!(store.install("vm1", &Key::generate(), true).is_ok());
    }

    #[test]
    fn authorize_then_list_then_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();
        store.install("vm1", &Key::generate(), false).unwrap();
        store.install("vm2", &Key::generate(), false).unwrap();

        let listed: Vec<String> = store.list().unwrap().into_iter().map(|(d, _)| d).collect();
        assert_eq!(listed, vec!["vm1".to_owned(), "vm2".to_owned()]);

        store.remove("vm1").unwrap();
        let listed: Vec<String> = store.list().unwrap().into_iter().map(|(d, _)| d).collect();
        assert_eq!(listed, vec!["vm2".to_owned()]);
    }

    #[cfg(unix)]
    #[test]
    fn permissions_are_restrictive() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();
        store.install("vm1", &Key::generate(), false).unwrap();

        let file_mode = fs::metadata(dir.path().join("keys/vm1.key"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);

        let dir_mode = fs::metadata(dir.path().join("keys"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
