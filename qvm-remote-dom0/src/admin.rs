//! Administrative subcommands: `authorize`, `revoke`, `keys`, `enable`,
//! `disable` (§4.2).

use std::io::{self, Write as _};

use anyhow::{Context, Result, bail};
use qvm_remote_proto::{Key, KeyStore};

/// `authorize <d> <hex>` — installs `k_d` with the correct permissions.
pub fn authorize(store: &KeyStore, domain: &str, hex: &str, replace: bool) -> Result<()> {
    let key = Key::parse(hex).context("parsing key material")?;
    store
        .install(domain, &key, replace)
        .context("installing key")?;
    println!("authorized {domain} ({})", key.fingerprint());
    Ok(())
}

/// `revoke <d>` — removes `k_d`.
pub fn revoke(store: &KeyStore, domain: &str) -> Result<()> {
    store.remove(domain).context("removing key")?;
    println!("revoked {domain}");
    Ok(())
}

/// `keys` — lists the current set as `(domain, fingerprint)` pairs.
pub fn list_keys(store: &KeyStore) -> Result<()> {
    for (domain, fingerprint) in store.list().context("listing keys")? {
        println!("{domain}\t{fingerprint}");
    }
    Ok(())
}

const ENABLE_CONFIRMATION: &str = "enable qvm-remote-dom0";

/// `enable [--yes]` — toggles the platform service manager unit on, behind
/// an interactive confirmation phrase unless `--yes` bypasses it.
pub fn enable(service: &dyn ServiceManager, assume_yes: bool) -> Result<()> {
    if !assume_yes {
        print!("type \"{ENABLE_CONFIRMATION}\" to enable the daemon at boot: ");
        io::stdout().flush().ok();
        let mut answer = String::new();
        io::stdin().read_line(&mut answer).context("reading confirmation")?;
        if answer.trim() != ENABLE_CONFIRMATION {
            bail!("confirmation did not match; aborting");
        }
    }
    service.enable().context("enabling service")?;
    println!("enabled");
    Ok(())
}

/// `disable [--yes]` — toggles the platform service manager unit off.
pub fn disable(service: &dyn ServiceManager, assume_yes: bool) -> Result<()> {
    if !assume_yes {
        print!("disable qvm-remote-dom0 at boot? [y/N] ");
        io::stdout().flush().ok();
        let mut answer = String::new();
        io::stdin().read_line(&mut answer).context("reading confirmation")?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            bail!("aborted");
        }
    }
    service.disable().context("disabling service")?;
    println!("disabled");
    Ok(())
}

/// Abstraction over the platform service manager, so `enable`/`disable` are
/// testable without touching a real init system.
pub trait ServiceManager {
    /// Brings the unit up at boot.
    fn enable(&self) -> io::Result<()>;
    /// Prevents the unit from starting at boot.
    fn disable(&self) -> io::Result<()>;
}

/// Shells out to `systemctl`, the common case on the control domain.
#[derive(Debug, Default)]
pub struct SystemdService {
    /// Unit name to toggle.
    pub unit: String,
}

impl ServiceManager for SystemdService {
    fn enable(&self) -> io::Result<()> {
        let status = std::process::Command::new("systemctl")
            .args(["enable", "--now", &self.unit])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("systemctl enable exited with {status}")))
        }
    }

    fn disable(&self) -> io::Result<()> {
        let status = std::process::Command::new("systemctl")
            .args(["disable", "--now", &self.unit])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("systemctl disable exited with {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeService {
        enabled: Cell<bool>,
    }

    impl ServiceManager for FakeService {
        fn enable(&self) -> io::Result<()> {
            self.enabled.set(true);
            Ok(())
        }
        fn disable(&self) -> io::Result<()> {
            self.enabled.set(false);
            Ok(())
        }
    }

    #[test]
    fn authorize_then_list_then_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let key = Key::generate();
        authorize(&store, "vm1", &key.to_hex(), false).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        revoke(&store, "vm1").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn enable_with_yes_bypasses_confirmation() {
        let service = FakeService {
            enabled: Cell::new(false),
        };
        enable(&service, true).unwrap();
        assert!(service.enabled.get());
    }
}
