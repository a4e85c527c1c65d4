//! Control-domain executor daemon and admin CLI for `qvm-remote`.

mod admin;
mod config;
mod coordinator;
mod guestexec;
mod sandbox;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qvm_remote_proto::{AuditLog, KeyStore};

use admin::SystemdService;
use coordinator::Coordinator;
use guestexec::QrexecPrimitive;

const DEFAULT_CONFIG_PATH: &str = "/etc/qvm-remote/remote.conf";
const DEFAULT_KEY_DIR: &str = "/etc/qvm-remote/remote.d";
const DEFAULT_AUDIT_LOG: &str = "/var/log/qvm-remote/qvm-remote.log";
const SERVICE_UNIT: &str = "qvm-remote-dom0.service";

#[derive(Parser)]
#[command(name = "qvm-remote-dom0", version, about = "Executor daemon for qvm-remote")]
struct Cli {
    /// Path to `remote.conf`.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path to the per-domain key directory.
    #[arg(long, global = true, default_value = DEFAULT_KEY_DIR)]
    key_dir: PathBuf,

    /// Path to the control-side audit log.
    #[arg(long, global = true, default_value = DEFAULT_AUDIT_LOG)]
    audit_log: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,

    /// Perform exactly one pass over all domains and exit.
    #[arg(long)]
    once: bool,

    /// Print what would execute and synthesise results without invoking the shell.
    #[arg(long)]
    dry_run: bool,

    /// Serve only this domain, ignoring the configured set.
    #[arg(long)]
    vm: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Install `k_d` for a domain.
    Authorize {
        /// Domain name.
        domain: String,
        /// 64-character lowercase hex key.
        hex: String,
        /// Overwrite an existing key.
        #[arg(long)]
        replace: bool,
    },
    /// Remove `k_d` for a domain.
    Revoke {
        /// Domain name.
        domain: String,
    },
    /// List the currently authorised domains.
    Keys,
    /// Enable the daemon at boot.
    Enable {
        /// Bypass the interactive confirmation phrase.
        #[arg(long)]
        yes: bool,
    },
    /// Disable the daemon at boot.
    Disable {
        /// Bypass the interactive confirmation phrase.
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Authorize { domain, hex, replace }) => {
            let store = KeyStore::open(&cli.key_dir).context("opening key store")?;
            admin::authorize(&store, &domain, &hex, replace)
        }
        Some(Command::Revoke { domain }) => {
            let store = KeyStore::open(&cli.key_dir).context("opening key store")?;
            admin::revoke(&store, &domain)
        }
        Some(Command::Keys) => {
            let store = KeyStore::open(&cli.key_dir).context("opening key store")?;
            admin::list_keys(&store)
        }
        Some(Command::Enable { yes }) => {
            let service = SystemdService {
                unit: SERVICE_UNIT.to_owned(),
            };
            admin::enable(&service, yes)
        }
        Some(Command::Disable { yes }) => {
            let service = SystemdService {
                unit: SERVICE_UNIT.to_owned(),
            };
            admin::disable(&service, yes)
        }
        None => serve(cli),
    }
}

fn serve(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    runtime.block_on(async move {
        let store = KeyStore::open(&cli.key_dir).context("opening key store")?;
        let audit = AuditLog::open(&cli.audit_log).context("opening audit log")?;
        let primitive = Arc::new(QrexecPrimitive::default());
        let coordinator = Arc::new(Coordinator::new(primitive, store, audit));

        if cli.once {
            let config = config::Config::load(&cli.config).context("loading configuration")?;
            let domains = cli.vm.map_or_else(|| config.vms.clone(), |d| vec![d]);
            coordinator.run_once(&domains, cli.dry_run, &config).await;
        } else {
            coordinator.serve(cli.config, cli.dry_run, cli.vm).await;
        }
        Ok(())
    })
}
