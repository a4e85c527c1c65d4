//! Guest-resident submitter CLI for `qvm-remote`.

mod history;
mod layout;
mod submit;

use std::io::{self, IsTerminal, Read, Write as _};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use qvm_remote_proto::{AuditLog, Key};

use layout::Layout;

#[derive(Parser)]
#[command(name = "qvm-remote", version, about = "Submit a command to the control domain")]
struct Cli {
    /// Seconds to wait for a result before giving up.
    #[arg(long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Command and arguments to run remotely (bare invocation).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    trailing: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the guest's mirrored shared secret.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Round-trip a trivial remote command.
    Ping,
    /// Print the tail of the guest audit log.
    Log {
        /// Number of lines to print.
        #[arg(default_value_t = 20)]
        n: usize,
    },
    /// List recently archived transactions.
    History,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Generate a new key (must then be authorised on the control side).
    Gen,
    /// Print the current key's hex encoding.
    Show,
    /// Import a key supplied out-of-band by the administrator.
    Import {
        /// 64-character lowercase hex key.
        hex: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("qvm-remote: {e:#}");
            let code = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<qvm_remote_proto::Error>())
                .map_or(5, qvm_remote_proto::Error::exit_code);
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let layout = Layout::resolve().context("resolving guest queue layout")?;

    match cli.command {
        Some(Command::Key { action }) => key_action(&layout, action),
        Some(Command::Ping) => ping(&layout, cli.timeout),
        Some(Command::Log { n }) => print_log(&layout, n),
        Some(Command::History) => print_history(&layout),
        None => submit_bare(&layout, cli.trailing, cli.timeout),
    }
}

fn key_action(layout: &Layout, action: KeyAction) -> Result<i32> {
    match action {
        KeyAction::Gen => {
            let key = Key::generate();
            install_key(layout, &key)?;
            println!("{}", key.to_hex());
            Ok(0)
        }
        KeyAction::Show => {
            let key = load_key(layout)?;
            println!("{}", key.to_hex());
            Ok(0)
        }
        KeyAction::Import { hex } => {
            let key = Key::parse(&hex).context("parsing imported key")?;
            install_key(layout, &key)?;
            println!("{}", key.to_hex());
            Ok(0)
        }
    }
}

fn install_key(layout: &Layout, key: &Key) -> Result<()> {
    let path = layout.auth_key_path();
    std::fs::write(&path, key.to_hex()).context("writing key file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("setting key file permissions")?;
    }
    Ok(())
}

fn load_key(layout: &Layout) -> Result<Key> {
    let raw = match std::fs::read_to_string(layout.auth_key_path()) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(qvm_remote_proto::Error::NoKey {
                domain: "local".to_owned(),
            })
            .context("no key found; run `qvm-remote key gen` and have it authorised");
        }
        Err(e) => return Err(qvm_remote_proto::Error::io("read key file", e).into()),
    };
    Key::parse(raw.trim()).map_err(|_| qvm_remote_proto::Error::MalformedKey {
        domain: "local".to_owned(),
    })
    .context("key file is malformed")
}

fn ping(layout: &Layout, timeout: Option<u64>) -> Result<i32> {
    let key = load_key(layout)?;
    let timeout = Duration::from_secs(timeout.unwrap_or(submit::DEFAULT_TIMEOUT_SECS));
    let outcome = submit::submit(layout, &key, b"true", timeout)?;
    if outcome.exit_code == 0 {
        println!("pong");
    }
    Ok(outcome.exit_code)
}

fn print_log(layout: &Layout, n: usize) -> Result<i32> {
    let log = AuditLog::open(layout.audit_log_path()).context("opening audit log")?;
    for line in log.tail(n).context("reading audit log")? {
        println!("{line}");
    }
    Ok(0)
}

fn print_history(layout: &Layout) -> Result<i32> {
    for entry in history::list_recent(layout, 100).context("listing history")? {
        println!("{entry}");
    }
    Ok(0)
}

fn submit_bare(layout: &Layout, trailing: Vec<String>, timeout: Option<u64>) -> Result<i32> {
    let command = read_command(trailing)?;
    let key = load_key(layout)?;
    let timeout_secs = timeout
        .or_else(|| std::env::var("QVM_REMOTE_TIMEOUT").ok()?.parse().ok())
        .unwrap_or(submit::DEFAULT_TIMEOUT_SECS);

    let outcome = submit::submit(layout, &key, &command, Duration::from_secs(timeout_secs))?;

    io::stdout()
        .write_all(&outcome.stdout)
        .context("writing stdout")?;
    io::stderr()
        .write_all(&outcome.stderr)
        .context("writing stderr")?;
    Ok(outcome.exit_code)
}

fn read_command(trailing: Vec<String>) -> Result<Vec<u8>> {
    if !trailing.is_empty() {
        return Ok(trailing.join(" ").into_bytes());
    }
    if io::stdin().is_terminal() {
        bail!("no command given and stdin is a terminal");
    }
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .context("reading command from stdin")?;
    Ok(buf)
}
