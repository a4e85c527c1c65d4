//! The executor daemon's coordinator: main loop + per-domain worker (§4.2, §5).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use qvm_remote_proto::{AuditEvent, AuditLog, EXIT_EXEC_ERROR, KeyStore, ResultMeta};
use tokio::sync::{RwLock, Semaphore};

use crate::config::Config;
use crate::guestexec::{self, GuestExec};
use crate::sandbox;

/// TTL for the per-domain running-state cache (§4.2 main loop step 2).
const RUNNING_CACHE_TTL: Duration = Duration::from_secs(15);
/// Bound on concurrently dispatched per-domain workers (§5).
const WORKER_POOL_CAP: usize = 8;

/// Caches each domain's last-observed running state for [`RUNNING_CACHE_TTL`].
#[derive(Debug, Default)]
struct RunningCache {
    entries: RwLock<std::collections::HashMap<String, (bool, Instant)>>,
}

impl RunningCache {
    async fn is_running(&self, primitive: &dyn GuestExec, domain: &str) -> bool {
        if let Some((running, at)) = self.entries.read().await.get(domain).copied()
            && at.elapsed() < RUNNING_CACHE_TTL
        {
            return running;
        }
        let running = primitive.is_running(domain).await.unwrap_or(false);
        self.entries
            .write()
            .await
            .insert(domain.to_owned(), (running, Instant::now()));
        running
    }
}

/// Owns the three long-lived shared resources (§5 shared-state graph) and
/// drives the poll loop. Lock order when more than one is held: key store >
/// running cache > audit log.
pub struct Coordinator {
    primitive: Arc<dyn GuestExec>,
    key_store: Mutex<KeyStore>,
    cache: RunningCache,
    audit: Mutex<AuditLog>,
    inflight: Mutex<HashSet<String>>,
    semaphore: Arc<Semaphore>,
}

impl Coordinator {
    /// Builds a coordinator over `primitive`, with keys from `key_store` and
    /// events appended to `audit`.
    pub fn new(primitive: Arc<dyn GuestExec>, key_store: KeyStore, audit: AuditLog) -> Self {
        Self {
            primitive,
            key_store: Mutex::new(key_store),
            cache: RunningCache::default(),
            audit: Mutex::new(audit),
            inflight: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(WORKER_POOL_CAP)),
        }
    }

    /// Performs exactly one pass over `domains` (§4.2 `--once`).
    pub async fn run_once(self: &Arc<Self>, domains: &[String], dry_run: bool, config: &Config) {
        let mut handles = Vec::with_capacity(domains.len());
        for domain in domains {
            if !self.cache.is_running(self.primitive.as_ref(), domain).await {
                continue;
            }
            {
                let mut inflight = self.inflight.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if !inflight.insert(domain.clone()) {
                    continue; // single-flight: a pass for this domain is already running
                }
            }

            let this = Arc::clone(self);
            let domain = domain.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                this.process_domain(&domain, dry_run, &config).await;
                this.inflight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&domain);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Runs indefinitely, reloading config and polling every `poll_interval`
    /// until a termination signal arrives (§4.2, §5 cancellation).
    pub async fn serve(self: &Arc<Self>, config_path: std::path::PathBuf, dry_run: bool, single_vm: Option<String>) {
        let mut reloading = match crate::config::ReloadingConfig::open(&config_path) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configuration; exiting");
                return;
            }
        };

        loop {
            let tick_start = Instant::now();
            let config = match reloading.get() {
                Ok(c) => c.clone(),
                Err(e) => {
                    tracing::error!(error = %e, "failed to reload configuration, keeping prior");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let domains: Vec<String> = match &single_vm {
                Some(d) => vec![d.clone()],
                None => config.vms.clone(),
            };
            self.run_once(&domains, dry_run, &config).await;

            let poll_interval = Duration::from_secs(config.poll_interval_secs);
            let remaining = poll_interval.saturating_sub(tick_start.elapsed());
            tokio::select! {
                () = tokio::time::sleep(remaining) => {}
                () = shutdown_signal() => {
                    tracing::info!("termination signal received, finishing in-flight work");
                    return;
                }
            }
        }
    }

    async fn process_domain(self: &Arc<Self>, domain: &str, dry_run: bool, config: &Config) {
        let key = {
            let store = self.key_store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            store.load(domain)
        };
        let key = match key {
            Ok(key) => key,
            Err(e) => {
                self.log(AuditEvent::Error {
                    cid: None,
                    domain: Some(domain),
                    reason: &e.to_string(),
                });
                return;
            }
        };

        let pending = match guestexec::list_pending(self.primitive.as_ref(), domain).await {
            Ok(mut names) => {
                names.sort();
                names
            }
            Err(e) => {
                self.log(AuditEvent::Error {
                    cid: None,
                    domain: Some(domain),
                    reason: &format!("list_pending failed: {e}"),
                });
                return;
            }
        };

        let Some(key) = key else {
            for cid in &pending {
                self.log(AuditEvent::AuthDeny { cid, domain });
            }
            return;
        };

        // Dispatch order follows the lexicographic `pending` sort above, but
        // completion is concurrent and may land out of order (§5).
        let mut handles = Vec::with_capacity(pending.len());
        for cid in pending {
            let this = Arc::clone(self);
            let domain = domain.to_owned();
            let key = key.clone();
            let config = config.clone();
            let permit = Arc::clone(&self.semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                this.process_request(&domain, &cid, &key, dry_run, &config).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn process_request(
        &self,
        domain: &str,
        cid: &str,
        key: &qvm_remote_proto::Key,
        dry_run: bool,
        config: &Config,
    ) {
        let Ok(Some(token)) = guestexec::fetch_pending_file(self.primitive.as_ref(), domain, &format!("{cid}.auth")).await
        else {
            return; // not-yet-ready: .auth sibling missing, leave it for next pass
        };
        let Ok(Some(body)) = guestexec::fetch_pending_file(self.primitive.as_ref(), domain, cid).await else {
            return; // body vanished between list and fetch
        };

        self.log(AuditEvent::Recv {
            cid,
            domain,
            bytes_in: body.len(),
        });

        if body.len() > config.max_cmd_bytes {
            self.log(AuditEvent::Error {
                cid: Some(cid),
                domain: Some(domain),
                reason: "command exceeds configured size limit",
            });
            let _ = guestexec::unlink_pending(self.primitive.as_ref(), domain, cid).await;
            return;
        }

        let presented = String::from_utf8_lossy(&token);
        if !key.verify(cid, presented.trim()) {
            self.log(AuditEvent::AuthFail { cid, domain });
            let _ = guestexec::unlink_pending(self.primitive.as_ref(), domain, cid).await;
            return;
        }
        self.log(AuditEvent::AuthOk { cid, domain });

        // At-most-once: unlink before executing.
        let _ = guestexec::unlink_pending(self.primitive.as_ref(), domain, cid).await;

        let preview = AuditEvent::sanitize_preview(&String::from_utf8_lossy(&body));
        self.log(AuditEvent::Exec {
            cid,
            domain,
            cmd_preview: &preview,
        });

        let result = if dry_run {
            sandbox::dry_run(&body)
        } else {
            let timeout = Duration::from_secs(config.exec_timeout_secs);
            match sandbox::execute(&body, timeout, config.max_out_bytes).await {
                Ok(result) => result,
                Err(e) => {
                    self.log(AuditEvent::Error {
                        cid: Some(cid),
                        domain: Some(domain),
                        reason: &e.to_string(),
                    });
                    // Sandbox itself failed to run (spawn/tempdir). The guest still
                    // needs a result bundle, not silence followed by its own timeout.
                    sandbox::SandboxResult {
                        stdout: Vec::new(),
                        stderr: e.to_string().into_bytes(),
                        exit_code: EXIT_EXEC_ERROR,
                        duration_ms: 0,
                        truncated_out: false,
                        truncated_err: false,
                        timeout: false,
                    }
                }
            }
        };

        if result.timeout {
            self.log(AuditEvent::Timeout {
                cid,
                domain,
                duration_ms: result.duration_ms,
            });
        } else {
            self.log(AuditEvent::Done {
                cid,
                domain,
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
                truncated_out: result.truncated_out,
                truncated_err: result.truncated_err,
            });
        }

        let meta = ResultMeta {
            id: cid.to_owned(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            truncated_out: result.truncated_out,
            truncated_err: result.truncated_err,
            timeout: result.timeout,
        };
        let _ = guestexec::write_result_bundle(
            self.primitive.as_ref(),
            domain,
            cid,
            &result.stdout,
            &result.stderr,
            result.exit_code,
            &meta.encode(),
        )
        .await;
    }

    fn log(&self, event: AuditEvent<'_>) {
        let audit = self.audit.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = audit.append(&event) {
            tracing::error!(error = %e, "failed to append audit log entry");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use std::fs;

    use qvm_remote_proto::Key;

    use super::*;
    use crate::guestexec::DirPrimitive;

    fn write_pending(home: &std::path::Path, cid: &str, tau: &str, body: &[u8]) {
        let pending = home.join(".qvm-remote/queue/pending");
        fs::create_dir_all(&pending).unwrap();
        fs::write(pending.join(format!("{cid}.auth")), tau).unwrap();
        fs::write(pending.join(cid), body).unwrap();
    }

    fn results_dir(home: &std::path::Path) -> std::path::PathBuf {
        home.join(".qvm-remote/queue/results")
    }

    fn new_coordinator(primitive: Arc<DirPrimitive>, audit_path: &std::path::Path) -> Arc<Coordinator> {
        let store = KeyStore::open(audit_path.parent().unwrap().join("keys")).unwrap();
        let audit = AuditLog::open(audit_path).unwrap();
        Arc::new(Coordinator::new(primitive, store, audit))
    }

    fn test_config(vms: &[&str]) -> Config {
        Config {
            vms: vms.iter().map(|s| (*s).to_owned()).collect(),
            poll_interval_secs: 1,
            exec_timeout_secs: 5,
            max_cmd_bytes: 1024 * 1024,
            max_out_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn happy_path_executes_and_writes_result() {
        let scratch = tempfile::tempdir().unwrap();
        let primitive = Arc::new(DirPrimitive::open(scratch.path().join("guests")));
        let home = primitive.domain_home("vm1");

        let coordinator = new_coordinator(Arc::clone(&primitive), &scratch.path().join("audit.log"));
        let key = Key::generate();
        coordinator
            .key_store
            .lock()
            .unwrap()
            .install("vm1", &key, false)
            .unwrap();

        let tau = key.sign("cid-1");
        write_pending(&home, "cid-1", &tau, b"echo hello");

        coordinator.run_once(&["vm1".to_owned()], false, &test_config(&["vm1"])).await;

        let results = results_dir(&home);
        assert_eq!(fs::read(results.join("cid-1.out")).unwrap(), b"hello\n");
        assert_eq!(fs::read_to_string(results.join("cid-1.exit")).unwrap(), "0");
        assert!(!home.join(".qvm-remote/queue/pending/cid-1").exists());
    }

    #[tokio::test]
    async fn auth_fail_leaves_no_result_and_unlinks_pending() {
        let scratch = tempfile::tempdir().unwrap();
        let primitive = Arc::new(DirPrimitive::open(scratch.path().join("guests")));
        let home = primitive.domain_home("vm1");

        let coordinator = new_coordinator(Arc::clone(&primitive), &scratch.path().join("audit.log"));
        let key = Key::generate();
        coordinator
            .key_store
            .lock()
            .unwrap()
            .install("vm1", &key, false)
            .unwrap();

        write_pending(&home, "cid-2", &"0".repeat(64), b"echo nope");
        coordinator.run_once(&["vm1".to_owned()], false, &test_config(&["vm1"])).await;

        assert!(!results_dir(&home).join("cid-2.exit").exists());
        assert!(!home.join(".qvm-remote/queue/pending/cid-2").exists());
        let lines = coordinator.audit.lock().unwrap().tail(10).unwrap();
        assert!(lines.iter().any(|l| l.contains("AUTH-FAIL") && l.contains("cid-2")));
    }

    #[tokio::test]
    async fn multi_domain_requests_do_not_cross_contaminate() {
        let scratch = tempfile::tempdir().unwrap();
        let primitive = Arc::new(DirPrimitive::open(scratch.path().join("guests")));
        let home1 = primitive.domain_home("vm1");
        let home2 = primitive.domain_home("vm2");

        let coordinator = new_coordinator(Arc::clone(&primitive), &scratch.path().join("audit.log"));
        let key1 = Key::generate();
        let key2 = Key::generate();
        {
            let store = coordinator.key_store.lock().unwrap();
            store.install("vm1", &key1, false).unwrap();
            store.install("vm2", &key2, false).unwrap();
        }

        write_pending(&home1, "same-cid", &key1.sign("same-cid"), b"echo from-vm1");
        write_pending(&home2, "same-cid", &key2.sign("same-cid"), b"echo from-vm2");

        coordinator
            .run_once(&["vm1".to_owned(), "vm2".to_owned()], false, &test_config(&["vm1", "vm2"]))
            .await;

        assert_eq!(fs::read(results_dir(&home1).join("same-cid.out")).unwrap(), b"from-vm1\n");
        assert_eq!(fs::read(results_dir(&home2).join("same-cid.out")).unwrap(), b"from-vm2\n");
    }

    #[tokio::test]
    async fn timeout_records_sentinel_exit_code() {
        let scratch = tempfile::tempdir().unwrap();
        let primitive = Arc::new(DirPrimitive::open(scratch.path().join("guests")));
        let home = primitive.domain_home("vm1");

        let coordinator = new_coordinator(Arc::clone(&primitive), &scratch.path().join("audit.log"));
        let key = Key::generate();
        coordinator.key_store.lock().unwrap().install("vm1", &key, false).unwrap();

        write_pending(&home, "cid-timeout", &key.sign("cid-timeout"), b"sleep 2");
        let mut config = test_config(&["vm1"]);
        config.exec_timeout_secs = 1;
        coordinator.run_once(&["vm1".to_owned()], false, &config).await;

        assert_eq!(fs::read_to_string(results_dir(&home).join("cid-timeout.exit")).unwrap(), "124");
        let meta = fs::read_to_string(results_dir(&home).join("cid-timeout.meta")).unwrap();
        assert!(meta.contains("timeout=1"));
    }

    #[tokio::test]
    async fn multiple_requests_in_one_domain_all_complete() {
        let scratch = tempfile::tempdir().unwrap();
        let primitive = Arc::new(DirPrimitive::open(scratch.path().join("guests")));
        let home = primitive.domain_home("vm1");

        let coordinator = new_coordinator(Arc::clone(&primitive), &scratch.path().join("audit.log"));
        let key = Key::generate();
        coordinator.key_store.lock().unwrap().install("vm1", &key, false).unwrap();

        for i in 0..5 {
            let cid = format!("cid-{i}");
            write_pending(&home, &cid, &key.sign(&cid), format!("echo {i}").as_bytes());
        }

        coordinator.run_once(&["vm1".to_owned()], false, &test_config(&["vm1"])).await;

        let results = results_dir(&home);
        for i in 0..5 {
            let cid = format!("cid-{i}");
            assert_eq!(fs::read(results.join(format!("{cid}.out"))).unwrap(), format!("{i}\n").into_bytes());
            assert!(!home.join(".qvm-remote/queue/pending").join(&cid).exists());
        }
    }

    #[tokio::test]
    async fn dry_run_never_invokes_shell() {
        let scratch = tempfile::tempdir().unwrap();
        let primitive = Arc::new(DirPrimitive::open(scratch.path().join("guests")));
        let home = primitive.domain_home("vm1");

        let coordinator = new_coordinator(Arc::clone(&primitive), &scratch.path().join("audit.log"));
        let key = Key::generate();
        coordinator.key_store.lock().unwrap().install("vm1", &key, false).unwrap();

        write_pending(&home, "cid-dry", &key.sign("cid-dry"), b"rm -rf /tmp/should-not-run");
        coordinator.run_once(&["vm1".to_owned()], true, &test_config(&["vm1"])).await;

        let out = fs::read_to_string(results_dir(&home).join("cid-dry.out")).unwrap();
        assert!(out.starts_with("[dry-run]"));
        assert_eq!(fs::read_to_string(results_dir(&home).join("cid-dry.exit")).unwrap(), "0");
    }
}
