//! Command history archiving and capped-ring pruning (§4.1 `[ADDED]`).

use std::fs;

use qvm_remote_proto::{Cid, Error, Result, ResultMeta};

use crate::layout::Layout;

/// Default number of most-recent day directories to retain under `history/`.
pub const DEFAULT_RETAIN_DAYS: usize = 30;

/// Archives one transaction's command body and result bundle under
/// `history/YYYY-MM-DD/<cid>.*`, then prunes the oldest day directories
/// beyond [`DEFAULT_RETAIN_DAYS`].
pub fn archive(
    layout: &Layout,
    cid: &Cid,
    command: Option<&[u8]>,
    stdout: &[u8],
    stderr: &[u8],
    meta: &ResultMeta,
) -> Result<()> {
    let day = qvm_remote_proto::time::iso8601_now();
    let day = &day[..10]; // YYYY-MM-DD
    let day_dir = layout.history_day_dir(day);
    fs::create_dir_all(&day_dir).map_err(|e| Error::io("create history day directory", e))?;

    if let Some(command) = command {
        fs::write(day_dir.join(cid.as_str()), command)
            .map_err(|e| Error::io("archive command body", e))?;
    }
    fs::write(day_dir.join(format!("{cid}.out")), stdout)
        .map_err(|e| Error::io("archive stdout", e))?;
    fs::write(day_dir.join(format!("{cid}.err")), stderr)
        .map_err(|e| Error::io("archive stderr", e))?;
    fs::write(day_dir.join(format!("{cid}.meta")), meta.encode())
        .map_err(|e| Error::io("archive metadata", e))?;

    prune(layout, DEFAULT_RETAIN_DAYS)
}

/// Keeps only the `retain` most-recent (lexicographically greatest, since
/// day directories are named `YYYY-MM-DD`) day directories under `history/`.
fn prune(layout: &Layout, retain: usize) -> Result<()> {
    let root = layout.history_root();
    let mut days: Vec<String> = fs::read_dir(&root)
        .map_err(|e| Error::io("list history directory", e))?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .collect();
    days.sort();

    if days.len() > retain {
        for stale in &days[..days.len() - retain] {
            let _ = fs::remove_dir_all(root.join(stale));
        }
    }
    Ok(())
}

/// Lists archived requests, most recent first, for the `history` subcommand.
pub fn list_recent(layout: &Layout, limit: usize) -> Result<Vec<String>> {
    let root = layout.history_root();
    let mut days: Vec<String> = fs::read_dir(&root)
        .map_err(|e| Error::io("list history directory", e))?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .collect();
    days.sort();
    days.reverse();

    let mut out = Vec::new();
    for day in days {
        let day_dir = root.join(&day);
        let mut cids: Vec<String> = fs::read_dir(&day_dir)
            .map_err(|e| Error::io("list history day", e))?
            .filter_map(std::result::Result::ok)
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .filter(|name| !name.contains('.'))
            .collect();
        cids.sort();
        for cid in cids {
            out.push(format!("{day}/{cid}"));
            if out.len() >= limit {
                return Ok(out);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ResultMeta {
        ResultMeta {
            id: "c1".to_owned(),
            exit_code: 0,
            duration_ms: 5,
            ..ResultMeta::default()
        }
    }

    #[test]
    fn archive_writes_bundle_under_today() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::resolve_under(dir.path()).unwrap();
        let cid = Cid::generate();
        archive(&layout, &cid, Some(b"echo hi"), b"hi\n", b"", &sample_meta()).unwrap();

        let entries: Vec<_> = fs::read_dir(layout.history_root()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn prune_keeps_only_recent_days() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::resolve_under(dir.path()).unwrap();
        for day in ["2025-01-01", "2025-01-02", "2025-01-03"] {
            fs::create_dir_all(layout.history_day_dir(day)).unwrap();
        }
        prune(&layout, 2).unwrap();

        let mut remaining: Vec<String> = fs::read_dir(layout.history_root())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["2025-01-02", "2025-01-03"]);
    }
}
