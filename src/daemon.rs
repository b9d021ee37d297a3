// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Daemon Loop (C10). Composes the tailer (C2), line parser (C3), weight
//! classifier (C4), and minute batcher (C5); on every flush boundary,
//! drives the threshold resolver (C6), FCrDNS verifier (C7), block ledger
//! (C8), and reload signaler (C9).

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    batch::{BatchState, Batcher},
    error::DaemonError,
    fcrdns::{self, build_resolver},
    ledger::{BlockLedger, BlockRecord},
    parser,
    policy::Policy,
    reload::ReloadSignaler,
    tailer::{Tailer, send_signal},
};

/// The production access-log path the daemon insists on by default; a
/// `--log` pointing anywhere else is refused at startup (§4.10's
/// reprocessing guard), unless explicitly permitted by the caller of
/// [`run_daemon_inner`].
pub const CANONICAL_LOG_PATH: &str = "/var/log/nginx/access.log";

const POLICY_FILENAME: &str = "autofilter.conf";
const VAR_DIRNAME: &str = "var";
const BLOCK_FILENAME: &str = "bot.conf";
const PIDFILE_NAME: &str = "httpd.pid";

const FCRDNS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DaemonArgs {
    pub log_path: PathBuf,
    pub root: PathBuf,
}

impl DaemonArgs {
    fn policy_path(&self) -> PathBuf {
        self.root.join(POLICY_FILENAME)
    }

    fn var_dir(&self) -> PathBuf {
        self.root.join(VAR_DIRNAME)
    }

    fn ledger_path(&self) -> PathBuf {
        self.var_dir().join(BLOCK_FILENAME)
    }

    fn pidfile_path(&self) -> PathBuf {
        self.var_dir().join(PIDFILE_NAME)
    }
}

/// Entry point used by `main`: enforces the canonical-log-path guard.
pub async fn run_daemon(args: DaemonArgs, cancel: CancellationToken) -> Result<()> {
    run_daemon_inner(args, &cancel, true).await
}

/// Testable inner loop. `require_canonical` exists so integration tests
/// can point at a temp-directory log file without tripping the startup
/// guard; production always calls through [`run_daemon`] with it `true`.
pub async fn run_daemon_inner(
    args: DaemonArgs,
    cancel: &CancellationToken,
    require_canonical: bool,
) -> Result<()> {
    if require_canonical && args.log_path != Path::new(CANONICAL_LOG_PATH) {
        return Err(DaemonError::NonCanonicalLogPath {
            configured: args.log_path.display().to_string(),
            canonical: CANONICAL_LOG_PATH.to_string(),
        }
        .into());
    }

    std::fs::create_dir_all(args.var_dir())
        .with_context(|| format!("failed to create working directory {:?}", args.var_dir()))?;

    let policy = Policy::load(args.policy_path())
        .with_context(|| format!("failed to load policy file {:?}", args.policy_path()))?;
    let resolver = build_resolver(policy.resolver, FCRDNS_TIMEOUT);

    let mut tailer = Tailer::open(&args.log_path)
        .await
        .with_context(|| format!("failed to open log file {:?}", args.log_path))?;
    let identity = tailer.identity().await?;
    let reopen_pid = read_pid(&args.pidfile_path());

    let mut batcher = Batcher::new();
    let ledger_path = args.ledger_path();
    let pidfile = args.pidfile_path();
    let mut reload = ReloadSignaler::new();

    info!(log = %args.log_path.display(), root = %args.root.display(), "autofilter daemon starting");

    tailer
        .tail(identity, reopen_pid, cancel, |line| {
            let parsed = parser::parse_line(&line);
            let flushed = match parsed {
                Some(parsed) => batcher.push(&parsed),
                None => {
                    warn!(%line, "unparsable log line, skipping");
                    None
                },
            };
            let policy = &policy;
            let resolver = &resolver;
            let ledger_path = &ledger_path;
            let pidfile = &pidfile;
            let reload = &mut reload;
            async move {
                if let Some((minute, batch)) = flushed {
                    flush(policy, resolver, ledger_path, pidfile, reload, &minute, batch).await;
                }
            }
        })
        .await?;

    // Clean shutdown: flush whatever was accumulated in the still-open
    // minute bucket before returning. No new flush may start afterward.
    if let Some((minute, batch)) = batcher.take_remaining() {
        flush(&policy, &resolver, &ledger_path, &pidfile, &mut reload, &minute, batch).await;
    }

    info!("autofilter daemon stopped");
    Ok(())
}

/// The flush algorithm (§4.10): read-expire-mutate-write-signal-clear.
/// The "clear" step is the caller's: `batch` is owned here and dropped
/// at the end of this call.
async fn flush(
    policy: &Policy,
    resolver: &fcrdns::AsyncResolver,
    ledger_path: &Path,
    pidfile: &Path,
    reload: &mut ReloadSignaler,
    minute: &str,
    batch: BatchState,
) {
    let now = now_epoch();
    let mut records = BlockLedger::expire(BlockLedger::read(ledger_path), now);

    for (ip_str, &load) in &batch.load {
        let ip: IpAddr = match ip_str.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(ip = %ip_str, "unparsable IP in batch, skipping");
                continue;
            },
        };
        let country = batch.country.get(ip_str).map(String::as_str).unwrap_or("");
        let user_agent = batch.user_agent.get(ip_str).map(String::as_str).unwrap_or("");

        let limit = policy.resolve_limit(ip, country);
        if load <= limit {
            continue;
        }

        let annotation = match fcrdns::verify(resolver, ip).await {
            Ok(domain) => {
                if fcrdns::is_whitelisted(&domain) {
                    info!(%ip, %domain, minute, "verified crawler, not blocking");
                    continue;
                }
                format!("{domain} | {user_agent}")
            },
            Err(e) => format!("error: {e} | {user_agent}"),
        };

        let block_until = now + policy.resolve_block_duration(ip, country).as_secs() as i64;
        let record = BlockRecord {
            ip,
            block_until,
            country: country.to_string(),
            peak_load: load,
            annotation,
        };
        warn!(%ip, load, limit, minute, "threshold exceeded, blocking");
        BlockLedger::upsert(&mut records, record);
    }

    if let Err(e) = BlockLedger::write(ledger_path, &records) {
        warn!(error = %e, path = %ledger_path.display(), "failed to write block ledger, will retry next flush");
        return;
    }

    let membership = BlockLedger::membership(&records);
    reload.maybe_signal(&membership, pidfile, now);
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn read_pid(pidfile: &Path) -> Option<i32> {
    std::fs::read_to_string(pidfile).ok()?.trim().parse().ok()
}

/// Re-exported so `main` can deliver an equivalent signal manually
/// (e.g. from a `--reopen`/`--reload` admin mode), sharing the tailer's
/// send primitive rather than duplicating `nix::sys::signal::kill`.
pub fn deliver_signal(pid: i32, signal: Signal) {
    send_signal(pid, signal);
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_file(path: &Path, contents: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn rejects_noncanonical_log_without_override() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.log");
        write_file(&log_path, "");

        let args = DaemonArgs {
            log_path,
            root: dir.path().to_path_buf(),
        };
        let cancel = CancellationToken::new();
        let err = run_daemon_inner(args, &cancel, true).await.unwrap_err();
        assert!(err.downcast_ref::<DaemonError>().is_some());
    }

    #[tokio::test]
    async fn shuts_down_cleanly_on_precancelled_token() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.log");
        write_file(&log_path, "");
        write_file(
            &dir.path().join(POLICY_FILENAME),
            "limit ALL 600\nblock ALL 1h\n",
        );

        let args = DaemonArgs {
            log_path,
            root: dir.path().to_path_buf(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_daemon_inner(args, &cancel, false).await;
        assert!(result.is_ok());
    }

    #[test]
    fn flush_paths_are_rooted_under_var() {
        let args = DaemonArgs {
            log_path: PathBuf::from("/x/access.log"),
            root: PathBuf::from("/srv/autofilter"),
        };
        assert_eq!(
            args.ledger_path(),
            PathBuf::from("/srv/autofilter/var/bot.conf")
        );
        assert_eq!(
            args.policy_path(),
            PathBuf::from("/srv/autofilter/autofilter.conf")
        );
    }
}
