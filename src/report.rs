// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Offline reporting modes (A4). Out of scope for the core filtering
//! logic, but wired into the same CLI: each mode makes a single pass
//! over the access log (reusing the line parser, C3) or the block
//! ledger (C8) and prints a summary to stdout.
//!
//! A broken stdout pipe (e.g. piping into `head`) is not an error: the
//! process exits 0, matching §6/§7.

use std::{collections::HashMap, io::Write, net::IpAddr, path::Path};

use anyhow::Result;

use crate::{classify::classify, ledger::BlockLedger, parser, tailer::Tailer};

/// Is this broken-pipe, per the "exit 0 on broken stdout" policy?
fn is_broken_pipe(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::BrokenPipe
}

/// Writes `line` to `out`, swallowing (rather than propagating) a broken
/// pipe so callers can keep iterating without special-casing it.
fn print_line(out: &mut dyn Write, line: &str) -> Result<()> {
    match writeln!(out, "{line}") {
        Ok(()) => Ok(()),
        Err(e) if is_broken_pipe(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_all_lines(log_path: impl AsRef<Path>) -> Result<Vec<String>> {
    let mut tailer = Tailer::open(log_path).await?;
    tailer.lines_once().await
}

/// Requests-per-IP, highest load first, over the whole log.
pub async fn top_talkers(log_path: impl AsRef<Path>, out: &mut dyn Write) -> Result<()> {
    let lines = read_all_lines(log_path).await?;
    let mut load: HashMap<IpAddr, u64> = HashMap::new();

    for line in &lines {
        let Some(parsed) = parser::parse_line(line) else {
            continue;
        };
        let Ok(ip) = parsed.ip.parse::<IpAddr>() else {
            continue;
        };
        let weighted = classify(&parsed);
        *load.entry(ip).or_insert(0) += weighted.weight;
    }

    let mut ranked: Vec<(IpAddr, u64)> = load.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (ip, total) in ranked {
        print_line(out, &format!("{total:>10} {ip}"))?;
    }
    Ok(())
}

/// Request-count histogram by file extension.
pub async fn ext_histogram(log_path: impl AsRef<Path>, out: &mut dyn Write) -> Result<()> {
    let lines = read_all_lines(log_path).await?;
    let mut counts: HashMap<String, u64> = HashMap::new();

    for line in &lines {
        let Some(parsed) = parser::parse_line(line) else {
            continue;
        };
        let weighted = classify(&parsed);
        let key = weighted.ext.unwrap_or_else(|| "(none)".to_string());
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (ext, count) in ranked {
        print_line(out, &format!("{count:>10} {ext}"))?;
    }
    Ok(())
}

/// Request-count histogram by HTTP status code, bucketed by hundreds
/// (2xx/3xx/4xx/5xx) - "body-size histogram" in spirit, re-purposed
/// around the fields this parser actually extracts (status, not
/// body_bytes_sent, which C3 does not carry forward).
pub async fn status_histogram(log_path: impl AsRef<Path>, out: &mut dyn Write) -> Result<()> {
    let lines = read_all_lines(log_path).await?;
    let mut counts: HashMap<String, u64> = HashMap::new();

    for line in &lines {
        let Some(parsed) = parser::parse_line(line) else {
            continue;
        };
        let bucket = parsed
            .status
            .chars()
            .next()
            .map(|c| format!("{c}xx"))
            .unwrap_or_else(|| "???".to_string());
        *counts.entry(bucket).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort();

    for (bucket, count) in ranked {
        print_line(out, &format!("{count:>10} {bucket}"))?;
    }
    Ok(())
}

/// Lines whose status indicates a server-side error (5xx), as a quick
/// triage tool.
pub async fn errors(log_path: impl AsRef<Path>, out: &mut dyn Write) -> Result<()> {
    let lines = read_all_lines(log_path).await?;
    for line in &lines {
        let Some(parsed) = parser::parse_line(line) else {
            continue;
        };
        if parsed.status.starts_with('5') {
            print_line(out, line)?;
        }
    }
    Ok(())
}

/// Currently-blocked IPs, one per line, for feeding into an external
/// Tor-exit cross-reference or similar offline tool.
pub fn tor_list(ledger_path: impl AsRef<Path>, out: &mut dyn Write) -> Result<()> {
    let records = BlockLedger::read(ledger_path);
    for record in records {
        print_line(out, &record.ip.to_string())?;
    }
    Ok(())
}

/// Currently-blocked IPs formatted as a firewall set add-list (one
/// `add <ip>` line per entry), suitable for piping into `ipset restore`
/// or an equivalent tool.
pub fn firewall_set(ledger_path: impl AsRef<Path>, set_name: &str, out: &mut dyn Write) -> Result<()> {
    let records = BlockLedger::read(ledger_path);
    for record in records {
        print_line(out, &format!("add {set_name} {}", record.ip))?;
    }
    Ok(())
}
