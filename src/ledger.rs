// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Block Ledger (C8). Reads, expires, mutates, and atomically rewrites the
//! persisted block set shared with the HTTP server.

use std::{
    collections::BTreeSet,
    net::IpAddr,
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime, TimeZone};
use rand::Rng;
use tracing::warn;

/// `(ip, block_until_epoch, country, peak_load, annotation_text)`, spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub ip: IpAddr,
    pub block_until: i64,
    pub country: String,
    pub peak_load: u64,
    pub annotation: String,
}

const IP_WIDTH: usize = 45;
const LOAD_WIDTH: usize = 10;
const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S";

impl BlockRecord {
    fn serialize(&self) -> String {
        let ts = Local
            .timestamp_opt(self.block_until, 0)
            .single()
            .map(|dt| dt.naive_local().format(TIMESTAMP_FMT).to_string())
            .unwrap_or_default();

        format!(
            "{ip:>ip_width$} 1; # {country} {load:>load_width$} {ts} {annotation}",
            ip = self.ip,
            ip_width = IP_WIDTH,
            country = self.country,
            load = self.peak_load,
            load_width = LOAD_WIDTH,
            ts = ts,
            annotation = self.annotation,
        )
    }

    fn parse(line: &str, line_no: usize) -> Option<BlockRecord> {
        // `<ip> 1; # <country> <load> <iso8601-block_until> <annotation...>`
        // Each field may be right-padded with spaces, so tokens are taken by
        // trimming-then-splitting-at-the-next-boundary rather than a single
        // whitespace-pattern split (which would yield spurious empty tokens
        // across runs of padding spaces).
        let (ip_str, rest) = take_token(line);
        let ip: IpAddr = ip_str.parse().ok()?;

        let (marker, rest) = take_token(rest);
        if marker != "1;" {
            return None;
        }

        let rest = rest.trim_start().strip_prefix('#')?;

        let (country, rest) = take_token(rest);
        let (load_str, rest) = take_token(rest);
        let peak_load: u64 = load_str.parse().ok()?;
        let (ts_str, rest) = take_token(rest);
        let annotation = rest.trim_start().to_string();

        let naive = NaiveDateTime::parse_from_str(ts_str, TIMESTAMP_FMT).ok()?;
        let block_until = Local
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp())?;

        let _ = line_no;
        Some(BlockRecord {
            ip,
            block_until,
            country: country.to_string(),
            peak_load,
            annotation,
        })
    }
}

/// Trims leading whitespace, then splits at the next whitespace boundary.
/// Returns `(token, remainder)`; `remainder` is left untrimmed so the next
/// call absorbs however much padding separates the following field.
fn take_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

pub struct BlockLedger;

impl BlockLedger {
    /// Reads the ledger file. A missing file is an empty ledger, per the
    /// "not expected; recoverable" policy in spec §7 — a parse error on a
    /// single line is skipped with a diagnostic rather than failing the
    /// whole read.
    pub fn read(path: impl AsRef<Path>) -> Vec<BlockRecord> {
        let contents = match std::fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(error = %e, path = %path.as_ref().display(), "failed to read block ledger, treating as empty");
                return Vec::new();
            },
        };

        contents
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                if line.trim().is_empty() {
                    return None;
                }
                let parsed = BlockRecord::parse(line, idx + 1);
                if parsed.is_none() {
                    warn!(line = idx + 1, "failed to parse block ledger line, skipping");
                }
                parsed
            })
            .collect()
    }

    /// Drops records whose `block_until <= now`, per spec §3 ("purged on
    /// every read"). Materializes into a new Vec rather than mutating in
    /// place while iterating (§9 design note).
    pub fn expire(records: Vec<BlockRecord>, now: i64) -> Vec<BlockRecord> {
        records.into_iter().filter(|r| r.block_until > now).collect()
    }

    /// Inserts or overwrites the record for `record.ip`, then re-sorts by
    /// load descending, then IP, per spec §4.8.
    pub fn upsert(records: &mut Vec<BlockRecord>, record: BlockRecord) {
        records.retain(|r| r.ip != record.ip);
        records.push(record);
        records.sort_by(|a, b| {
            b.peak_load
                .cmp(&a.peak_load)
                .then_with(|| a.ip.cmp(&b.ip))
        });
    }

    /// Serializes to a sibling temp file with a random suffix, then
    /// atomically renames over `path`. Readers never observe a partial
    /// file.
    pub fn write(path: impl AsRef<Path>, records: &[BlockRecord]) -> std::io::Result<()> {
        let path = path.as_ref();
        let mut body = String::new();
        for record in records {
            body.push_str(&record.serialize());
            body.push('\n');
        }

        let tmp_path = sibling_temp_path(path);
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Current IP membership set, used for reload change-detection.
    pub fn membership(records: &[BlockRecord]) -> BTreeSet<IpAddr> {
        records.iter().map(|r| r.ip).collect()
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let suffix: u64 = rand::rng().random();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{suffix:x}"));
    path.with_file_name(name)
}
