// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end scenario tests over the public surface of the streaming
//! classifier (C3-C6, C8): a log line is parsed, weighted, batched into a
//! minute bucket, and the finished bucket is run through the threshold
//! cascade and block ledger exactly as the daemon loop's `flush()` does,
//! minus the FCrDNS step (DNS scenarios 2/3 from spec §8 need a live or
//! mocked resolver and are not exercised here; see DESIGN.md).

use std::net::IpAddr;

use autofilter::{
    batch::Batcher,
    ledger::{BlockLedger, BlockRecord},
    parser,
    policy::Policy,
};

fn access_log_line(ts: &str, country: &str, ip: &str, method: &str, uri: &str, status: &str) -> String {
    format!(
        "{ts}\t{country}\t{ip}\thttps\texample.com\t{method}\t\"{uri}\"\t{status}\t512\t\"-\"\t\"ua-string\""
    )
}

fn write_policy(contents: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

/// Drives one finished minute bucket through the same
/// resolve-threshold/ledger-upsert sequence `daemon::flush` uses, skipping
/// FCrDNS (treating every breach as unverified, i.e. always blocked).
fn apply_breaches(policy: &Policy, records: &mut Vec<BlockRecord>, now: i64, batch: &autofilter::batch::BatchState) {
    for (ip_str, &load) in &batch.load {
        let ip: IpAddr = ip_str.parse().unwrap();
        let country = batch.country.get(ip_str).cloned().unwrap_or_default();
        let limit = policy.resolve_limit(ip, &country);
        if load <= limit {
            continue;
        }
        let block_until = now + policy.resolve_block_duration(ip, &country).as_secs() as i64;
        BlockLedger::upsert(
            records,
            BlockRecord {
                ip,
                block_until,
                country,
                peak_load: load,
                annotation: format!("error: skipped fcrdns in test | {}", batch.user_agent.get(ip_str).cloned().unwrap_or_default()),
            },
        );
    }
}

#[test]
fn scenario_cascade_cidr_then_country_then_all() {
    // Policy `limit 10.0.0.0/8 100; limit CN 200; limit ALL 600`.
    let policy_file = write_policy("limit 10.0.0.0/8 100\nlimit CN 200\nlimit ALL 600\n");
    let policy = Policy::load(policy_file.path()).unwrap();

    // 10.1.2.3/CN at load 150 breaches the CIDR limit of 100.
    let cidr_ip: IpAddr = "10.1.2.3".parse().unwrap();
    assert!(150 > policy.resolve_limit(cidr_ip, "CN"));

    // 8.8.8.8/CN at load 150 stays under the country limit of 200.
    let country_ip: IpAddr = "8.8.8.8".parse().unwrap();
    assert!(150 <= policy.resolve_limit(country_ip, "CN"));
}

#[test]
fn scenario_minute_boundary_flushes_between_lines_and_clears_state() {
    let policy_file = write_policy("limit ALL 600\nblock ALL 1h\n");
    let policy = Policy::load(policy_file.path()).unwrap();

    let mut batcher = Batcher::new();
    let mut records: Vec<BlockRecord> = Vec::new();
    let now = 1_700_000_000i64;

    // 700 POST requests worth of load (weight 30 each) land in the first
    // minute; one more line at :01:00 must trigger a flush of the first
    // bucket before being folded into a fresh, empty one.
    let mut flush_count = 0;
    for _ in 0..24 {
        let line = access_log_line(
            "2024-01-01T00:00:59",
            "US",
            "198.51.100.9",
            "POST",
            "/submit",
            "200",
        );
        let parsed = parser::parse_line(&line).unwrap();
        if let Some((minute, batch)) = batcher.push(&parsed) {
            flush_count += 1;
            assert_eq!(minute, "2024-01-01T00:00");
            apply_breaches(&policy, &mut records, now, &batch);
        }
    }
    assert_eq!(flush_count, 0, "still inside the same minute");

    let boundary_line = access_log_line(
        "2024-01-01T00:01:00",
        "US",
        "198.51.100.9",
        "GET",
        "/",
        "200",
    );
    let parsed = parser::parse_line(&boundary_line).unwrap();
    let (minute, batch) = batcher.push(&parsed).expect("minute boundary crossed");
    assert_eq!(minute, "2024-01-01T00:00");
    // 24 POSTs * weight 30 = 720, over the 600 ceiling.
    assert_eq!(*batch.load.get("198.51.100.9").unwrap(), 720);
    apply_breaches(&policy, &mut records, now, &batch);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].ip.to_string(), "198.51.100.9");
    assert!(records[0].block_until > now);

    // The new bucket (opened by the boundary line itself) must not carry
    // over any load from the flushed one.
    let (_, remaining) = batcher.take_remaining().unwrap();
    assert_eq!(*remaining.load.get("198.51.100.9").unwrap(), 10);
}

#[test]
fn scenario_expiry_drops_stale_record_but_rebreach_gets_a_fresh_one() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("bot.conf");

    let stale = BlockRecord {
        ip: "203.0.113.50".parse().unwrap(),
        block_until: 1_000, // long past "now" below
        country: "US".into(),
        peak_load: 999,
        annotation: "old block | ua".into(),
    };
    BlockLedger::write(&ledger_path, &[stale]).unwrap();

    let now = 2_000_000_000i64;
    let mut records = BlockLedger::expire(BlockLedger::read(&ledger_path), now);
    assert!(records.is_empty(), "expired record must be purged");

    // Same IP re-breaches this minute: a fresh record with block_until in
    // the future must be written, independent of the purged one.
    let policy_file = write_policy("limit ALL 600\nblock ALL 1h\n");
    let policy = Policy::load(policy_file.path()).unwrap();
    let mut batch = autofilter::batch::BatchState::default();
    batch.load.insert("203.0.113.50".to_string(), 1000);
    batch.country.insert("203.0.113.50".to_string(), "US".to_string());
    batch.user_agent.insert("203.0.113.50".to_string(), "ua".to_string());

    apply_breaches(&policy, &mut records, now, &batch);
    assert_eq!(records.len(), 1);
    assert!(records[0].block_until > now);

    BlockLedger::write(&ledger_path, &records).unwrap();
    let read_back = BlockLedger::read(&ledger_path);
    assert_eq!(read_back.len(), 1);
    assert_eq!(read_back[0].ip.to_string(), "203.0.113.50");
}
