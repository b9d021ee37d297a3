// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed, library-internal error kinds. `main` and the daemon loop deal in
//! `anyhow::Result`; these enums exist so call sites can match on a specific
//! failure mode (the §7 error table) without string-sniffing.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{directive} directive repeats entity {entity:?} on line {line}")]
    DuplicateEntity {
        directive: String,
        entity: String,
        line: usize,
    },

    #[error("unrecognised directive {0:?} on line {1}")]
    UnknownDirective(String, usize),

    #[error("invalid duration {value:?} on line {line}: expected <int>{{h|d}}")]
    BadDuration { value: String, line: usize },

    #[error("limit ceiling {value} on line {line} is below the minimum of 60")]
    CeilingTooLow { value: u64, line: usize },

    #[error("malformed line {line}: expected `<directive> <entity> <value>`")]
    Malformed { line: usize },
}

#[derive(Debug, Error)]
pub enum FcrdnsError {
    #[error("PTR lookup for {ip} failed: {source}")]
    Reverse {
        ip: IpAddr,
        #[source]
        source: hickory_resolver::ResolveError,
    },

    #[error("forward lookup of {name} failed: {source}")]
    Forward {
        name: String,
        #[source]
        source: hickory_resolver::ResolveError,
    },

    #[error("forward-confirmed mismatch: {ip} resolved to {name} but forward lookup returned {resolved}")]
    Mismatch {
        ip: IpAddr,
        name: String,
        resolved: IpAddr,
    },

    #[error("PTR lookup for {0} returned no names")]
    NoPtrRecord(IpAddr),
}

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("log file {0:?} disappeared")]
    Disappeared(String),

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rotate {path}: {source}")]
    Rotate {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to parse ledger line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(
        "refusing to start: {configured:?} is not the canonical production log path {canonical:?}"
    )]
    NonCanonicalLogPath {
        configured: String,
        canonical: String,
    },
}
