// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

/// `autofilter <mode> [--log PATH] [--config PATH] [--root PATH]`.
#[derive(Debug, Parser)]
#[command(name = "autofilter", version, about = "Adaptive traffic-filtering daemon")]
pub struct Cli {
    /// Operating mode: the daemon loop, or one of the offline reporting
    /// modes over an existing log/ledger.
    pub mode: Mode,

    /// Access log to read. Defaults to the canonical production path;
    /// the daemon mode refuses to start against anything else.
    #[arg(long, default_value = "/var/log/nginx/access.log")]
    pub log: PathBuf,

    /// Logger configuration file (YAML), distinct from the policy file.
    #[arg(long, default_value = "logger.yaml")]
    pub config: PathBuf,

    /// Root directory containing `autofilter.conf` and the `var/`
    /// working directory.
    #[arg(long, default_value = "/etc/autofilter")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Mode {
    Daemon,
    TopTalkers,
    ExtHistogram,
    BodyHistogram,
    Errors,
    TorList,
    FirewallSet,
}

/// Resolves a path argument relative to the current working directory
/// and canonicalizes it, matching the teacher's `resolve_config_path`.
pub fn resolve_config_path(rel: impl AsRef<Path>) -> Result<PathBuf> {
    let p = rel.as_ref();

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;
    use crate::daemon::CANONICAL_LOG_PATH;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_daemon_mode_with_defaults() {
        let cli = Cli::parse_from(["autofilter", "daemon"]);
        assert_eq!(cli.mode, Mode::Daemon);
        assert_eq!(cli.log, PathBuf::from(CANONICAL_LOG_PATH));
    }

    #[test]
    fn parses_kebab_case_mode_and_overrides() {
        let cli = Cli::parse_from([
            "autofilter",
            "top-talkers",
            "--log",
            "/tmp/access.log",
            "--root",
            "/srv/autofilter",
        ]);
        assert_eq!(cli.mode, Mode::TopTalkers);
        assert_eq!(cli.log, PathBuf::from("/tmp/access.log"));
        assert_eq!(cli.root, PathBuf::from("/srv/autofilter"));
    }
}
