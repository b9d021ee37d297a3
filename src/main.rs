// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use autofilter::{
    cfg::{
        cli::{Cli, Mode, resolve_config_path},
        logger::init_logger,
    },
    daemon::{self, DaemonArgs},
    report,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _logger_guard = match resolve_config_path(&cli.config) {
        Ok(path) => Some(init_logger(&path.display().to_string())?),
        Err(_) => None,
    };

    match cli.mode {
        Mode::Daemon => run_daemon(cli).await,
        Mode::TopTalkers => {
            let mut stdout = std::io::stdout();
            report::top_talkers(&cli.log, &mut stdout).await
        },
        Mode::ExtHistogram => {
            let mut stdout = std::io::stdout();
            report::ext_histogram(&cli.log, &mut stdout).await
        },
        Mode::BodyHistogram => {
            let mut stdout = std::io::stdout();
            report::status_histogram(&cli.log, &mut stdout).await
        },
        Mode::Errors => {
            let mut stdout = std::io::stdout();
            report::errors(&cli.log, &mut stdout).await
        },
        Mode::TorList => {
            let ledger_path = cli.root.join("var").join("bot.conf");
            let mut stdout = std::io::stdout();
            report::tor_list(ledger_path, &mut stdout)
        },
        Mode::FirewallSet => {
            let ledger_path = cli.root.join("var").join("bot.conf");
            let mut stdout = std::io::stdout();
            report::firewall_set(ledger_path, "autofilter", &mut stdout)
        },
    }
}

async fn run_daemon(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    let cancel_for_signals = cancel.clone();

    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        info!("shutdown signal received");
        cancel_for_signals.cancel();
    });

    let args = DaemonArgs {
        log_path: cli.log,
        root: cli.root,
    };

    daemon::run_daemon(args, cancel)
        .await
        .context("daemon loop exited with an error")
}
