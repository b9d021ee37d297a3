// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reload Signaler (C9). Rate-limited, change-detecting notification to
//! the HTTP server when the block set membership changes.

use std::{collections::BTreeSet, net::IpAddr, path::Path};

use nix::sys::signal::Signal;
use tracing::{debug, info};

use crate::tailer::send_signal;

/// Minimum interval between two reload signals, per spec §4.9/§8.
const RELOAD_BUDGET_SECS: i64 = 60;

pub struct ReloadSignaler {
    last_reload_epoch: i64,
    last_reloaded_membership: BTreeSet<IpAddr>,
}

impl ReloadSignaler {
    pub fn new() -> Self {
        ReloadSignaler {
            // Not `i64::MIN`: `maybe_signal` computes `now - last_reload_epoch`,
            // and `now - i64::MIN` overflows `i64` for any realistic epoch.
            // Halving the sentinel keeps the subtraction comfortably clear of
            // the budget check while still guaranteeing the first flush ever
            // is treated as "budget elapsed".
            last_reload_epoch: i64::MIN / 2,
            last_reloaded_membership: BTreeSet::new(),
        }
    }

    /// If the reload budget has elapsed *and* membership changed since the
    /// last reload, reads the HTTP server's pid from `pidfile` and sends a
    /// HUP-equivalent signal. A missing/unreadable pidfile is skipped
    /// silently, per §7.
    pub fn maybe_signal(&mut self, current: &BTreeSet<IpAddr>, pidfile: &Path, now: i64) {
        if now - self.last_reload_epoch < RELOAD_BUDGET_SECS {
            return;
        }
        if *current == self.last_reloaded_membership {
            return;
        }

        match read_pid(pidfile) {
            Some(pid) => {
                send_signal(pid, Signal::SIGHUP);
                info!(pid, members = current.len(), "signaled HTTP server reload");
            },
            None => {
                debug!(?pidfile, "no readable pidfile, skipping reload signal");
            },
        }

        self.last_reload_epoch = now;
        self.last_reloaded_membership = current.clone();
    }
}

impl Default for ReloadSignaler {
    fn default() -> Self {
        Self::new()
    }
}

fn read_pid(pidfile: &Path) -> Option<i32> {
    std::fs::read_to_string(pidfile).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ips: &[&str]) -> BTreeSet<IpAddr> {
        ips.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn no_signal_within_budget() {
        let mut signaler = ReloadSignaler::new();
        let members = set(&["1.1.1.1"]);
        signaler.maybe_signal(&members, Path::new("/nonexistent/pid"), 0);
        assert_eq!(signaler.last_reload_epoch, 0);

        // Simulate a second call 30s later with a membership change; still
        // within the 60s budget, must not update state.
        let members2 = set(&["1.1.1.1", "2.2.2.2"]);
        signaler.maybe_signal(&members2, Path::new("/nonexistent/pid"), 30);
        assert_eq!(signaler.last_reload_epoch, 0);
        assert_eq!(signaler.last_reloaded_membership, set(&["1.1.1.1"]));
    }

    #[test]
    fn no_signal_when_membership_unchanged() {
        let mut signaler = ReloadSignaler::new();
        let members = set(&["1.1.1.1"]);
        signaler.maybe_signal(&members, Path::new("/nonexistent/pid"), 0);
        signaler.maybe_signal(&members, Path::new("/nonexistent/pid"), 120);
        // second call 120s later still same membership -> must skip
        assert_eq!(signaler.last_reload_epoch, 0);
    }

    #[test]
    fn signals_after_budget_with_changed_membership() {
        let mut signaler = ReloadSignaler::new();
        let members = set(&["1.1.1.1"]);
        signaler.maybe_signal(&members, Path::new("/nonexistent/pid"), 0);

        let members2 = set(&["1.1.1.1", "2.2.2.2"]);
        signaler.maybe_signal(&members2, Path::new("/nonexistent/pid"), 61);
        assert_eq!(signaler.last_reload_epoch, 61);
        assert_eq!(signaler.last_reloaded_membership, members2);
    }
}
