// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minute Batcher (C5). Groups lines by the leading 16-character minute
//! prefix of their timestamp; on prefix change, flushes the accumulated
//! batch state.

use std::collections::HashMap;

use crate::{classify::classify, parser::LogLine};

/// Length of the `YYYY-MM-DDTHH:MM` minute-precision prefix of an
/// ISO-8601 timestamp.
const MINUTE_PREFIX_LEN: usize = 16;

/// Ephemeral, one-instance-per-minute-window accumulator (spec §3).
#[derive(Debug, Default, Clone)]
pub struct BatchState {
    pub load: HashMap<String, u64>,
    pub country: HashMap<String, String>,
    pub user_agent: HashMap<String, String>,
}

/// Groups log lines into minute buckets. `push` is a plain synchronous
/// state machine (no closures): it returns the *previous* bucket's
/// `(minute, state)` exactly when the incoming line's minute prefix
/// differs from the bucket currently open, having cleared the state
/// atomically (`std::mem::take`) before returning it. Callers drive the
/// actual (possibly async) flush work themselves.
pub struct Batcher {
    current_minute: Option<String>,
    state: BatchState,
}

impl Batcher {
    pub fn new() -> Self {
        Batcher {
            current_minute: None,
            state: BatchState::default(),
        }
    }

    /// Accumulates one line into the current bucket. Returns
    /// `Some((minute, finished_state))` when this line belongs to a new
    /// minute and the previous bucket must be flushed first.
    pub fn push(&mut self, line: &LogLine) -> Option<(String, BatchState)> {
        let minute = minute_prefix(&line.time_iso8601);
        let mut finished = None;

        match &self.current_minute {
            Some(current) if *current != minute => {
                finished = Some((current.clone(), std::mem::take(&mut self.state)));
                self.current_minute = Some(minute);
            },
            None => {
                self.current_minute = Some(minute);
            },
            _ => {},
        }

        let weighted = classify(line);
        *self.state.load.entry(line.ip.clone()).or_insert(0) += weighted.weight;
        self.state
            .country
            .insert(line.ip.clone(), line.country.clone());
        self.state
            .user_agent
            .insert(line.ip.clone(), line.user_agent.clone());

        finished
    }

    /// Takes whatever is currently buffered, e.g. on clean shutdown, so
    /// the caller can flush it before exiting.
    pub fn take_remaining(&mut self) -> Option<(String, BatchState)> {
        self.current_minute
            .take()
            .map(|minute| (minute, std::mem::take(&mut self.state)))
    }
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new()
    }
}

fn minute_prefix(time_iso8601: &str) -> String {
    time_iso8601.chars().take(MINUTE_PREFIX_LEN).collect()
}
