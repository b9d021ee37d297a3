// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Line Parser (C3). Extracts the fixed, tab-delimited fields from one
//! access-log line. A pattern mismatch is non-fatal: callers log a
//! diagnostic and skip the line.

/// Fields of interest for the core classifier, per spec §4.3. Additional
/// trailing fields in the log line are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub time_iso8601: String,
    pub country: String,
    pub ip: String,
    pub request_method: String,
    pub request_uri: String,
    pub status: String,
    pub user_agent: String,
}

/// The minimum number of tab-separated fields a well-formed line carries,
/// per the §6 log line format (`time country ip scheme host method uri
/// status bytes referer user_agent`).
const MIN_FIELDS: usize = 11;

/// Strips a single layer of surrounding `"` quotes, if present.
fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Parses one line into its fields of interest. Returns `None` on a field
/// count mismatch; the caller is responsible for logging and continuing.
pub fn parse_line(line: &str) -> Option<LogLine> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }

    Some(LogLine {
        time_iso8601: fields[0].to_string(),
        country: fields[1].to_string(),
        ip: fields[2].to_string(),
        request_method: fields[5].to_string(),
        request_uri: unquote(fields[6]).to_string(),
        status: fields[7].to_string(),
        user_agent: unquote(fields[10]).to_string(),
    })
}
