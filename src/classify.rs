// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Weight Classifier (C4). Derives the URI path, query-string flag, and
//! extension from a request, and assigns an integer weight per the
//! first-match-wins rule table in spec §4.4.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::parser::LogLine;

/// Policy-frozen static-asset extension set: images, fonts, media,
/// archives, documents, and common text/data formats.
static STATIC_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // images
        "jpg", "jpeg", "png", "gif", "ico", "webp", "svg", "bmp", "avif",
        // fonts
        "woff", "woff2", "ttf", "otf", "eot",
        // media
        "mp3", "mp4", "webm", "ogg", "wav", "avi", "mov",
        // archives
        "zip", "gz", "tar", "rar", "7z", "bz2",
        // documents / office
        "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
        // common text/data formats
        "css", "js", "map", "json", "xml", "csv", "txt",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Weighted {
    pub uri: String,
    pub is_args: bool,
    pub ext: Option<String>,
    pub weight: u64,
}

/// Splits the raw request URI into its lowercased path prefix, a
/// query-string flag, and the extension (the portion from the last `.`
/// onward in the final path segment, if any).
fn split_uri(request_uri: &str) -> (String, bool) {
    match request_uri.split_once('?') {
        Some((path, _)) => (path.to_ascii_lowercase(), true),
        None => (request_uri.to_ascii_lowercase(), false),
    }
}

fn extract_ext(uri: &str) -> Option<String> {
    let last_segment = uri.rsplit('/').next().unwrap_or(uri);
    last_segment
        .rfind('.')
        .map(|pos| last_segment[pos + 1..].to_string())
        .filter(|ext| !ext.is_empty())
}

/// Assigns a weight to a request, first-match-wins per spec §4.4:
/// static extension (1) -> 3xx redirect (10) -> POST (30) -> query
/// string present (20) -> otherwise (10).
pub fn classify(line: &LogLine) -> Weighted {
    let (uri, is_args) = split_uri(&line.request_uri);
    let ext = extract_ext(&uri);

    let weight = if ext.as_deref().is_some_and(|e| STATIC_EXTENSIONS.contains(e)) {
        1
    } else if line.status.starts_with('3') {
        10
    } else if line.request_method.eq_ignore_ascii_case("post") {
        30
    } else if is_args {
        20
    } else {
        10
    };

    Weighted {
        uri,
        is_args,
        ext,
        weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(uri: &str, method: &str, status: &str) -> LogLine {
        LogLine {
            time_iso8601: "2024-01-01T00:00:00".into(),
            country: "US".into(),
            ip: "1.2.3.4".into(),
            request_method: method.into(),
            request_uri: uri.into(),
            status: status.into(),
            user_agent: "ua".into(),
        }
    }

    #[test]
    fn static_asset_wins_regardless_of_method() {
        let w = classify(&line("/app.CSS?v=2", "POST", "200"));
        assert_eq!(w.weight, 1);
        assert_eq!(w.ext.as_deref(), Some("css"));
        assert!(w.is_args);
    }

    #[test]
    fn redirect_outranks_post_and_query() {
        let w = classify(&line("/login?x=1", "POST", "302"));
        assert_eq!(w.weight, 10);
    }

    #[test]
    fn post_outranks_query_string() {
        let w = classify(&line("/submit?x=1", "POST", "200"));
        assert_eq!(w.weight, 30);
    }

    #[test]
    fn query_string_without_post() {
        let w = classify(&line("/search?q=rust", "GET", "200"));
        assert_eq!(w.weight, 20);
    }

    #[test]
    fn plain_get_is_ten() {
        let w = classify(&line("/", "GET", "200"));
        assert_eq!(w.weight, 10);
        assert_eq!(w.ext, None);
    }
}
