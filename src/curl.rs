//! Helpers for curls, the slash separated identifiers of configuration records.

use std::path::{Path, PathBuf};

/// Strips a single trailing slash.
pub fn trim_trailing_slash(curl: &str) -> &str {
    curl.strip_suffix('/').unwrap_or(curl)
}

/// Strips a single leading slash, unless the curl is nothing but that slash.
pub fn trim_leading_slash(curl: &str) -> &str {
    if curl.len() > 1 {
        curl.strip_prefix('/').unwrap_or(curl)
    } else {
        curl
    }
}

/// Returns the canonical form of a curl: no leading and no trailing slash.
pub fn canonical(curl: &str) -> &str {
    trim_trailing_slash(trim_leading_slash(curl))
}

/// The last segment of a curl, or the curl itself if it has a single segment.
pub fn last_segment(curl: &str) -> &str {
    match curl.rfind('/') {
        Some(pos) => &curl[pos + 1..],
        None => curl,
    }
}

/// Splits a curl into its parent and its last segment.
///
/// Returns `None` for single segment curls, which have no parent.
pub fn split_last(curl: &str) -> Option<(&str, &str)> {
    let pos = curl.rfind('/')?;
    Some((&curl[..pos], &curl[pos + 1..]))
}

/// Joins two curl fragments, skipping empty ones.
pub fn join(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{parent}/{child}"),
    }
}

/// Path of the record file backing `curl`.
///
/// Each record lives inside a directory named after it:
/// `Containers/Container` maps to `<root>/Containers/Container/Container.xml`.
pub fn record_path(root: &Path, curl: &str) -> PathBuf {
    let curl = canonical(curl);
    let name = last_segment(curl);
    root.join(curl).join(format!("{name}.xml"))
}
