//! Small helpers shared by the control plane and the binary.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

/// Render a duration compactly, e.g. `1h2m3s`, dropping fractional seconds.
///
/// Zero components are omitted; anything under a second renders as `0s`.
pub fn prettify_duration(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs()))
        .to_string()
        .replace(' ', "")
}

/// True when `path` can be stat'ed.
pub fn file_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().metadata().is_ok()
}

/// Create `path` if missing, without truncating an existing file.
pub fn touch_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
}

/// True when `s` contains every non-empty substring and at least one
/// non-empty substring was given.
pub fn string_contains_all(s: &str, substrings: &[&str]) -> bool {
    let mut found_any = false;
    for substring in substrings.iter().filter(|sub| !sub.is_empty()) {
        if !s.contains(substring) {
            return false;
        }
        found_any = true;
    }
    found_any
}
