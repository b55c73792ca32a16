//! Structured logging module using tracing
//!
//! Console output goes to stderr; when a log file path is given the same events
//! are appended to it without ANSI colors. Verbosity comes from the command line
//! (`-v`, `-vv`, `-vvv`), not from `RUST_LOG`.

use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ellipse a string for display: first half + "..." + last half.
/// If `s` has ≤ `max_len` chars, returns `s` unchanged.
pub fn ellipse(s: &str, max_len: usize) -> String {
    const SEP: &str = "...";
    let sep_len = 3;
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    if n <= max_len {
        return s.to_string();
    }
    if max_len <= sep_len {
        return chars[..max_len].iter().collect();
    }
    let first_count = (max_len - sep_len) / 2;
    let last_count = (max_len - sep_len) - first_count;
    let first: String = chars[..first_count].iter().collect();
    let last: String = chars[n - last_count..].iter().collect();
    format!("{}{}{}", first, SEP, last)
}

/// Map CLI verbosity (0-3) to a filter level
pub fn filter_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",  // -v: pass and sweep summaries
        2 => "debug", // -vv: per entity / per notification
        _ => "trace",
    }
}

/// Initialize tracing with console and optional file output
pub fn init_tracing(verbosity: u8, log_file_path: Option<PathBuf>) {
    let filter = EnvFilter::new(filter_level(verbosity));
    let registry = tracing_subscriber::registry().with(filter);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let file = log_file_path.and_then(|log_path| {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok()
    });

    match file {
        Some(file) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_ansi(false);
            registry.with(console_layer).with(file_layer).init();
        }
        // Console only if there is no path or the file cannot be opened
        None => registry.with(console_layer).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ellipse() {
        assert_eq!(ellipse("short", 10), "short");
        assert_eq!(ellipse("abcdefghijkl", 9), "abc...jkl");
        assert_eq!(ellipse("abcdef", 2), "ab");
    }

    #[test]
    fn test_filter_level() {
        assert_eq!(filter_level(0), "warn");
        assert_eq!(filter_level(2), "debug");
        assert_eq!(filter_level(9), "trace");
    }
}
