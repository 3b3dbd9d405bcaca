//! Shared utility functions.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run a blocking tmux/git/filesystem call off the async workers.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Like [`blocking`], but gives up after `duration`. The blocking call is
/// left to finish on its thread and its result is discarded.
pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Reduce an identifier to characters safe for tmux session names,
/// branch components and directory names.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_success() {
        assert_eq!(blocking(|| Ok::<_, Error>(42)).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_blocking_with_timeout_expires() {
        let result = blocking_with_timeout(Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(100));
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result.unwrap_err(), Error::Timeout(_)));
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("spec_1_2"), "spec_1_2");
        assert_eq!(sanitize_component("fix login/page"), "fix_login_page");
        assert_eq!(sanitize_component("  "), "_");
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("claude"), "claude");
        assert_eq!(shell_escape("hello world"), "'hello world'");
        assert_eq!(shell_escape("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
