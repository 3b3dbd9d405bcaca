use std::path::Path;
use std::process::{Command, Output};

use crate::util::{sanitize_component, shell_escape};
use crate::{clog_debug, clog_trace, clog_warn, Error, Result};

/// Scrollback kept per pane. `history-limit` only applies to panes created
/// after it is set, so it goes in globally ahead of `new-session`.
const HISTORY_LIMIT: &str = "50000";

/// Single-line texts longer than this are pasted instead of typed.
pub const PASTE_THRESHOLD: usize = 1024;

/// Thin wrapper over the `tmux` binary. Every call is synchronous; async
/// callers go through `util::blocking`.
pub struct Tmux;

/// One session for [`Tmux::create_sessions`].
#[derive(Debug, Clone, Copy)]
pub struct NewSession<'a> {
    pub name: &'a str,
    pub cwd: &'a Path,
    pub cmd: &'a [String],
    pub env: &'a [(String, String)],
}

fn tmux(args: &[&str]) -> Result<Output> {
    Ok(Command::new("tmux").args(args).output()?)
}

fn check(output: Output, what: &str, name: &str) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let err = format!(
        "Failed to {} '{}': {}",
        what,
        name,
        String::from_utf8_lossy(&output.stderr).trim()
    );
    clog_warn!("tmux: {}", err);
    Err(Error::Tmux(err))
}

/// Arguments for one tmux invocation creating every session in `sessions`,
/// with the global scrollback limit raised first.
fn create_args(sessions: &[NewSession<'_>]) -> Result<Vec<String>> {
    let mut args: Vec<String> = ["start-server", ";", "set-option", "-g", "history-limit", HISTORY_LIMIT]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for session in sessions {
        if session.cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }
        let cmd_str = session
            .cmd
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        clog_debug!(
            "Tmux::create_session name={} cwd={} cmd={}",
            session.name,
            session.cwd.display(),
            cmd_str
        );
        args.extend(
            [";", "new-session", "-d", "-s", session.name, "-c"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(session.cwd.display().to_string());
        for (k, v) in session.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(cmd_str);
        // Keep the pane (and its scrollback) when the worker process exits
        args.extend(
            [";", "set-option", "-t", session.name, "remain-on-exit", "on"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    Ok(args)
}

impl Tmux {
    pub fn create_session(
        name: &str,
        cwd: &Path,
        cmd: &[String],
        env: &[(String, String)],
    ) -> Result<()> {
        Self::create_sessions(&[NewSession {
            name,
            cwd,
            cmd,
            env,
        }])
    }

    /// Create several sessions with one chained tmux invocation. tmux stops
    /// at the first failing command, so sessions before it may exist.
    pub fn create_sessions(sessions: &[NewSession<'_>]) -> Result<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let args = create_args(sessions)?;
        let names = sessions
            .iter()
            .map(|s| s.name)
            .collect::<Vec<_>>()
            .join(",");
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        check(tmux(&argv)?, "create session", &names)?;
        clog_debug!("Tmux session(s) created: {}", names);
        Ok(())
    }

    /// Whether `text` must go through a paste buffer: embedded newlines
    /// would submit early, and long send-keys arguments get split.
    pub fn needs_paste(text: &str) -> bool {
        text.contains('\n') || text.len() > PASTE_THRESHOLD
    }

    /// Kill a session. A session that is already gone is not an error.
    pub fn kill_session(name: &str) -> Result<()> {
        clog_debug!("Tmux::kill_session name={}", name);
        let output = tmux(&["kill-session", "-t", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("session not found") || stderr.contains("can't find session") {
                clog_debug!("Tmux session '{}' not found (already dead?)", name);
                return Ok(());
            }
            return check(output, "kill session", name).map(|_| ());
        }
        clog_debug!("Tmux session killed: {}", name);
        Ok(())
    }

    /// Capture pane text with wrapped lines joined. `None` captures the whole
    /// scrollback; `Some(n)` only the last `n` lines.
    pub fn capture(name: &str, max_lines: Option<usize>) -> Result<String> {
        let start = match max_lines {
            Some(n) => format!("-{}", n),
            None => "-".to_string(),
        };
        let output = check(
            tmux(&["capture-pane", "-t", name, "-p", "-J", "-S", &start])?,
            "capture pane",
            name,
        )?;
        let content = String::from_utf8_lossy(&output.stdout).to_string();
        clog_trace!("capture_pane {}: {} bytes", name, content.len());
        Ok(content)
    }

    /// Type `text` into the pane without submitting it. Multi-line and long
    /// texts are pasted as one bracketed paste.
    pub fn send_text(name: &str, text: &str) -> Result<()> {
        clog_debug!("Tmux::send_text name={} bytes={}", name, text.len());
        if Self::needs_paste(text) {
            let buffer = format!("conductor_{}", sanitize_component(name));
            check(
                tmux(&["set-buffer", "-b", &buffer, "--", text])?,
                "load buffer for",
                name,
            )?;
            check(
                tmux(&["paste-buffer", "-p", "-d", "-b", &buffer, "-t", name])?,
                "paste into",
                name,
            )?;
            return Ok(());
        }
        check(
            tmux(&["send-keys", "-t", name, "-l", "--", text])?,
            "send keys to",
            name,
        )
        .map(|_| ())
    }

    pub fn send_enter(name: &str) -> Result<()> {
        check(
            tmux(&["send-keys", "-t", name, "Enter"])?,
            "send Enter to",
            name,
        )
        .map(|_| ())
    }

    /// Type short single-line texts into several panes with one tmux
    /// invocation.
    pub fn send_text_batch(writes: &[(&str, &str)]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = Vec::with_capacity(writes.len() * 7);
        for (i, (name, text)) in writes.iter().enumerate() {
            if i > 0 {
                args.push(";");
            }
            args.extend_from_slice(&["send-keys", "-t", name, "-l", "--", text]);
        }
        clog_debug!("Tmux::send_text_batch writes={}", writes.len());
        check(tmux(&args)?, "send batched keys to", "batch").map(|_| ())
    }

    pub fn send_enter_batch(names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = Vec::with_capacity(names.len() * 5);
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                args.push(";");
            }
            args.extend_from_slice(&["send-keys", "-t", name, "Enter"]);
        }
        check(tmux(&args)?, "send batched Enter to", "batch").map(|_| ())
    }

    pub fn session_exists(name: &str) -> Result<bool> {
        Ok(tmux(&["has-session", "-t", name])?.status.success())
    }

    pub fn list_sessions(prefix: &str) -> Result<Vec<String>> {
        let output = tmux(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.status.success() {
            clog_debug!("No tmux sessions found");
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|s| s.starts_with(prefix))
            .map(String::from)
            .collect())
    }

    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    pub fn session_name(prefix: &str, worker: &str) -> String {
        format!(
            "{}_{}",
            sanitize_component(prefix),
            sanitize_component(worker)
        )
    }
}
