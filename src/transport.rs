//! Session transport: the only way the coordinator talks to a worker.
//!
//! A session is a persistent terminal holding one worker process. The
//! coordinator types prompts into it and scrapes its scrollback. Calls are
//! synchronous and may block on a subprocess, so async code reaches them
//! through `util::blocking`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::tmux::{NewSession, Tmux};
use crate::util::tail_lines;
use crate::{clog_debug, clog_warn, Error, Result};

pub type SessionId = String;

/// Everything needed to launch a worker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub name: String,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// One queued write, used for batched delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWrite {
    pub session: SessionId,
    pub text: String,
    pub append_newline: bool,
}

pub trait SessionTransport: Send + Sync {
    fn open(&self, spec: &SessionSpec) -> Result<SessionId>;

    /// Open several sessions in as few underlying calls as possible,
    /// returning one result per spec.
    fn open_batch(&self, specs: &[SessionSpec]) -> Vec<Result<SessionId>> {
        specs.iter().map(|spec| self.open(spec)).collect()
    }

    /// Type `text` into the session, pressing Enter afterwards when
    /// `append_newline` is set.
    fn write(&self, session: &str, text: &str, append_newline: bool) -> Result<()>;

    /// Deliver several writes in as few underlying calls as possible,
    /// returning one result per write. Writes to the same session keep
    /// their order.
    fn write_batch(&self, writes: &[SessionWrite]) -> Vec<Result<()>> {
        writes
            .iter()
            .map(|w| self.write(&w.session, &w.text, w.append_newline))
            .collect()
    }

    /// Press Enter without typing anything, submitting whatever input is
    /// sitting unsent in the session.
    fn nudge(&self, session: &str) -> Result<()> {
        self.write(session, "", true)
    }

    /// The session's scrollback, or only its last `max_lines` lines.
    fn read(&self, session: &str, max_lines: Option<usize>) -> Result<String>;

    fn exists(&self, session: &str) -> Result<bool>;

    /// Tear the session down. Destroying a missing session is a no-op.
    fn destroy(&self, session: &str) -> Result<()>;
}

/// Production transport backed by tmux.
pub struct TmuxTransport {
    enter_delay: Duration,
}

impl TmuxTransport {
    pub fn new(enter_delay: Duration) -> Self {
        Self { enter_delay }
    }

    pub fn is_available() -> bool {
        Tmux::is_available()
    }
}

impl SessionTransport for TmuxTransport {
    fn open(&self, spec: &SessionSpec) -> Result<SessionId> {
        Tmux::create_session(&spec.name, &spec.cwd, &spec.command, &spec.env)?;
        Ok(spec.name.clone())
    }

    fn open_batch(&self, specs: &[SessionSpec]) -> Vec<Result<SessionId>> {
        if specs.len() < 2 {
            return specs.iter().map(|spec| self.open(spec)).collect();
        }
        let live = match Tmux::list_sessions("") {
            Ok(live) => live,
            Err(e) => return specs.iter().map(|_| Err(Error::TransientIo(e.to_string()))).collect(),
        };
        // Taken names fail alone instead of aborting the chain for everyone
        let fresh: Vec<&SessionSpec> = specs.iter().filter(|s| !live.contains(&s.name)).collect();
        let sessions: Vec<NewSession<'_>> = fresh
            .iter()
            .map(|spec| NewSession {
                name: &spec.name,
                cwd: &spec.cwd,
                cmd: &spec.command,
                env: &spec.env,
            })
            .collect();
        let chained = Tmux::create_sessions(&sessions);
        if let Err(e) = &chained {
            clog_warn!("Batched open of {} sessions failed, opening one by one: {}", sessions.len(), e);
        }

        specs
            .iter()
            .map(|spec| {
                if live.contains(&spec.name) {
                    return Err(Error::invalid_state(format!("session already exists: {}", spec.name)));
                }
                if chained.is_ok() || Tmux::session_exists(&spec.name)? {
                    return Ok(spec.name.clone());
                }
                self.open(spec)
            })
            .collect()
    }

    fn write(&self, session: &str, text: &str, append_newline: bool) -> Result<()> {
        Tmux::send_text(session, text)?;
        if append_newline {
            // The worker UI drops an Enter that lands in the same read as the text
            std::thread::sleep(self.enter_delay);
            Tmux::send_enter(session)?;
        }
        Ok(())
    }

    fn write_batch(&self, writes: &[SessionWrite]) -> Vec<Result<()>> {
        // One listing up front so missing sessions fail alone instead of
        // aborting the chained command for everyone
        let live = match Tmux::list_sessions("") {
            Ok(live) => live,
            Err(e) => return writes.iter().map(|_| Err(Error::TransientIo(e.to_string()))).collect(),
        };
        let mut results: Vec<Option<Result<()>>> = writes
            .iter()
            .map(|w| {
                (!live.contains(&w.session)).then(|| Err(Error::not_found("session", w.session.as_str())))
            })
            .collect();
        let deliverable: Vec<usize> = (0..writes.len()).filter(|&i| results[i].is_none()).collect();

        let outcome = (|| -> Result<()> {
            let texts: Vec<(&str, &str)> = deliverable
                .iter()
                .map(|&i| &writes[i])
                .filter(|w| !Tmux::needs_paste(&w.text))
                .map(|w| (w.session.as_str(), w.text.as_str()))
                .collect();
            Tmux::send_text_batch(&texts)?;
            for w in deliverable.iter().map(|&i| &writes[i]).filter(|w| Tmux::needs_paste(&w.text)) {
                Tmux::send_text(&w.session, &w.text)?;
            }

            let mut enters: Vec<&str> = Vec::new();
            for w in deliverable.iter().map(|&i| &writes[i]).filter(|w| w.append_newline) {
                if !enters.contains(&w.session.as_str()) {
                    enters.push(&w.session);
                }
            }
            if !enters.is_empty() {
                std::thread::sleep(self.enter_delay);
                Tmux::send_enter_batch(&enters)?;
            }
            Ok(())
        })();

        for i in deliverable {
            results[i] = Some(match &outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(Error::TransientIo(e.to_string())),
            });
        }
        results.into_iter().map(|r| r.unwrap_or(Ok(()))).collect()
    }

    fn nudge(&self, session: &str) -> Result<()> {
        Tmux::send_enter(session)
    }

    fn read(&self, session: &str, max_lines: Option<usize>) -> Result<String> {
        Tmux::capture(session, max_lines)
    }

    fn exists(&self, session: &str) -> Result<bool> {
        Tmux::session_exists(session)
    }

    fn destroy(&self, session: &str) -> Result<()> {
        Tmux::kill_session(session)
    }
}

/// Produces the output a scripted worker appends after receiving a prompt.
pub type Responder = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

#[derive(Debug, Default)]
struct MemorySession {
    buffer: String,
    writes: Vec<String>,
    /// Typed but not yet submitted.
    pending: String,
    nudges: usize,
    alive: bool,
}

/// In-process transport for tests and dry runs.
///
/// Submitted prompts are echoed into the buffer as operator input lines
/// (`> text`), the way a worker CLI echoes them. An optional responder
/// plays the worker and appends its reply. Text written without a newline
/// stays pending until a nudge submits it.
#[derive(Default)]
pub struct MemoryTransport {
    sessions: Mutex<HashMap<SessionId, MemorySession>>,
    opened: Mutex<Vec<SessionSpec>>,
    open_batches: Mutex<Vec<usize>>,
    responder: Mutex<Option<Responder>>,
    failing_writes: AtomicUsize,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        let transport = Self::default();
        transport.set_responder(f);
        transport
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        *guard(&self.responder) = Some(Arc::new(f));
    }

    /// Append worker output to a session as if the worker printed it.
    pub fn push_output(&self, session: &str, text: &str) {
        let mut sessions = guard(&self.sessions);
        let entry = sessions.entry(session.to_string()).or_default();
        append_line(&mut entry.buffer, text);
    }

    /// Prompts submitted to `session`, oldest first.
    pub fn writes(&self, session: &str) -> Vec<String> {
        guard(&self.sessions)
            .get(session)
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    pub fn buffer(&self, session: &str) -> String {
        guard(&self.sessions)
            .get(session)
            .map(|s| s.buffer.clone())
            .unwrap_or_default()
    }

    pub fn opened(&self) -> Vec<SessionSpec> {
        guard(&self.opened).clone()
    }

    /// Sizes of the `open_batch` calls made so far.
    pub fn open_batches(&self) -> Vec<usize> {
        guard(&self.open_batches).clone()
    }

    pub fn nudges(&self, session: &str) -> usize {
        guard(&self.sessions)
            .get(session)
            .map(|s| s.nudges)
            .unwrap_or(0)
    }

    /// Simulate the session process dying without being destroyed.
    pub fn kill(&self, session: &str) {
        if let Some(s) = guard(&self.sessions).get_mut(session) {
            s.alive = false;
        }
    }

    /// Make the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Replace a session's buffer, as when a pane is cleared.
    pub fn clear(&self, session: &str) {
        if let Some(s) = guard(&self.sessions).get_mut(session) {
            s.buffer.clear();
        }
    }

    /// Drop the oldest `n` lines, as when scrollback reaches its limit.
    pub fn drop_history(&self, session: &str, n: usize) {
        if let Some(s) = guard(&self.sessions).get_mut(session) {
            let cut = s
                .buffer
                .match_indices('\n')
                .nth(n.saturating_sub(1))
                .map(|(i, _)| i + 1)
                .unwrap_or(s.buffer.len());
            if n > 0 {
                s.buffer.drain(..cut);
            }
        }
    }
}

impl MemoryTransport {
    fn respond(&self, session: &str, text: &str) {
        let responder = guard(&self.responder).clone();
        if let Some(respond) = responder {
            if let Some(reply) = respond(session, text) {
                self.push_output(session, &reply);
            }
        }
    }
}

fn append_line(buffer: &mut String, text: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(text);
    if !text.ends_with('\n') {
        buffer.push('\n');
    }
}

impl SessionTransport for MemoryTransport {
    fn open(&self, spec: &SessionSpec) -> Result<SessionId> {
        let mut sessions = guard(&self.sessions);
        if sessions.get(&spec.name).map(|s| s.alive).unwrap_or(false) {
            return Err(Error::invalid_state(format!(
                "session already exists: {}",
                spec.name
            )));
        }
        sessions.insert(
            spec.name.clone(),
            MemorySession {
                alive: true,
                ..Default::default()
            },
        );
        guard(&self.opened).push(spec.clone());
        clog_debug!("MemoryTransport::open {}", spec.name);
        Ok(spec.name.clone())
    }

    fn write(&self, session: &str, text: &str, append_newline: bool) -> Result<()> {
        let pending = self.failing_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_writes.store(pending - 1, Ordering::SeqCst);
            return Err(Error::TransientIo(format!("injected write failure on {}", session)));
        }

        {
            let mut sessions = guard(&self.sessions);
            let s = sessions
                .get_mut(session)
                .filter(|s| s.alive)
                .ok_or_else(|| Error::not_found("session", session))?;
            if !append_newline {
                s.buffer.push_str(text);
                s.pending.push_str(text);
                return Ok(());
            }
            s.pending.clear();
            let echo: Vec<String> = text
                .lines()
                .enumerate()
                .map(|(i, line)| {
                    if i == 0 {
                        format!("> {}", line)
                    } else {
                        format!("  {}", line)
                    }
                })
                .collect();
            append_line(&mut s.buffer, &echo.join("\n"));
            s.writes.push(text.to_string());
        }

        self.respond(session, text);
        Ok(())
    }

    fn open_batch(&self, specs: &[SessionSpec]) -> Vec<Result<SessionId>> {
        guard(&self.open_batches).push(specs.len());
        specs.iter().map(|spec| self.open(spec)).collect()
    }

    fn nudge(&self, session: &str) -> Result<()> {
        let submitted = {
            let mut sessions = guard(&self.sessions);
            let s = sessions
                .get_mut(session)
                .filter(|s| s.alive)
                .ok_or_else(|| Error::not_found("session", session))?;
            s.nudges += 1;
            let text = std::mem::take(&mut s.pending);
            if !text.is_empty() {
                s.writes.push(text.clone());
            }
            text
        };
        if !submitted.is_empty() {
            self.respond(session, &submitted);
        }
        Ok(())
    }

    fn read(&self, session: &str, max_lines: Option<usize>) -> Result<String> {
        let sessions = guard(&self.sessions);
        let s = sessions
            .get(session)
            .filter(|s| s.alive)
            .ok_or_else(|| Error::not_found("session", session))?;
        Ok(match max_lines {
            Some(n) => tail_lines(&s.buffer, n),
            None => s.buffer.clone(),
        })
    }

    fn exists(&self, session: &str) -> Result<bool> {
        Ok(guard(&self.sessions)
            .get(session)
            .map(|s| s.alive)
            .unwrap_or(false))
    }

    fn destroy(&self, session: &str) -> Result<()> {
        guard(&self.sessions).remove(session);
        Ok(())
    }
}
