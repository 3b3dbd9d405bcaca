//! Completion-signal detection over scraped session output.
//!
//! A prompt that says "reply DONE when finished" is echoed into the pane
//! before the worker answers, so a plain substring search over the buffer
//! fires on the coordinator's own words. The detector only searches text
//! the worker wrote:
//!
//! 1. Everything before the cursor (taken just before the prompt was sent)
//!    is ignored.
//! 2. After the cursor, a worker-authored block starts at a line led by the
//!    response cue (`⏺` by default) and runs until the next response cue or
//!    operator input line (`>`). Lines outside any block, which includes
//!    the echoed prompt, are never searched.
//! 3. Within a block, whitespace is collapsed and decoration (markdown
//!    emphasis, box drawing) is replaced, except characters that occur in
//!    the marker itself. The marker must then appear as a whole token.
//!
//! Cursors count lines of ANSI-stripped output with trailing blank lines
//! removed, so pane padding never moves them. Each cursor also remembers
//! the last few lines before it. When the pane's scrollback drops lines
//! from the top, every index shifts; the watch finds those anchor lines
//! again and resumes just after them instead of trusting the stale index.
//!
//! ```
//! use conductor::orchestration::detector::{scan, Cues};
//!
//! let cues = Cues::default();
//! let echoed = "> Fix the bug, then reply DONE\n";
//! assert!(scan(echoed, 0, "DONE", &cues).is_none());
//!
//! let answered = "> Fix the bug, then reply DONE\n⏺ Fixed the null check. **DONE**\n";
//! let hit = scan(answered, 0, "DONE", &cues).unwrap();
//! assert_eq!(hit.line, 1);
//! ```

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;
use crate::transport::SessionTransport;
use crate::util::{blocking, tail_lines};
use crate::{clog_debug, clog_trace, clog_warn, Result};

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("static ANSI pattern")
});

/// Characters dropped from the edges of a line before cue matching.
const FRAME_CHARS: &[char] = &['│', '┃', '╭', '╮', '╰', '╯', '─', '━', '|'];

/// Structural cues that tell worker output apart from operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cues {
    pub response: String,
    pub input: String,
}

impl Default for Cues {
    fn default() -> Self {
        Self {
            response: "⏺".to_string(),
            input: ">".to_string(),
        }
    }
}

impl From<&DetectorConfig> for Cues {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            response: config.response_cue.clone(),
            input: config.input_cue.clone(),
        }
    }
}

/// A marker found inside a worker-authored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub marker: String,
    /// The block text (cue removed, original spacing kept).
    pub block: String,
    /// Line index at which the block starts.
    pub line: usize,
}

/// Result of watching a session for a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Detected { marker: String, block: String },
    Timeout { tail: String },
    Cancelled,
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Lines of `buffer` as the detector counts them.
fn content_lines(buffer: &str) -> Vec<String> {
    let stripped = strip_ansi(buffer);
    let mut lines: Vec<String> = stripped
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines
}

/// The cursor position for the current end of `buffer`.
pub fn line_count(buffer: &str) -> usize {
    content_lines(buffer).len()
}

fn unframe(line: &str) -> &str {
    line.trim().trim_matches(FRAME_CHARS).trim()
}

/// Lines an anchor may be built from: not blank, not pure frame, not an
/// empty input prompt. Pairs of (line index, unframed text).
fn landmarks<'a>(lines: &'a [String], cues: &Cues) -> Vec<(usize, &'a str)> {
    lines
        .iter()
        .enumerate()
        .map(|(i, l)| (i, unframe(l)))
        .filter(|(_, bare)| !bare.is_empty() && *bare != cues.input.trim())
        .collect()
}

const ANCHOR_LINES: usize = 3;

/// A position in a session's output.
///
/// Holds the line index at which it was taken plus the landmark lines just
/// before it, so the position survives history being dropped from the top
/// of the buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    line: usize,
    anchor: Vec<String>,
}

impl Cursor {
    /// Cursor at the current end of `buffer`.
    pub fn at_end(buffer: &str, cues: &Cues) -> Self {
        let lines = content_lines(buffer);
        Self::at(&lines, lines.len(), cues)
    }

    fn at(lines: &[String], line: usize, cues: &Cues) -> Self {
        let line = line.min(lines.len());
        let before = landmarks(&lines[..line], cues);
        let skip = before.len().saturating_sub(ANCHOR_LINES);
        Self {
            line,
            anchor: before[skip..].iter().map(|(_, l)| l.to_string()).collect(),
        }
    }

    /// Line index the cursor was taken at.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Where this position sits in `lines` now.
    ///
    /// Lines only ever leave from the top, so the anchor can only have moved
    /// up. The latest occurrence that does not end past the original index
    /// wins. `None` once the anchor is gone from the buffer.
    fn locate(&self, lines: &[String], cues: &Cues) -> Option<usize> {
        if self.anchor.is_empty() {
            return Some(0);
        }
        let marks = landmarks(lines, cues);
        marks
            .windows(self.anchor.len())
            .filter(|w| w.iter().zip(&self.anchor).all(|((_, have), want)| have == want))
            .map(|w| w[w.len() - 1].0 + 1)
            .filter(|end| *end <= self.line)
            .last()
    }
}

fn is_decoration(c: char) -> bool {
    matches!(c, '*' | '`' | '~' | '#' | '•' | '·' | '⎿' | '▶' | '►')
        || ('\u{2500}'..='\u{257F}').contains(&c)
}

/// Collapse whitespace and blank out decoration, sparing marker characters.
pub fn normalize(text: &str, marker: &str) -> String {
    let spared: Vec<char> = marker.chars().collect();
    let replaced: String = text
        .chars()
        .map(|c| {
            if is_decoration(c) && !spared.contains(&c) {
                ' '
            } else {
                c
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-token search for `marker` in already normalized text.
pub fn contains_marker(normalized: &str, marker: &str) -> bool {
    let needle = marker.split_whitespace().collect::<Vec<_>>().join(" ");
    if needle.is_empty() {
        return false;
    }
    normalized.match_indices(&needle).any(|(start, m)| {
        let before = normalized[..start].chars().next_back();
        let after = normalized[start + m.len()..].chars().next();
        let left_ok = match (before, needle.chars().next()) {
            (Some(b), Some(first)) => !(is_word_char(b) && is_word_char(first)),
            _ => true,
        };
        let right_ok = match (after, needle.chars().next_back()) {
            (Some(a), Some(last)) => !(is_word_char(a) && is_word_char(last)),
            _ => true,
        };
        left_ok && right_ok
    })
}

struct Block {
    start: usize,
    lines: Vec<String>,
}

/// Worker-authored blocks at or after `cursor`, oldest first.
fn response_blocks(lines: &[String], cursor: usize, cues: &Cues) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;

    for (offset, raw) in lines.iter().skip(cursor).enumerate() {
        let bare = unframe(raw);
        if !cues.response.is_empty() && bare.starts_with(cues.response.as_str()) {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(Block {
                start: cursor + offset,
                lines: vec![bare[cues.response.len()..].trim().to_string()],
            });
        } else if !cues.input.is_empty() && bare.starts_with(cues.input.as_str()) {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
        } else if let Some(block) = current.as_mut() {
            block.lines.push(raw.trim_end().to_string());
        }
    }
    if let Some(done) = current {
        blocks.push(done);
    }
    blocks
}

/// Look for `marker` in worker-authored text from line `start` on.
///
/// Blocks are checked newest first; the newest matching block is reported.
/// A start past the end of the buffer finds nothing.
pub fn scan(buffer: &str, start: usize, marker: &str, cues: &Cues) -> Option<Detection> {
    scan_lines(&content_lines(buffer), start, marker, cues)
}

fn scan_lines(lines: &[String], start: usize, marker: &str, cues: &Cues) -> Option<Detection> {
    if start >= lines.len() {
        return None;
    }
    response_blocks(lines, start, cues)
        .into_iter()
        .rev()
        .find_map(|block| {
            let text = block.lines.join("\n");
            contains_marker(&normalize(&text, marker), marker).then(|| Detection {
                marker: marker.to_string(),
                block: text.trim().to_string(),
                line: block.start,
            })
        })
}

/// Polls a session through the transport until a marker shows up.
pub struct Detector {
    transport: Arc<dyn SessionTransport>,
    cues: Cues,
    poll_interval: Duration,
    tail_lines: usize,
}

impl Detector {
    pub fn new(transport: Arc<dyn SessionTransport>, config: &DetectorConfig) -> Self {
        Self {
            transport,
            cues: Cues::from(config),
            poll_interval: config.poll_interval(),
            tail_lines: config.tail_lines,
        }
    }

    pub fn cues(&self) -> &Cues {
        &self.cues
    }

    async fn read(&self, session: &str) -> Result<String> {
        let transport = Arc::clone(&self.transport);
        let session = session.to_string();
        blocking(move || transport.read(&session, None)).await
    }

    /// Cursor marking the current end of the session's output. Take it
    /// before sending the prompt whose answer you are waiting for.
    pub async fn cursor(&self, session: &str) -> Result<Cursor> {
        Ok(Cursor::at_end(&self.read(session).await?, &self.cues))
    }

    /// Poll until `marker` appears after `cursor`, the timeout passes, or
    /// `cancel` fires. Read failures are logged and polled through.
    ///
    /// The cursor is re-anchored on every poll. If its anchor lines are no
    /// longer in the buffer, only lines past the old index (or past the end,
    /// if the buffer is now shorter) are searched; nothing earlier is ever
    /// rescanned.
    pub async fn watch(
        &self,
        session: &str,
        marker: &str,
        timeout: Duration,
        cursor: &Cursor,
        cancel: &CancellationToken,
    ) -> WatchOutcome {
        clog_debug!(
            "Detector::watch session={} marker={:?} timeout={:?} cursor={}",
            session,
            marker,
            timeout,
            cursor.line
        );
        let deadline = Instant::now() + timeout;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = cursor.clone();
        let mut last_buffer = String::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    clog_debug!("Watch on {} cancelled", session);
                    return WatchOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    clog_debug!("Watch on {} timed out waiting for {:?}", session, marker);
                    return WatchOutcome::Timeout {
                        tail: tail_lines(&strip_ansi(&last_buffer), self.tail_lines),
                    };
                }
                _ = interval.tick() => {}
            }

            let buffer = match self.read(session).await {
                Ok(buffer) => buffer,
                Err(e) => {
                    clog_warn!("Watch read on {} failed: {}", session, e);
                    continue;
                }
            };

            let lines = content_lines(&buffer);
            let start = match cursor.locate(&lines, &self.cues) {
                Some(start) => start,
                None => {
                    let start = cursor.line.min(lines.len());
                    clog_warn!(
                        "Cursor anchor for {} scrolled away, resuming at line {} of {}",
                        session,
                        start,
                        lines.len()
                    );
                    start
                }
            };
            if start != cursor.line {
                clog_trace!("Cursor for {} moved {} -> {}", session, cursor.line, start);
            }
            cursor = Cursor::at(&lines, start, &self.cues);
            clog_trace!("Watch poll {}: {} lines", session, lines.len());

            if let Some(hit) = scan_lines(&lines, start, marker, &self.cues) {
                clog_debug!("Marker {:?} detected in {} at line {}", marker, session, hit.line);
                return WatchOutcome::Detected {
                    marker: hit.marker,
                    block: hit.block,
                };
            }
            last_buffer = buffer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, SessionSpec};
    use std::path::PathBuf;

    fn cues() -> Cues {
        Cues::default()
    }

    #[test]
    fn test_marker_only_in_echo_is_ignored() {
        let buffer = "\
╭──────────────────────────────────────╮
│ > Update the README and end by saying DONE │
╰──────────────────────────────────────╯
";
        assert!(scan(buffer, 0, "DONE", &cues()).is_none());
    }

    #[test]
    fn test_marker_in_response_block_is_detected() {
        let buffer = "\
> Update the README and end by saying DONE
⏺ I'll update the README now.
⏺ Update(README.md)
  ⎿  Updated README.md with 3 additions
⏺ The README is updated.

  DONE
";
        let hit = scan(buffer, 0, "DONE", &cues()).unwrap();
        assert_eq!(hit.line, 4);
        assert!(hit.block.starts_with("The README is updated."));
        assert!(hit.block.ends_with("DONE"));
    }

    #[test]
    fn test_wrapped_echo_continuation_is_not_a_block() {
        let buffer = "\
> Please refactor the parser. When you are completely finished,
  reply with PARSER_DONE on its own line.
⏺ Working on it.
";
        assert!(scan(buffer, 0, "PARSER_DONE", &cues()).is_none());
    }

    #[test]
    fn test_blocks_before_cursor_are_ignored() {
        let buffer = "⏺ Earlier stage finished. DONE\n> next prompt, say DONE\n";
        assert!(scan(buffer, 0, "DONE", &cues()).is_some());
        assert!(scan(buffer, 1, "DONE", &cues()).is_none());
    }

    #[test]
    fn test_input_line_ends_block() {
        let buffer = "⏺ Thinking\n> user typed DONE here\n";
        assert!(scan(buffer, 0, "DONE", &cues()).is_none());
    }

    #[test]
    fn test_marker_must_be_whole_token() {
        assert!(!contains_marker("the task is UNDONE", "DONE"));
        assert!(!contains_marker("DONEFOR now", "DONE"));
        assert!(contains_marker("all good, DONE.", "DONE"));
        assert!(contains_marker("DONE", "DONE"));
    }

    #[test]
    fn test_decoration_stripped_but_marker_characters_kept() {
        assert_eq!(normalize("**DONE**", "DONE"), "DONE");
        assert_eq!(normalize("  status:\n\n  `ok`  ", "DONE"), "status: ok");
        // '#' is decoration unless the marker contains it
        assert_eq!(normalize("## TASK#1", "TASK#1"), "## TASK#1");
        assert!(contains_marker(&normalize("## TASK#1", "TASK#1"), "TASK#1"));
        assert_eq!(normalize("## TASK#1", "DONE"), "TASK 1");
    }

    #[test]
    fn test_ansi_sequences_are_stripped() {
        let buffer = "\x1b[1m⏺\x1b[0m \x1b[32mAll set. DONE\x1b[0m\n";
        let hit = scan(buffer, 0, "DONE", &cues()).unwrap();
        assert_eq!(hit.block, "All set. DONE");
    }

    #[test]
    fn test_newest_matching_block_is_reported() {
        let buffer = "⏺ first DONE\n⏺ unrelated\n⏺ second DONE\n";
        let hit = scan(buffer, 0, "DONE", &cues()).unwrap();
        assert_eq!(hit.block, "second DONE");
    }

    #[test]
    fn test_trailing_blank_lines_do_not_count() {
        assert_eq!(line_count("a\nb\n\n\n   \n"), 2);
        assert_eq!(line_count(""), 0);
    }

    fn detector(transport: Arc<MemoryTransport>) -> Detector {
        let config = DetectorConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };
        Detector::new(transport, &config)
    }

    fn open(transport: &MemoryTransport, name: &str) {
        transport
            .open(&SessionSpec {
                name: name.to_string(),
                cwd: PathBuf::from("/tmp"),
                command: vec!["worker".to_string()],
                env: Vec::new(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_times_out_on_echo_only() {
        let transport = Arc::new(MemoryTransport::new());
        open(&transport, "w");
        let detector = detector(transport.clone());
        let cursor = detector.cursor("w").await.unwrap();
        transport.write("w", "finish and say DONE", true).unwrap();

        let outcome = detector
            .watch("w", "DONE", Duration::from_millis(80), &cursor, &CancellationToken::new())
            .await;
        match outcome {
            WatchOutcome::Timeout { tail } => assert!(tail.contains("finish and say DONE")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_detects_late_response() {
        let transport = Arc::new(MemoryTransport::new());
        open(&transport, "w");
        let detector = detector(transport.clone());
        let cursor = detector.cursor("w").await.unwrap();
        transport.write("w", "finish and say DONE", true).unwrap();

        let writer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.push_output("w", "⏺ Finished everything. DONE");
        });

        let outcome = detector
            .watch("w", "DONE", Duration::from_secs(2), &cursor, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            WatchOutcome::Detected {
                marker: "DONE".to_string(),
                block: "Finished everything. DONE".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_watch_is_cancellable() {
        let transport = Arc::new(MemoryTransport::new());
        open(&transport, "w");
        let detector = detector(transport);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = detector
            .watch("w", "DONE", Duration::from_secs(5), &Cursor::default(), &cancel)
            .await;
        assert_eq!(outcome, WatchOutcome::Cancelled);
    }

    #[test]
    fn test_cursor_follows_anchor_after_top_drop() {
        let cues = cues();
        let before = "> build it\n⏺ built. DONE\nlog a\nlog b\n";
        let cursor = Cursor::at_end(before, &cues);
        assert_eq!(cursor.line(), 4);

        let after = "log a\nlog b\n> now test it, say DONE\n";
        let lines = content_lines(after);
        // The anchor includes lines that were dropped, so it is gone
        assert_eq!(cursor.locate(&lines, &cues), None);

        let cursor = Cursor::at_end("one\ntwo\nthree\nfour\n", &cues);
        let lines = content_lines("three\nfour\n⏺ new\n");
        assert_eq!(cursor.locate(&lines, &cues), None);
        let lines = content_lines("two\nthree\nfour\n⏺ new\n");
        assert_eq!(cursor.locate(&lines, &cues), Some(3));
    }

    #[test]
    fn test_cursor_picks_latest_anchor_not_past_its_line() {
        let cues = cues();
        let cursor = Cursor::at_end("x\ny\nz\nx\ny\nz\n", &cues);
        assert_eq!(cursor.line(), 6);
        // Same three lines repeated after the cursor must not pull it forward
        let lines = content_lines("x\ny\nz\nx\ny\nz\nx\ny\nz\n");
        assert_eq!(cursor.locate(&lines, &cues), Some(6));
        // One line dropped from the top
        let lines = content_lines("y\nz\nx\ny\nz\n⏺ reply\n");
        assert_eq!(cursor.locate(&lines, &cues), Some(5));
    }

    #[test]
    fn test_frame_and_empty_prompt_lines_are_not_anchors() {
        let cues = cues();
        let cursor = Cursor::at_end("⏺ ready\n╭────╮\n│ > │\n╰────╯\n", &cues);
        assert_eq!(cursor.anchor, vec!["⏺ ready".to_string()]);
        assert_eq!(Cursor::at_end("", &cues), Cursor::default());
    }

    /// Given an earlier DONE above the cursor
    /// When history is dropped from the top so the buffer is shorter than
    /// the cursor and the worker never answers
    /// Then the stale DONE is not reported
    #[tokio::test]
    async fn test_stale_marker_not_reported_after_history_drop() {
        let transport = Arc::new(MemoryTransport::new());
        open(&transport, "w");
        for i in 0..5 {
            transport.push_output("w", &format!("setup {}", i));
        }
        transport.push_output("w", "⏺ Stage one finished. DONE");
        transport.push_output("w", "tool output 0");
        transport.push_output("w", "tool output 1");
        let detector = detector(transport.clone());
        let cursor = detector.cursor("w").await.unwrap();
        assert_eq!(cursor.line(), 8);

        transport.write("w", "now write tests, say DONE", true).unwrap();
        transport.drop_history("w", 5);
        let outcome = detector
            .watch("w", "DONE", Duration::from_millis(80), &cursor, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, WatchOutcome::Timeout { .. }), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_reply_found_after_history_drop() {
        let transport = Arc::new(MemoryTransport::new());
        open(&transport, "w");
        for i in 0..10 {
            transport.push_output("w", &format!("line {}", i));
        }
        let detector = detector(transport.clone());
        let cursor = detector.cursor("w").await.unwrap();
        transport.write("w", "finish and say DONE", true).unwrap();
        for i in 0..4 {
            transport.push_output("w", &format!("working {}", i));
        }
        // Still longer than the cursor, but every index has shifted by 3
        transport.drop_history("w", 3);

        let writer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.push_output("w", "⏺ All finished. DONE");
        });
        let outcome = detector
            .watch("w", "DONE", Duration::from_secs(2), &cursor, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            WatchOutcome::Detected {
                marker: "DONE".to_string(),
                block: "All finished. DONE".to_string()
            }
        );
    }

    /// Given a cleared buffer
    /// When the watch starts
    /// Then nothing is rescanned from the top, and later replies still count
    #[tokio::test]
    async fn test_cleared_buffer_is_not_rescanned() {
        let transport = Arc::new(MemoryTransport::new());
        open(&transport, "w");
        for i in 0..5 {
            transport.push_output("w", &format!("noise {}", i));
        }
        let detector = detector(transport.clone());
        let cursor = detector.cursor("w").await.unwrap();
        assert_eq!(cursor.line(), 5);

        transport.clear("w");
        transport.push_output("w", "⏺ replayed old answer. DONE");
        let outcome = detector
            .watch("w", "DONE", Duration::from_millis(80), &cursor, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, WatchOutcome::Timeout { .. }));

        let writer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            writer.push_output("w", "⏺ fresh answer. DONE");
        });
        let outcome = detector
            .watch("w", "DONE", Duration::from_secs(2), &cursor, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            WatchOutcome::Detected {
                marker: "DONE".to_string(),
                block: "fresh answer. DONE".to_string()
            }
        );
    }
}
