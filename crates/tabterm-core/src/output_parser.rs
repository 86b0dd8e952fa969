//! Error/warning/info classification of terminal output.
//!
//! `classify` is a pure function over a text buffer. `RollingClassifier` keeps a
//! bounded tail of a tab's output and classifies each line once as it completes,
//! so memory and per-chunk work stay constant no matter how long the session runs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use tabterm_types::OutputCounts;

/// Default ceiling for the rolling buffer (64KB).
pub const DEFAULT_CLASSIFIER_CEILING: usize = 64 * 1024;

/// Maximum number of excerpts returned by `classify`.
const MAX_EXCERPTS: usize = 20;

/// Maximum excerpt length in characters.
const MAX_EXCERPT_LEN: usize = 200;

/// Comprehensive regex for ANSI escape sequences.
/// Matches:
/// - CSI sequences: ESC [ ... letter (colors, cursor, etc.)
/// - OSC sequences: ESC ] ... BEL or ESC \ (window title, shell integration, etc.)
/// - Character set: ESC ( or ESC ) followed by character
/// - Other escapes: ESC = ESC > ESC M etc.
static ANSI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[A-Za-z]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()][A-Z0-9]",
        r"|\x1b[=>MNOP78]",
        r"|\x1b",
    ))
    .unwrap()
});

static ERROR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\berror(\[\w+\])?[:\s]|\bfatal\b|\bpanic(ked)?\b|\bexception\b|\btraceback\b|\bfailed\b|\bsegmentation fault\b|command not found|permission denied|no such file or directory)",
    )
    .unwrap()
});

static WARNING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\bwarn(ing)?\b|\bdeprecat(ed|ion)\b)").unwrap());

static INFO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\binfo\b|\bnote:|\bhint:)").unwrap());

/// Strip ANSI escape codes from text.
pub(crate) fn strip_ansi_codes(text: &str) -> String {
    ANSI_REGEX.replace_all(text, "").to_string()
}

/// Severity of a classified line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A classified line kept for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excerpt {
    pub severity: Severity,
    pub line: String,
}

/// Result of classifying a text buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputClassification {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
    /// Most recent error and warning lines, oldest first.
    pub excerpts: Vec<Excerpt>,
}

impl OutputClassification {
    pub fn counts(&self) -> OutputCounts {
        OutputCounts {
            errors: self.errors,
            warnings: self.warnings,
            infos: self.infos,
        }
    }
}

/// Classify a single line. Error wins over warning, warning over info.
pub fn classify_line(line: &str) -> Option<Severity> {
    if ERROR_PATTERN.is_match(line) {
        Some(Severity::Error)
    } else if WARNING_PATTERN.is_match(line) {
        Some(Severity::Warning)
    } else if INFO_PATTERN.is_match(line) {
        Some(Severity::Info)
    } else {
        None
    }
}

/// Classify a raw output buffer. Never fails: unparseable input yields zero counts.
pub fn classify(text: &str) -> OutputClassification {
    let clean = strip_ansi_codes(text);
    let mut result = OutputClassification::default();

    for line in clean.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(severity) = classify_line(line) else {
            continue;
        };
        match severity {
            Severity::Error => result.errors += 1,
            Severity::Warning => result.warnings += 1,
            Severity::Info => result.infos += 1,
        }
        if severity != Severity::Info {
            result.excerpts.push(Excerpt {
                severity,
                line: truncate_str(line, MAX_EXCERPT_LEN),
            });
        }
    }

    if result.excerpts.len() > MAX_EXCERPTS {
        let drop = result.excerpts.len() - MAX_EXCERPTS;
        result.excerpts.drain(..drop);
    }

    result
}

/// Severity and display text of one raw line, if it classifies at all.
fn classify_raw_line(raw: &str) -> Option<(Severity, String)> {
    let clean = strip_ansi_codes(raw);
    let line = clean.trim();
    if line.is_empty() {
        return None;
    }
    classify_line(line).map(|severity| (severity, truncate_str(line, MAX_EXCERPT_LEN)))
}

#[derive(Debug)]
struct RetainedLine {
    /// Bytes of raw output the line occupied, newline included.
    len: usize,
    class: Option<(Severity, String)>,
}

fn add_count(counts: &mut OutputCounts, severity: Severity) {
    match severity {
        Severity::Error => counts.errors += 1,
        Severity::Warning => counts.warnings += 1,
        Severity::Info => counts.infos += 1,
    }
}

fn remove_count(counts: &mut OutputCounts, severity: Severity) {
    match severity {
        Severity::Error => counts.errors = counts.errors.saturating_sub(1),
        Severity::Warning => counts.warnings = counts.warnings.saturating_sub(1),
        Severity::Info => counts.infos = counts.infos.saturating_sub(1),
    }
}

/// Rolling window over a tab's output, classified line by line as lines
/// complete. Counts of evicted lines are subtracted, so each byte is classified
/// once and memory stays bounded by the ceiling.
#[derive(Debug)]
pub struct RollingClassifier {
    lines: VecDeque<RetainedLine>,
    /// Bytes held by `lines`.
    lines_len: usize,
    /// Unterminated last line; classified on refresh.
    partial: String,
    ceiling: usize,
    /// Counts over `lines` only.
    line_counts: OutputCounts,
    /// Counts reported by the last `refresh`.
    counts: OutputCounts,
    dirty: bool,
}

impl RollingClassifier {
    pub fn new(ceiling: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            lines_len: 0,
            partial: String::new(),
            ceiling: ceiling.max(1),
            line_counts: OutputCounts::default(),
            counts: OutputCounts::default(),
            dirty: false,
        }
    }

    /// Append decoded output, dropping the oldest lines past the ceiling.
    pub fn push(&mut self, text: &str) {
        self.partial.push_str(text);
        while let Some(pos) = self.partial.find('\n') {
            let raw: String = self.partial.drain(..=pos).collect();
            let class = classify_raw_line(&raw);
            if let Some((severity, _)) = &class {
                add_count(&mut self.line_counts, *severity);
            }
            self.lines_len += raw.len();
            self.lines.push_back(RetainedLine {
                len: raw.len(),
                class,
            });
        }

        while self.buffered_len() > self.ceiling {
            let Some(line) = self.lines.pop_front() else {
                break;
            };
            self.lines_len -= line.len;
            if let Some((severity, _)) = line.class {
                remove_count(&mut self.line_counts, severity);
            }
        }
        if self.partial.len() > self.ceiling {
            let mut cut = self.partial.len() - self.ceiling;
            while !self.partial.is_char_boundary(cut) {
                cut += 1;
            }
            self.partial.drain(..cut);
        }
        self.dirty = true;
    }

    /// Current counts over the retained window. Returns `Some` only when they changed.
    pub fn refresh(&mut self) -> Option<OutputCounts> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let mut counts = self.line_counts;
        if let Some((severity, _)) = classify_raw_line(&self.partial) {
            add_count(&mut counts, severity);
        }
        if counts != self.counts {
            self.counts = counts;
            Some(counts)
        } else {
            None
        }
    }

    pub fn counts(&self) -> OutputCounts {
        self.counts
    }

    /// Full classification (with excerpts) of the retained window.
    pub fn classification(&self) -> OutputClassification {
        let mut result = OutputClassification::default();
        let partial = classify_raw_line(&self.partial);
        let classes = self
            .lines
            .iter()
            .filter_map(|line| line.class.as_ref())
            .chain(partial.as_ref());
        for (severity, line) in classes {
            match severity {
                Severity::Error => result.errors += 1,
                Severity::Warning => result.warnings += 1,
                Severity::Info => result.infos += 1,
            }
            if *severity != Severity::Info {
                result.excerpts.push(Excerpt {
                    severity: *severity,
                    line: line.clone(),
                });
            }
        }
        if result.excerpts.len() > MAX_EXCERPTS {
            let drop = result.excerpts.len() - MAX_EXCERPTS;
            result.excerpts.drain(..drop);
        }
        result
    }

    pub fn buffered_len(&self) -> usize {
        self.lines_len + self.partial.len()
    }

    pub fn reset(&mut self) {
        self.lines.clear();
        self.lines_len = 0;
        self.partial.clear();
        self.line_counts = OutputCounts::default();
        self.counts = OutputCounts::default();
        self.dirty = false;
    }
}

impl Default for RollingClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSIFIER_CEILING)
    }
}

/// Truncate a string to a maximum number of characters with ellipsis.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
