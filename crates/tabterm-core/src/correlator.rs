//! Command framing: reconstructs discrete command executions from a tab's output.
//!
//! Two sources feed the correlator:
//! - shell integration events (`CommandStart` / `CommandOutput` / `CommandEnd`),
//!   which are authoritative;
//! - a prompt-pattern heuristic over raw output, used only until the tab's shell
//!   has emitted an integration event.
//!
//! Heuristic framing is inherently ambiguous (multi-line input, prompt-looking
//! program output, full-screen TUIs). Entries it closes carry
//! `Completion::PromptDefault`: their exit code `0` is assumed, not observed.

use crate::output_parser::strip_ansi_codes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tabterm_types::{CommandHistoryEntry, Completion, FramingSource, ShellIntegrationEvent};
use tracing::{debug, trace};
use uuid::Uuid;

/// Maximum output retained per command entry (oldest bytes dropped first).
const MAX_ENTRY_OUTPUT: usize = 256 * 1024;

/// Maximum partial-line length kept by the prompt detector.
const MAX_PARTIAL_LINE: usize = 4096;

/// Prompt shapes recognised by the heuristic. Group 1 is the typed command, if any.
static PROMPT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Bare "$ ls", "# ls", "> ls", "% ls"
        r"^[$#>%](?:\s+(.*))?$",
        // bash/zsh default: "user@host:~/src$ ls", "user@host ~ % ls"
        r"^[\w.-]+@[\w.-]+[: ][^$#%]*[$#%](?:\s+(.*))?$",
        // RHEL style: "[user@host src]$ ls"
        r"^\[[^\]]+\][$#](?:\s+(.*))?$",
        // PowerShell: "PS C:\Users\me> dir"
        r"^PS [A-Za-z]:\\[^>]*>(?:\s+(.*))?$",
        // cmd.exe: "C:\Users\me>dir"
        r"^[A-Za-z]:\\[^>]*>(.*)$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Match a line against the known prompt shapes.
///
/// Returns `Some("")` for a bare prompt, `Some(cmd)` for a prompt followed by a
/// command, `None` for ordinary output.
pub fn match_prompt(line: &str) -> Option<String> {
    let line = line.trim_end();
    PROMPT_PATTERNS.iter().find_map(|re| {
        re.captures(line).map(|caps| {
            caps.get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        })
    })
}

/// What the detector saw in a chunk of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSignal {
    /// A complete line of ordinary output.
    Line(String),
    /// A prompt line followed by a command.
    CommandLine(String),
    /// A prompt with nothing typed after it.
    BarePrompt,
}

/// Line assembler that turns raw output into prompt signals.
#[derive(Debug, Default)]
pub struct PromptDetector {
    partial: String,
    /// A bare prompt was already reported for the current partial line.
    partial_prompt_seen: bool,
}

impl PromptDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw output. Complete lines are classified; a trailing
    /// partial line is reported only when it is a bare prompt (the shell is
    /// waiting for input).
    pub fn feed(&mut self, chunk: &str) -> Vec<PromptSignal> {
        let mut signals = Vec::new();
        self.partial.push_str(chunk);

        while let Some(newline_pos) = self.partial.find('\n') {
            let raw: String = self.partial.drain(..=newline_pos).collect();
            self.partial_prompt_seen = false;
            let line = visible_line(&raw);
            match match_prompt(&line) {
                Some(cmd) if !cmd.is_empty() => signals.push(PromptSignal::CommandLine(cmd)),
                Some(_) => signals.push(PromptSignal::BarePrompt),
                None => signals.push(PromptSignal::Line(line)),
            }
        }

        if self.partial.len() > MAX_PARTIAL_LINE {
            let mut cut = self.partial.len() - MAX_PARTIAL_LINE;
            while !self.partial.is_char_boundary(cut) {
                cut += 1;
            }
            self.partial.drain(..cut);
        }

        if !self.partial_prompt_seen && !self.partial.is_empty() {
            let tail = visible_line(&self.partial);
            if matches!(match_prompt(&tail), Some(cmd) if cmd.is_empty()) {
                self.partial_prompt_seen = true;
                signals.push(PromptSignal::BarePrompt);
            }
        }

        signals
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.partial_prompt_seen = false;
    }
}

/// Printable text of a raw line: ANSI stripped, line ending removed, and only
/// what follows the last carriage return (the terminal overwrote the rest).
fn visible_line(raw: &str) -> String {
    let clean = strip_ansi_codes(raw);
    let clean = clean.trim_end_matches(['\n', '\r']);
    match clean.rfind('\r') {
        Some(pos) => clean[pos + 1..].to_string(),
        None => clean.to_string(),
    }
}

#[derive(Debug, Default)]
struct TabHistory {
    entries: Vec<CommandHistoryEntry>,
    /// Index of the running entry, if any.
    open: Option<usize>,
    detector: PromptDetector,
    /// The shell has emitted integration events; heuristics are off for this tab.
    authoritative: bool,
    /// The shell reports command output itself; raw chunks are not appended.
    integration_output: bool,
    /// An intercepted command was sent and its echo has not come back yet.
    awaiting_echo: bool,
}

impl TabHistory {
    fn open_entry(&self) -> Option<&CommandHistoryEntry> {
        self.open.and_then(|i| self.entries.get(i))
    }

    fn open_entry_mut(&mut self) -> Option<&mut CommandHistoryEntry> {
        match self.open {
            Some(i) => self.entries.get_mut(i),
            None => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        tab_id: Uuid,
        id: Uuid,
        command: &str,
        source: FramingSource,
        intercepted: bool,
        started_at: DateTime<Utc>,
        changed: &mut Vec<CommandHistoryEntry>,
    ) {
        if self.open.is_some() {
            if let Some(prev) = self.close(None, Completion::Superseded, None) {
                debug!(
                    target: "tabterm::correlator",
                    "Command '{}' in tab {} superseded by '{}'",
                    prev.command, tab_id, command
                );
                changed.push(prev);
            }
        }

        let entry = CommandHistoryEntry {
            id,
            tab_id,
            command: command.to_string(),
            output: String::new(),
            exit_code: None,
            started_at,
            duration_ms: None,
            intercepted,
            source,
            completion: None,
        };
        self.entries.push(entry.clone());
        self.open = Some(self.entries.len() - 1);
        self.awaiting_echo = intercepted;
        changed.push(entry);
    }

    fn append(&mut self, text: &str) -> bool {
        let Some(entry) = self.open_entry_mut() else {
            return false;
        };
        entry.output.push_str(text);
        if entry.output.len() > MAX_ENTRY_OUTPUT {
            let mut cut = entry.output.len() - MAX_ENTRY_OUTPUT;
            while !entry.output.is_char_boundary(cut) {
                cut += 1;
            }
            entry.output.drain(..cut);
        }
        true
    }

    fn close(
        &mut self,
        exit_code: Option<i32>,
        completion: Completion,
        reported_duration_ms: Option<u64>,
    ) -> Option<CommandHistoryEntry> {
        self.awaiting_echo = false;
        let index = self.open.take()?;
        let entry = self.entries.get_mut(index)?;
        let elapsed = (Utc::now() - entry.started_at).num_milliseconds().max(0) as u64;
        entry.exit_code = Some(exit_code.unwrap_or(0));
        entry.duration_ms = Some(reported_duration_ms.unwrap_or(elapsed));
        entry.completion = Some(completion);
        Some(entry.clone())
    }
}

/// Per-tab command history and framing state.
#[derive(Default)]
pub struct CommandCorrelator {
    tabs: DashMap<Uuid, TabHistory>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new entry. A still-running entry for the tab is closed first
    /// (completed by supersession). Returns every entry that changed.
    pub fn start_command(
        &self,
        tab_id: Uuid,
        command: &str,
        source: FramingSource,
        intercepted: bool,
    ) -> Vec<CommandHistoryEntry> {
        let mut changed = Vec::new();
        let mut tab = self.tabs.entry(tab_id).or_default();
        tab.start(
            tab_id,
            Uuid::new_v4(),
            command,
            source,
            intercepted,
            Utc::now(),
            &mut changed,
        );
        changed
    }

    /// Append output to the running entry. No-op (returns `false`) if none is open.
    pub fn append_output(&self, tab_id: Uuid, chunk: &str) -> bool {
        self.tabs
            .get_mut(&tab_id)
            .map(|mut tab| tab.append(chunk))
            .unwrap_or(false)
    }

    /// Close the running entry. Without an exit code the appearance of a new
    /// prompt is taken as success: the entry gets `0` and `Completion::PromptDefault`.
    pub fn complete_command(
        &self,
        tab_id: Uuid,
        exit_code: Option<i32>,
    ) -> Option<CommandHistoryEntry> {
        let mut tab = self.tabs.get_mut(&tab_id)?;
        let completion = match exit_code {
            Some(_) => Completion::Reported,
            None => Completion::PromptDefault,
        };
        let entry = tab.close(exit_code, completion, None)?;
        if completion == Completion::PromptDefault {
            debug!(
                target: "tabterm::correlator",
                "Heuristic completion of '{}' in tab {}: exit code assumed 0",
                entry.command, tab_id
            );
        }
        Some(entry)
    }

    /// Feed decoded process output. Returns entries that started or completed.
    pub fn ingest_output(&self, tab_id: Uuid, text: &str) -> Vec<CommandHistoryEntry> {
        let mut changed = Vec::new();
        let mut tab = self.tabs.entry(tab_id).or_default();

        if tab.authoritative {
            if !tab.integration_output {
                tab.append(text);
            }
            return changed;
        }

        let signals = tab.detector.feed(text);
        for signal in signals {
            trace!(target: "tabterm::correlator", "Tab {} signal: {:?}", tab_id, signal);
            match signal {
                PromptSignal::Line(line) => {
                    tab.awaiting_echo = false;
                    if tab.append(&line) {
                        tab.append("\n");
                    }
                }
                PromptSignal::CommandLine(cmd) => {
                    // Shell echo of a command started through the UI
                    let is_echo = tab.awaiting_echo
                        && tab
                            .open_entry()
                            .is_some_and(|open| open.command.trim() == cmd);
                    if is_echo {
                        tab.awaiting_echo = false;
                        continue;
                    }
                    if let Some(prev) = tab.close(None, Completion::PromptDefault, None) {
                        debug!(
                            target: "tabterm::correlator",
                            "Heuristic completion of '{}' in tab {}: exit code assumed 0",
                            prev.command, tab_id
                        );
                        changed.push(prev);
                    }
                    tab.start(
                        tab_id,
                        Uuid::new_v4(),
                        &cmd,
                        FramingSource::Heuristic,
                        false,
                        Utc::now(),
                        &mut changed,
                    );
                }
                PromptSignal::BarePrompt => {
                    // A prompt right after an intercepted command is the prompt the
                    // command was typed at, not its completion
                    if tab.awaiting_echo {
                        continue;
                    }
                    if let Some(prev) = tab.close(None, Completion::PromptDefault, None) {
                        debug!(
                            target: "tabterm::correlator",
                            "Heuristic completion of '{}' in tab {}: exit code assumed 0",
                            prev.command, tab_id
                        );
                        changed.push(prev);
                    }
                }
            }
        }

        changed
    }

    /// Apply an authoritative shell integration event. From the first event on,
    /// heuristic framing is disabled for the tab.
    pub fn apply_integration(
        &self,
        tab_id: Uuid,
        event: &ShellIntegrationEvent,
    ) -> Vec<CommandHistoryEntry> {
        let mut changed = Vec::new();
        let mut tab = self.tabs.entry(tab_id).or_default();
        if !tab.authoritative {
            debug!(target: "tabterm::correlator", "Tab {} switched to shell integration framing", tab_id);
            tab.authoritative = true;
            tab.detector.reset();
        }

        match event {
            ShellIntegrationEvent::CommandStart {
                id,
                command,
                timestamp,
                ..
            } => {
                // Upgrade an entry already opened for the same command (quick
                // command, or the heuristic seeing the line first)
                let upgrade = tab
                    .open_entry()
                    .is_some_and(|open| open.command.trim() == command.trim() && open.output.is_empty());
                if upgrade {
                    if let Some(open) = tab.open_entry_mut() {
                        open.id = *id;
                        open.source = FramingSource::Authoritative;
                        open.started_at = *timestamp;
                        changed.push(open.clone());
                    }
                } else {
                    tab.start(
                        tab_id,
                        *id,
                        command,
                        FramingSource::Authoritative,
                        false,
                        *timestamp,
                        &mut changed,
                    );
                }
            }
            ShellIntegrationEvent::CommandOutput { content, .. } => {
                tab.integration_output = true;
                tab.append(content);
            }
            ShellIntegrationEvent::CommandEnd {
                id,
                exit_code,
                duration_ms,
            } => {
                if let Some(open) = tab.open_entry() {
                    if open.id != *id {
                        debug!(
                            target: "tabterm::correlator",
                            "CommandEnd {} does not match running entry {} in tab {}; closing it anyway",
                            id, open.id, tab_id
                        );
                    }
                }
                match tab.close(Some(*exit_code), Completion::Reported, *duration_ms) {
                    Some(entry) => changed.push(entry),
                    None => debug!(
                        target: "tabterm::correlator",
                        "CommandEnd {} for tab {} with no running command",
                        id, tab_id
                    ),
                }
            }
        }

        changed
    }

    /// Drop all entries for a tab. Framing state (and the live process) is untouched.
    pub fn clear_history(&self, tab_id: Uuid) {
        if let Some(mut tab) = self.tabs.get_mut(&tab_id) {
            tab.entries.clear();
            tab.open = None;
        }
    }

    /// Forget everything about a tab (it was closed).
    pub fn remove_tab(&self, tab_id: Uuid) {
        self.tabs.remove(&tab_id);
    }

    /// History for a tab, oldest first.
    pub fn history(&self, tab_id: Uuid) -> Vec<CommandHistoryEntry> {
        self.tabs
            .get(&tab_id)
            .map(|tab| tab.entries.clone())
            .unwrap_or_default()
    }

    /// The running entry for a tab, if any.
    pub fn running(&self, tab_id: Uuid) -> Option<CommandHistoryEntry> {
        self.tabs.get(&tab_id)?.open_entry().cloned()
    }

    /// Whether the tab's framing comes from shell integration.
    pub fn is_authoritative(&self, tab_id: Uuid) -> bool {
        self.tabs
            .get(&tab_id)
            .map(|tab| tab.authoritative)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn open_count(correlator: &CommandCorrelator, tab_id: Uuid) -> usize {
        correlator
            .history(tab_id)
            .iter()
            .filter(|e| e.exit_code.is_none())
            .count()
    }

    #[test]
    fn test_match_prompt_shapes() {
        assert_eq!(match_prompt("$ ls -la"), Some("ls -la".to_string()));
        assert_eq!(match_prompt("$ "), Some(String::new()));
        assert_eq!(match_prompt("# apt update"), Some("apt update".to_string()));
        assert_eq!(match_prompt("> "), Some(String::new()));
        assert_eq!(
            match_prompt("dev@box:~/src/app$ cargo build"),
            Some("cargo build".to_string())
        );
        assert_eq!(match_prompt("dev@box ~ % "), Some(String::new()));
        assert_eq!(
            match_prompt("[dev@box app]$ make"),
            Some("make".to_string())
        );
        assert_eq!(
            match_prompt(r"PS C:\Users\dev> dir"),
            Some("dir".to_string())
        );
        assert_eq!(match_prompt(r"C:\Users\dev>dir"), Some("dir".to_string()));

        assert_eq!(match_prompt("a.txt b.txt"), None);
        assert_eq!(match_prompt("total 42"), None);
        assert_eq!(match_prompt("$HOME is set"), None);
    }

    #[test]
    fn test_heuristic_command_completion() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        correlator.ingest_output(tab, "$ ls\r\n");
        correlator.ingest_output(tab, "a.txt b.txt\r\n");
        let changed = correlator.ingest_output(tab, "$ ");

        assert_eq!(changed.len(), 1);
        let history = correlator.history(tab);
        assert_eq!(history.len(), 1);
        let entry = &history[0];
        assert_eq!(entry.command, "ls");
        assert_eq!(entry.exit_code, Some(0));
        assert!(entry.output.contains("a.txt b.txt"));
        assert_eq!(entry.source, FramingSource::Heuristic);
        assert_eq!(entry.completion, Some(Completion::PromptDefault));
        assert!(entry.exit_code_assumed());
        assert!(entry.duration_ms.is_some());
    }

    #[test]
    fn test_prompt_with_command_completes_previous() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        correlator.ingest_output(tab, "$ make\r\nbuilding\r\n$ make test\r\nok\r\n");
        let history = correlator.history(tab);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, "make");
        assert_eq!(history[0].exit_code, Some(0));
        assert_eq!(history[0].output, "building\n");
        assert_eq!(history[1].command, "make test");
        assert!(history[1].is_running());
        assert_eq!(open_count(&correlator, tab), 1);
    }

    #[test]
    fn test_typed_command_split_across_chunks() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        // Prompt, then the echo of each keystroke, then enter
        for chunk in ["$ ", "g", "i", "t", " status", "\r\n", "clean\r\n", "$ "] {
            correlator.ingest_output(tab, chunk);
        }
        let history = correlator.history(tab);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "git status");
        assert_eq!(history[0].output, "clean\n");
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[test]
    fn test_ansi_colored_prompt() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        correlator.ingest_output(tab, "\x1b[32mdev@box\x1b[0m:\x1b[34m~\x1b[0m$ pwd\r\n/home/dev\r\n");
        let running = correlator.running(tab).unwrap();
        assert_eq!(running.command, "pwd");
        assert_eq!(running.output, "/home/dev\n");
    }

    #[test]
    fn test_start_supersedes_running_entry() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        correlator.start_command(tab, "vim notes.md", FramingSource::Heuristic, false);
        let changed = correlator.start_command(tab, "ls", FramingSource::Heuristic, false);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].completion, Some(Completion::Superseded));
        assert!(changed[0].duration_ms.is_some());
        assert!(changed[1].is_running());
        assert_eq!(open_count(&correlator, tab), 1);
    }

    #[test]
    fn test_append_and_complete_without_open_entry() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();
        assert!(!correlator.append_output(tab, "stray"));
        assert!(correlator.complete_command(tab, Some(1)).is_none());
        assert!(correlator.history(tab).is_empty());
    }

    #[test]
    fn test_explicit_exit_code_is_reported() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();
        correlator.start_command(tab, "false", FramingSource::Authoritative, false);
        correlator.append_output(tab, "nope");
        let entry = correlator.complete_command(tab, Some(1)).unwrap();
        assert_eq!(entry.exit_code, Some(1));
        assert_eq!(entry.completion, Some(Completion::Reported));
        assert!(!entry.exit_code_assumed());
        assert_eq!(entry.output, "nope");
    }

    #[test]
    fn test_quick_command_echo_is_not_duplicated() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        correlator.ingest_output(tab, "$ ");
        correlator.start_command(tab, "ls", FramingSource::Heuristic, true);
        correlator.ingest_output(tab, "ls\r\n");
        correlator.ingest_output(tab, "a.txt\r\n$ ");

        let history = correlator.history(tab);
        assert_eq!(history.len(), 1);
        assert!(history[0].intercepted);
        assert_eq!(history[0].output, "a.txt\n");
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[test]
    fn test_quick_command_without_output_completes() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();

        correlator.ingest_output(tab, "$ ");
        correlator.start_command(tab, "cd /tmp", FramingSource::Heuristic, true);
        correlator.ingest_output(tab, "cd /tmp\r\n$ ");

        let history = correlator.history(tab);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].output, "");
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[test]
    fn test_integration_events_take_precedence() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();
        let process_id = Uuid::new_v4();
        let cmd_id = Uuid::new_v4();

        correlator.apply_integration(
            tab,
            &ShellIntegrationEvent::CommandStart {
                id: cmd_id,
                command: "cargo test".into(),
                working_directory: None,
                timestamp: Utc::now(),
            },
        );
        // Prompt-looking output no longer frames commands
        correlator.ingest_output(tab, "$ not a command\r\n");
        correlator.apply_integration(
            tab,
            &ShellIntegrationEvent::CommandOutput {
                process_id,
                content: "test result: FAILED\n".into(),
            },
        );
        // Raw chunks are not appended once the shell reports output itself
        correlator.ingest_output(tab, "test result: FAILED\n");
        let changed = correlator.apply_integration(
            tab,
            &ShellIntegrationEvent::CommandEnd {
                id: cmd_id,
                exit_code: 101,
                duration_ms: Some(1500),
            },
        );

        assert_eq!(changed.len(), 1);
        let history = correlator.history(tab);
        assert_eq!(history.len(), 1);
        let entry = &history[0];
        assert_eq!(entry.id, cmd_id);
        assert_eq!(entry.source, FramingSource::Authoritative);
        assert_eq!(entry.exit_code, Some(101));
        assert_eq!(entry.duration_ms, Some(1500));
        assert_eq!(entry.completion, Some(Completion::Reported));
        assert_eq!(entry.output, "$ not a command\r\ntest result: FAILED\n");
        assert!(correlator.is_authoritative(tab));
    }

    #[test]
    fn test_integration_start_upgrades_heuristic_entry() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();
        let cmd_id = Uuid::new_v4();

        correlator.ingest_output(tab, "$ make\r\n");
        correlator.apply_integration(
            tab,
            &ShellIntegrationEvent::CommandStart {
                id: cmd_id,
                command: "make".into(),
                working_directory: None,
                timestamp: Utc::now(),
            },
        );
        let history = correlator.history(tab);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, cmd_id);
        assert_eq!(history[0].source, FramingSource::Authoritative);
    }

    #[test]
    fn test_clear_history() {
        let correlator = CommandCorrelator::new();
        let tab = Uuid::new_v4();
        let other = Uuid::new_v4();
        correlator.start_command(tab, "top", FramingSource::Heuristic, false);
        correlator.start_command(other, "htop", FramingSource::Heuristic, false);

        correlator.clear_history(tab);
        assert!(correlator.history(tab).is_empty());
        assert!(correlator.running(tab).is_none());
        assert_eq!(correlator.history(other).len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(String),
        Append(String),
        Complete(Option<i32>),
        Ingest(String),
        Clear,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(Op::Start),
            "[a-z ]{0,12}".prop_map(Op::Append),
            proptest::option::of(-1i32..3).prop_map(Op::Complete),
            prop_oneof![
                Just("$ ls\r\n".to_string()),
                Just("$ ".to_string()),
                Just("output line\r\n".to_string()),
                Just("# whoami\r\nroot\r\n".to_string()),
                "[a-z$#> \r\n]{0,20}",
            ]
            .prop_map(Op::Ingest),
            Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_running_entry(
            ops in proptest::collection::vec((0usize..2, op_strategy()), 0..60)
        ) {
            let correlator = CommandCorrelator::new();
            let tabs = [Uuid::new_v4(), Uuid::new_v4()];

            for (which, op) in ops {
                let tab = tabs[which];
                match op {
                    Op::Start(cmd) => { correlator.start_command(tab, &cmd, FramingSource::Heuristic, false); }
                    Op::Append(text) => { correlator.append_output(tab, &text); }
                    Op::Complete(code) => { correlator.complete_command(tab, code); }
                    Op::Ingest(chunk) => { correlator.ingest_output(tab, &chunk); }
                    Op::Clear => correlator.clear_history(tab),
                }

                for tab in tabs {
                    let history = correlator.history(tab);
                    let running = history.iter().filter(|e| e.exit_code.is_none()).count();
                    prop_assert!(running <= 1);
                    for entry in &history {
                        prop_assert_eq!(entry.exit_code.is_some(), entry.duration_ms.is_some());
                        prop_assert_eq!(entry.exit_code.is_some(), entry.completion.is_some());
                    }
                }
            }
        }
    }
}
