//! Output stream pipeline: fan-out of process output to views, scrollback,
//! classification, command framing and persistence.

use crate::correlator::CommandCorrelator;
use crate::output_parser::{OutputClassification, RollingClassifier};
use crate::process::ProcessRegistry;
use crate::scheduler::FlushHandle;
use crate::service::OutputStream;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tabterm_types::{
    CommandHistoryEntry, OutputChunk, OutputCounts, ProcessEvent, SessionEvent, SessionSnapshot,
    ShellIntegrationEvent,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Longest partial line kept by the scrollback buffer.
const MAX_PARTIAL_LINE: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Something that renders terminal bytes. Implemented by the presentation layer.
pub trait TerminalView: Send + Sync {
    fn write(&self, data: &[u8]);
}

struct AttachedView {
    id: u64,
    view: Arc<dyn TerminalView>,
    /// Something was written to it, so it already shows this tab's screen.
    written: bool,
}

/// Views attached to one tab.
#[derive(Default)]
pub struct ViewSet {
    views: Mutex<Vec<AttachedView>>,
    next_id: AtomicU64,
}

impl ViewSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, view: Arc<dyn TerminalView>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.views).push(AttachedView {
            id,
            view,
            written: false,
        });
        id
    }

    fn detach(&self, id: u64) {
        lock(&self.views).retain(|attached| attached.id != id);
    }

    /// Write to every attached view, in attach order.
    pub fn write(&self, data: &[u8]) {
        let views: Vec<Arc<dyn TerminalView>> = lock(&self.views)
            .iter_mut()
            .map(|attached| {
                attached.written = true;
                attached.view.clone()
            })
            .collect();
        for view in views {
            view.write(data);
        }
    }

    /// Views nothing has been written to yet. They count as written from now on.
    fn take_unwritten(&self) -> Vec<Arc<dyn TerminalView>> {
        lock(&self.views)
            .iter_mut()
            .filter(|attached| !attached.written)
            .map(|attached| {
                attached.written = true;
                attached.view.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.views).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes a byte stream as UTF-8. A character split across two chunks is
/// held back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk. Invalid sequences become U+FFFD; an incomplete
    /// trailing character is kept for the next call.
    pub fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(data);
        let keep = incomplete_tail(&bytes);
        self.pending = bytes.split_off(bytes.len() - keep);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Length of a UTF-8 character cut off at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        // Skip continuation bytes back to the lead byte
        if bytes[i] & 0xC0 != 0x80 {
            return match std::str::from_utf8(&bytes[i..]) {
                Err(e) if e.error_len().is_none() => bytes.len() - i,
                _ => 0,
            };
        }
    }
    0
}

/// Keeps a view attached to a tab. Dropping it detaches that view only and
/// requests a snapshot flush; the process and its subscription stay alive.
pub struct ViewHandle {
    tab_id: Uuid,
    id: u64,
    views: Arc<ViewSet>,
    flush: Option<FlushHandle>,
}

impl ViewHandle {
    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        self.views.detach(self.id);
        debug!(
            target: "tabterm::pipeline",
            "View {} detached from tab {} ({} remaining)",
            self.id, self.tab_id, self.views.len()
        );
        if let Some(flush) = &self.flush {
            flush.request_flush();
        }
    }
}

/// Bounded line buffer of raw terminal output (escape sequences kept).
#[derive(Debug, Clone)]
pub struct ScrollbackBuffer {
    lines: VecDeque<String>,
    partial: String,
    cap: usize,
}

impl ScrollbackBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.partial.push_str(text);
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());
            self.push_line(line);
        }
        if self.partial.len() > MAX_PARTIAL_LINE {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line);
        }
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() >= self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines oldest first, with the unterminated tail (usually the prompt) last.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            lines.push(self.partial.clone());
        }
        lines
    }

    /// Approximate cursor position `(col, row)` for a `cols x rows` screen.
    pub fn cursor(&self, size: (u16, u16)) -> (u16, u16) {
        let (cols, rows) = size;
        let col = self.partial.chars().count().min(cols.saturating_sub(1) as usize) as u16;
        let row = self.lines.len().min(rows.saturating_sub(1) as usize) as u16;
        (col, row)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}

/// Per-tab output state shared by the pump, the session manager and view handles.
pub struct TabPipeline {
    tab_id: Uuid,
    views: Arc<ViewSet>,
    scrollback: Mutex<ScrollbackBuffer>,
    decoder: Mutex<Utf8Decoder>,
    classifier: Mutex<RollingClassifier>,
    correlator: Arc<CommandCorrelator>,
    events: broadcast::Sender<SessionEvent>,
    flush: Mutex<Option<FlushHandle>>,
    working_directory: Mutex<PathBuf>,
    /// (cols, rows) of the attached views.
    size: Mutex<(u16, u16)>,
    last_activity: Mutex<DateTime<Utc>>,
    /// Output or replay reached this pipeline; snapshots may be written.
    touched: AtomicBool,
}

impl TabPipeline {
    pub fn new(
        tab_id: Uuid,
        working_directory: PathBuf,
        size: (u16, u16),
        scrollback_cap: usize,
        classifier_ceiling: usize,
        correlator: Arc<CommandCorrelator>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            tab_id,
            views: Arc::new(ViewSet::new()),
            scrollback: Mutex::new(ScrollbackBuffer::new(scrollback_cap)),
            decoder: Mutex::new(Utf8Decoder::new()),
            classifier: Mutex::new(RollingClassifier::new(classifier_ceiling)),
            correlator,
            events,
            flush: Mutex::new(None),
            working_directory: Mutex::new(working_directory),
            size: Mutex::new(size),
            last_activity: Mutex::new(Utc::now()),
            touched: AtomicBool::new(false),
        }
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    pub fn set_flush_handle(&self, handle: FlushHandle) {
        *lock(&self.flush) = Some(handle);
    }

    fn flush_handle(&self) -> Option<FlushHandle> {
        lock(&self.flush).clone()
    }

    /// Attach a view. It sees only output produced from now on.
    pub fn attach(&self, view: Arc<dyn TerminalView>) -> ViewHandle {
        let id = self.views.attach(view);
        debug!(target: "tabterm::pipeline", "View {} attached to tab {}", id, self.tab_id);
        ViewHandle {
            tab_id: self.tab_id,
            id,
            views: self.views.clone(),
            flush: self.flush_handle(),
        }
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Handle one chunk: views, scrollback, classifier, correlator, scheduler.
    pub fn process_output(&self, chunk: &OutputChunk) {
        self.views.write(&chunk.data);
        let text = lock(&self.decoder).decode(&chunk.data);
        lock(&self.scrollback).push(&text);

        let counts = {
            let mut classifier = lock(&self.classifier);
            classifier.push(&text);
            classifier.refresh()
        };
        if let Some(counts) = counts {
            let _ = self.events.send(SessionEvent::CountsChanged {
                tab_id: self.tab_id,
                counts,
            });
        }

        let changed = self.correlator.ingest_output(self.tab_id, &text);
        self.publish_commands(changed);
        self.touch();
    }

    pub fn process_integration(&self, event: &ShellIntegrationEvent) {
        if let ShellIntegrationEvent::CommandStart {
            working_directory: Some(dir),
            ..
        } = event
        {
            *lock(&self.working_directory) = dir.clone();
        }
        let changed = self.correlator.apply_integration(self.tab_id, event);
        self.publish_commands(changed);
        self.touch();
    }

    /// Write restored scrollback, line by line, to the views that have not
    /// displayed anything yet. Views already showing this tab's output keep
    /// their screen. The lines replace the scrollback kept for the next snapshot.
    pub fn replay(&self, lines: &[String]) {
        let views = self.views.take_unwritten();
        debug!(
            target: "tabterm::pipeline",
            "Replaying {} lines into {} views of tab {}",
            lines.len(), views.len(), self.tab_id
        );
        let mut scrollback = lock(&self.scrollback);
        scrollback.clear();
        for line in lines {
            let data = format!("{}\r\n", line);
            for view in &views {
                view.write(data.as_bytes());
            }
            scrollback.push(&data);
        }
        drop(scrollback);
        self.touched.store(true, Ordering::SeqCst);
    }

    /// A new output stream begins; bytes held back from the previous one are dropped.
    pub fn begin_stream(&self) {
        lock(&self.decoder).reset();
    }

    /// Restore scrollback without writing it to views (the process survived
    /// and the screen is its own).
    pub fn seed(&self, lines: &[String]) {
        if self.touched.load(Ordering::SeqCst) {
            return;
        }
        let mut scrollback = lock(&self.scrollback);
        for line in lines {
            scrollback.push(&format!("{}\r\n", line));
        }
        drop(scrollback);
        self.touched.store(true, Ordering::SeqCst);
    }

    fn publish_commands(&self, changed: Vec<CommandHistoryEntry>) {
        for entry in changed {
            let _ = self.events.send(SessionEvent::CommandUpdated { entry });
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
        self.touched.store(true, Ordering::SeqCst);
        if let Some(flush) = self.flush_handle() {
            flush.note_activity();
        }
    }

    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::SeqCst)
    }

    pub fn working_directory(&self) -> PathBuf {
        lock(&self.working_directory).clone()
    }

    pub fn set_working_directory(&self, dir: PathBuf) {
        *lock(&self.working_directory) = dir;
    }

    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    pub fn set_size(&self, size: (u16, u16)) {
        *lock(&self.size) = size;
    }

    pub fn counts(&self) -> OutputCounts {
        lock(&self.classifier).counts()
    }

    pub fn classification(&self) -> OutputClassification {
        lock(&self.classifier).classification()
    }

    pub fn scrollback_lines(&self) -> Vec<String> {
        lock(&self.scrollback).lines()
    }

    /// Capture the tab's terminal state.
    pub fn snapshot(
        &self,
        process_id: Option<Uuid>,
        environment: BTreeMap<String, String>,
    ) -> SessionSnapshot {
        let size = self.size();
        let scrollback = lock(&self.scrollback);
        SessionSnapshot {
            tab_id: self.tab_id,
            working_directory: self.working_directory(),
            environment,
            scrollback: scrollback.lines(),
            cursor: scrollback.cursor(size),
            size,
            last_activity: *lock(&self.last_activity),
            process_id,
        }
    }
}

/// Retry policy when an output subscription drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    pub attempts: u32,
    /// Delay before the first attempt; doubles after each failure.
    pub backoff: Duration,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Why a pump stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// The process exited.
    Exited {
        process_id: Uuid,
        exit_code: Option<i32>,
    },
    /// The stream was lost and could not be re-established.
    Disconnected { process_id: Uuid, reason: String },
}

pub type PumpEndFn = Box<dyn FnOnce(PumpEnd) -> BoxFuture<'static, ()> + Send>;

/// The single consumer of one process's output stream. Dropping the pump
/// aborts it, which drops the stream and unsubscribes.
pub struct OutputPump {
    process_id: Uuid,
    task: JoinHandle<()>,
}

impl OutputPump {
    pub fn spawn(
        pipeline: Arc<TabPipeline>,
        registry: Arc<ProcessRegistry>,
        process_id: Uuid,
        stream: OutputStream,
        policy: ResubscribePolicy,
        on_end: PumpEndFn,
    ) -> Self {
        let task = tokio::spawn(async move {
            let end = pump(&pipeline, &registry, process_id, stream, policy).await;
            on_end(end).await;
        });
        Self { process_id, task }
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for OutputPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump(
    pipeline: &TabPipeline,
    registry: &ProcessRegistry,
    process_id: Uuid,
    mut stream: OutputStream,
    policy: ResubscribePolicy,
) -> PumpEnd {
    let tab_id = pipeline.tab_id();
    let mut last_seq: Option<u64> = None;
    pipeline.begin_stream();
    info!(target: "tabterm::pipeline", "Output pump started for tab {} (process {})", tab_id, process_id);

    loop {
        match stream.recv().await {
            Some(ProcessEvent::Output(chunk)) => {
                if let Some(last) = last_seq {
                    if chunk.seq != last + 1 {
                        warn!(
                            target: "tabterm::pipeline",
                            "Output gap for tab {}: expected seq {}, got {}",
                            tab_id, last + 1, chunk.seq
                        );
                    }
                }
                last_seq = Some(chunk.seq);
                trace!(target: "tabterm::pipeline", "Chunk seq {} ({} bytes) for tab {}", chunk.seq, chunk.data.len(), tab_id);
                pipeline.process_output(&chunk);
            }
            Some(ProcessEvent::Integration(event)) => {
                pipeline.process_integration(&event);
            }
            Some(ProcessEvent::Exited { exit_code, .. }) => {
                info!(
                    target: "tabterm::pipeline",
                    "Process {} for tab {} exited with {:?}",
                    process_id, tab_id, exit_code
                );
                registry.mark_stopped(process_id).await;
                return PumpEnd::Exited {
                    process_id,
                    exit_code,
                };
            }
            None => {
                warn!(target: "tabterm::pipeline", "Output stream for tab {} closed, resubscribing", tab_id);
                match resubscribe(registry, process_id, policy).await {
                    Ok(next) => stream = next,
                    Err(end) => return end,
                }
            }
        }
    }
}

async fn resubscribe(
    registry: &ProcessRegistry,
    process_id: Uuid,
    policy: ResubscribePolicy,
) -> Result<OutputStream, PumpEnd> {
    let mut delay = policy.backoff;
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=policy.attempts {
        tokio::time::sleep(delay).await;
        match registry.subscribe(process_id).await {
            Ok(stream) => {
                info!(target: "tabterm::pipeline", "Resubscribed to process {} (attempt {})", process_id, attempt);
                return Ok(stream);
            }
            Err(e) if e.is_stale_process() => {
                info!(target: "tabterm::pipeline", "Process {} is gone: {}", process_id, e);
                return Err(PumpEnd::Exited {
                    process_id,
                    exit_code: None,
                });
            }
            Err(e) => {
                warn!(
                    target: "tabterm::pipeline",
                    "Resubscribe attempt {}/{} for process {} failed: {}",
                    attempt, policy.attempts, process_id, e
                );
                last_error = e.to_string();
            }
        }
        delay *= 2;
    }

    Err(PumpEnd::Disconnected {
        process_id,
        reason: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeExecutionService, RecordingView};
    use std::collections::BTreeMap;
    use tabterm_types::CreateProcessOptions;
    use tokio::sync::oneshot;

    #[test]
    fn test_scrollback_lines_and_partial() {
        let mut buffer = ScrollbackBuffer::new(10);
        buffer.push("one\r\ntw");
        buffer.push("o\r\n$ ");
        assert_eq!(buffer.lines(), vec!["one", "two", "$ "]);
        assert_eq!(buffer.cursor((80, 24)), (2, 2));
    }

    #[test]
    fn test_scrollback_is_bounded() {
        let mut buffer = ScrollbackBuffer::new(3);
        for i in 0..10 {
            buffer.push(&format!("line {}\n", i));
        }
        assert_eq!(buffer.lines(), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_view_handle_detaches_only_its_view() {
        let (events, _) = broadcast::channel(16);
        let pipeline = TabPipeline::new(
            Uuid::new_v4(),
            "/tmp".into(),
            (80, 24),
            100,
            1024,
            Arc::new(CommandCorrelator::new()),
            events,
        );
        let first = RecordingView::new();
        let second = RecordingView::new();
        let h1 = pipeline.attach(Arc::new(first.clone()));
        let _h2 = pipeline.attach(Arc::new(second.clone()));
        assert_eq!(pipeline.view_count(), 2);

        drop(h1);
        assert_eq!(pipeline.view_count(), 1);
        pipeline.process_output(&OutputChunk {
            process_id: Uuid::new_v4(),
            seq: 1,
            data: b"hello".to_vec(),
        });
        assert_eq!(first.contents(), "");
        assert_eq!(second.contents(), "hello");
    }

    fn bare_pipeline() -> TabPipeline {
        let (events, _) = broadcast::channel(16);
        TabPipeline::new(
            Uuid::new_v4(),
            "/tmp".into(),
            (80, 24),
            100,
            1024,
            Arc::new(CommandCorrelator::new()),
            events,
        )
    }

    fn chunk(seq: u64, data: &[u8]) -> OutputChunk {
        OutputChunk {
            process_id: Uuid::new_v4(),
            seq,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_decoder_holds_back_split_character() {
        let bytes = "héllo\n".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo\n");

        // Four-byte character split three ways
        let crab = "🦀".as_bytes();
        assert_eq!(decoder.decode(&crab[..1]), "");
        assert_eq!(decoder.decode(&crab[1..3]), "");
        assert_eq!(decoder.decode(&crab[3..]), "🦀");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        // A stray continuation byte is not held back
        assert_eq!(decoder.decode(&[b'c', 0x80]), "c\u{fffd}");
    }

    #[test]
    fn test_split_character_reaches_scrollback_and_history_intact() {
        let pipeline = bare_pipeline();
        let bytes = "$ echo héllo\r\nhéllo\r\n$ ".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;
        pipeline.process_output(&chunk(1, &bytes[..split]));
        pipeline.process_output(&chunk(2, &bytes[split..]));

        assert_eq!(pipeline.scrollback_lines(), vec!["$ echo héllo", "héllo", "$ "]);
        let history = pipeline.correlator.history(pipeline.tab_id());
        assert_eq!(history[0].command, "echo héllo");
        assert_eq!(history[0].output, "héllo\n");
    }

    #[test]
    fn test_replay_skips_views_showing_output() {
        let pipeline = bare_pipeline();
        let shown = RecordingView::new();
        let _shown = pipeline.attach(Arc::new(shown.clone()));
        pipeline.process_output(&chunk(1, b"UNIQUE-LINE\r\n"));

        let fresh = RecordingView::new();
        let _fresh = pipeline.attach(Arc::new(fresh.clone()));
        pipeline.replay(&pipeline.scrollback_lines());

        assert_eq!(shown.contents().matches("UNIQUE-LINE").count(), 1);
        assert_eq!(fresh.contents(), "UNIQUE-LINE\r\n");
        assert_eq!(pipeline.scrollback_lines(), vec!["UNIQUE-LINE"]);

        // A second replay has nobody left to write to
        pipeline.replay(&pipeline.scrollback_lines());
        assert_eq!(fresh.contents().matches("UNIQUE-LINE").count(), 1);
    }

    struct Harness {
        fake: Arc<FakeExecutionService>,
        pipeline: Arc<TabPipeline>,
        process_id: Uuid,
        view: RecordingView,
        end_rx: oneshot::Receiver<PumpEnd>,
        _pump: OutputPump,
        _handle: ViewHandle,
        events: broadcast::Receiver<SessionEvent>,
    }

    async fn harness(policy: ResubscribePolicy) -> Harness {
        let fake = Arc::new(FakeExecutionService::new());
        let registry = Arc::new(ProcessRegistry::new(fake.clone()));
        let tab_id = Uuid::new_v4();
        let info = registry
            .create(
                tab_id,
                &CreateProcessOptions {
                    shell: "/bin/sh".into(),
                    working_directory: "/tmp".into(),
                    environment: BTreeMap::new(),
                    cols: 80,
                    rows: 24,
                },
            )
            .await
            .unwrap();
        let (tx, events) = broadcast::channel(256);
        let pipeline = Arc::new(TabPipeline::new(
            tab_id,
            "/tmp".into(),
            (80, 24),
            1000,
            4096,
            Arc::new(CommandCorrelator::new()),
            tx,
        ));
        let view = RecordingView::new();
        let handle = pipeline.attach(Arc::new(view.clone()));
        let stream = registry.subscribe(info.id).await.unwrap();
        let (end_tx, end_rx) = oneshot::channel();
        let pump = OutputPump::spawn(
            pipeline.clone(),
            registry,
            info.id,
            stream,
            policy,
            Box::new(move |end| {
                Box::pin(async move {
                    let _ = end_tx.send(end);
                })
            }),
        );
        Harness {
            fake,
            pipeline,
            process_id: info.id,
            view,
            end_rx,
            _pump: pump,
            _handle: handle,
            events,
        }
    }

    #[tokio::test]
    async fn test_output_order_preserved() {
        let h = harness(ResubscribePolicy::default()).await;
        let expected: Vec<Vec<u8>> = (0..200).map(|i| format!("chunk-{}\n", i).into_bytes()).collect();
        for chunk in &expected {
            assert!(h.fake.emit_output(h.process_id, chunk));
        }

        eventually(|| h.view.writes().len() == expected.len()).await;
        assert_eq!(h.view.writes(), expected);
        let lines = h.pipeline.scrollback_lines();
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[0], "chunk-0");
        assert_eq!(lines[199], "chunk-199");
    }

    #[tokio::test]
    async fn test_counts_and_commands_are_published() {
        let mut h = harness(ResubscribePolicy::default()).await;
        h.fake.emit_output(h.process_id, b"$ make\r\nerror: boom\r\n$ ");

        let mut saw_counts = false;
        let mut saw_command = false;
        while !(saw_counts && saw_command) {
            match tokio::time::timeout(Duration::from_secs(2), h.events.recv()).await {
                Ok(Ok(SessionEvent::CountsChanged { counts, .. })) => {
                    assert_eq!(counts.errors, 1);
                    saw_counts = true;
                }
                Ok(Ok(SessionEvent::CommandUpdated { entry })) => {
                    assert_eq!(entry.command, "make");
                    saw_command = true;
                }
                Ok(Ok(_)) => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(h.pipeline.counts().errors, 1);
    }

    #[tokio::test]
    async fn test_exit_ends_pump() {
        let h = harness(ResubscribePolicy::default()).await;
        h.fake.emit_exit(h.process_id, Some(3));
        let end = tokio::time::timeout(Duration::from_secs(2), h.end_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            end,
            PumpEnd::Exited {
                process_id: h.process_id,
                exit_code: Some(3)
            }
        );
    }

    #[tokio::test]
    async fn test_lost_stream_is_resubscribed() {
        let h = harness(ResubscribePolicy {
            attempts: 3,
            backoff: Duration::from_millis(5),
        })
        .await;
        h.fake.drop_subscription(h.process_id);
        eventually(|| h.fake.has_subscriber(h.process_id)).await;

        h.fake.emit_output(h.process_id, b"after\n");
        eventually(|| h.view.contents().contains("after")).await;
    }

    #[tokio::test]
    async fn test_resubscribe_exhaustion_disconnects() {
        let h = harness(ResubscribePolicy {
            attempts: 2,
            backoff: Duration::from_millis(5),
        })
        .await;
        h.fake.set_fail_subscribe(true);
        h.fake.drop_subscription(h.process_id);

        let end = tokio::time::timeout(Duration::from_secs(2), h.end_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, PumpEnd::Disconnected { .. }));
    }
}
