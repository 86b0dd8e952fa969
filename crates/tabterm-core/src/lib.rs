//! Core tab, process and terminal session management for tabterm.

mod correlator;
mod error;
mod manager;
mod output_parser;
mod pipeline;
mod process;
mod pty;
mod reconnect;
mod scheduler;
mod service;
mod store;
mod tabs;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use correlator::{match_prompt, CommandCorrelator, PromptDetector, PromptSignal};
pub use error::{ServiceError, TabtermError};
pub use manager::{SessionManager, SessionManagerConfig};
pub use output_parser::{
    classify, classify_line, Excerpt, OutputClassification, RollingClassifier, Severity,
    DEFAULT_CLASSIFIER_CEILING,
};
pub use pipeline::{ScrollbackBuffer, TerminalView, ViewHandle};
pub use process::ProcessRegistry;
pub use pty::PtyExecutionService;
pub use reconnect::{ConnectionStates, ProbeOutcome};
pub use scheduler::{FlushScheduler, FlushTiming};
pub use service::{ExecutionService, OutputStream, ServiceResult};
pub use store::{SessionStore, StoredTab, DEFAULT_SCROLLBACK_CAP};
pub use tabs::TabRegistry;

/// Result type for tabterm operations.
pub type Result<T> = std::result::Result<T, TabtermError>;
