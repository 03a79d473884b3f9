use std::io::{self, Write};
use std::sync::mpsc;

use crate::session::BuildOutcome;

/// Everything a session reports. For one session the delivery thread emits, in order:
/// `Started`, any number of `Output`, any number of `Note`, then `Completed`. A session
/// that could not spawn emits `StartFailed` and nothing else.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { session: u64, command: String },
    /// Raw subprocess output, verbatim, in arrival order.
    Output { session: u64, text: String },
    /// Synthetic log lines (cleanup removals, the pass/fail banner). Not part of the
    /// parsed output.
    Note { session: u64, text: String },
    Completed { session: u64, outcome: Box<BuildOutcome> },
    StartFailed { session: u64, error: String },
}

impl SessionEvent {
    pub fn session(&self) -> u64 {
        match self {
            SessionEvent::Started { session, .. }
            | SessionEvent::Output { session, .. }
            | SessionEvent::Note { session, .. }
            | SessionEvent::Completed { session, .. }
            | SessionEvent::StartFailed { session, .. } => *session,
        }
    }
}

/// Receives session events. Calls for one session never overlap; calls for different
/// sessions sharing a sink may.
pub trait SessionSink: Send + Sync {
    fn emit(&self, ev: SessionEvent);
}

/// Console sink for the CLI: raw output and notes are written through untouched, followed
/// by a short error list once the session completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink {
    to_stderr: bool,
}

impl StdoutSink {
    /// Routes everything to stderr, leaving stdout free for machine-readable output.
    pub fn stderr() -> Self {
        Self { to_stderr: true }
    }

    fn write_raw(&self, text: &str) {
        // A closed console is not worth failing a build over.
        if self.to_stderr {
            let mut out = io::stderr().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        } else {
            let mut out = io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }
}

impl SessionSink for StdoutSink {
    fn emit(&self, ev: SessionEvent) {
        match ev {
            SessionEvent::Started { command, .. } => self.write_raw(&format!("RUN: {command}\n")),
            SessionEvent::Output { text, .. } | SessionEvent::Note { text, .. } => {
                self.write_raw(&text)
            }
            SessionEvent::Completed { outcome, .. } => {
                let mut summary = String::new();
                if !outcome.records.is_empty() {
                    summary.push_str(&format!("ERRORS ({}):\n", outcome.records.len()));
                    for r in &outcome.records {
                        summary.push_str(&format!(
                            "  {}:{}:{}: {}\n",
                            r.file, r.line, r.column, r.message
                        ));
                    }
                } else if outcome.should_show_log() {
                    summary.push_str("no errors recognised in the output; see the log above\n");
                }
                if outcome.terminated {
                    summary.push_str(&format!("terminated (exit code {})\n", outcome.exit_code));
                }
                self.write_raw(&summary);
            }
            SessionEvent::StartFailed { error, .. } => {
                eprintln!("FAIL: internal error: {error}");
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx }
    }
}

impl SessionSink for ChannelSink {
    fn emit(&self, ev: SessionEvent) {
        let _ = self.tx.send(ev);
    }
}

type OutputFn = Box<dyn Fn(&str) + Send + Sync>;
type CompleteFn = Box<dyn Fn(&BuildOutcome) + Send + Sync>;

/// Adapts plain closures to [`SessionSink`]: `on_output` for each raw chunk,
/// `on_complete` once with the outcome (exit code, full text, records), `on_start_failed`
/// when the interpreter could not be launched. Notes are dropped unless `with_notes` is set.
pub struct CallbackSink {
    on_output: OutputFn,
    on_complete: CompleteFn,
    on_start_failed: OutputFn,
    on_note: Option<OutputFn>,
}

impl CallbackSink {
    pub fn new(
        on_output: impl Fn(&str) + Send + Sync + 'static,
        on_complete: impl Fn(&BuildOutcome) + Send + Sync + 'static,
        on_start_failed: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_output: Box::new(on_output),
            on_complete: Box::new(on_complete),
            on_start_failed: Box::new(on_start_failed),
            on_note: None,
        }
    }

    pub fn with_notes(mut self, on_note: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_note = Some(Box::new(on_note));
        self
    }
}

impl SessionSink for CallbackSink {
    fn emit(&self, ev: SessionEvent) {
        match ev {
            SessionEvent::Started { .. } => {}
            SessionEvent::Output { text, .. } => (self.on_output)(&text),
            SessionEvent::Note { text, .. } => {
                if let Some(f) = self.on_note.as_ref() {
                    f(&text);
                }
            }
            SessionEvent::Completed { outcome, .. } => (self.on_complete)(&outcome),
            SessionEvent::StartFailed { error, .. } => (self.on_start_failed)(&error),
        }
    }
}
