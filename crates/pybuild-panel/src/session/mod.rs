//! Build session controller: runs `<python> -u setup.py <args...>` in the project
//! directory, streams its output to a [`SessionSink`], and harvests errors once it exits.
//!
//! Callers are expected to run one session at a time per panel (the UI disables its build
//! triggers while a session is running); the controller itself does not enforce this.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cleanup::{self, CleanupEvent};
use crate::error::{Error, Result};
use crate::matcher::{self, ErrorRecord, ToolchainFlavor};
use crate::project::{BUILD_DESCRIPTOR, BuildAction, Project};

mod sink;

pub use sink::{CallbackSink, ChannelSink, SessionEvent, SessionSink, StdoutSink};

/// Exit code reported when the OS gives neither a code nor a signal.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// How long output is still collected once the interpreter has been reaped. Background
// processes that inherited the pipes may keep them open far longer.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    #[default]
    None,
    /// Sweep the project directory with the cleanup scanner after the process exits.
    CleanupScan,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project_dir: PathBuf,
    pub interpreter: PathBuf,
    /// The complete child environment; nothing else is inherited.
    pub environment: BTreeMap<String, String>,
    /// Arguments after `setup.py`.
    pub arguments: Vec<String>,
    pub post_action: PostAction,
}

impl BuildRequest {
    pub fn new(project_dir: impl Into<PathBuf>, interpreter: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            interpreter: interpreter.into(),
            environment: BTreeMap::new(),
            arguments: Vec::new(),
            post_action: PostAction::None,
        }
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![
            self.interpreter.display().to_string(),
            "-u".into(),
            BUILD_DESCRIPTOR.into(),
        ];
        parts.extend(self.arguments.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub session: u64,
    pub arguments: Vec<String>,
    pub exit_code: i32,
    /// `terminate()` was called before the process exited.
    pub terminated: bool,
    pub flavor: ToolchainFlavor,
    pub records: Vec<ErrorRecord>,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub output: String,
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// A failed build whose output matched no grammar: the raw log is the only lead.
    pub fn should_show_log(&self) -> bool {
        !self.succeeded() && self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    /// Kill requested; waiting for the process to go away.
    Terminating,
    Finished { exit_code: i32 },
    StartFailed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finished { .. } | SessionState::StartFailed
        )
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    // Process group id while the child is alive; cleared once it has been reaped.
    pgid: Mutex<Option<u32>>,
    terminate_requested: AtomicBool,
}

impl SessionShared {
    fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
            pgid: Mutex::new(None),
            terminate_requested: AtomicBool::new(false),
        }
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut g) = self.state.lock() {
            *g = state;
        }
    }
}

enum Captured {
    Chunk(String),
    Exited(std::io::Result<ExitStatus>),
}

enum SessionEnd {
    Completed(BuildOutcome),
    StartFailed(String),
}

/// Handle to one subprocess invocation. Dropping it does not stop the build.
pub struct BuildSession {
    id: u64,
    command: String,
    shared: Arc<SessionShared>,
    delivery: Option<JoinHandle<SessionEnd>>,
}

impl BuildSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .state
            .lock()
            .map(|g| *g)
            .unwrap_or(SessionState::StartFailed)
    }

    /// True once every event of this session has been delivered.
    pub fn is_finished(&self) -> bool {
        self.delivery.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Force-kills the build's process group. Idempotent; a no-op once the process has
    /// exited or if it never started. Completion is still reported through the sink.
    pub fn terminate(&self) {
        // Held across the kill so the delivery thread cannot clear the id mid-way.
        let Ok(guard) = self.shared.pgid.lock() else {
            return;
        };
        let Some(pgid) = *guard else {
            return;
        };
        if self.shared.terminate_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session = self.id, pgid, "terminating build");
        if let Ok(mut state) = self.shared.state.lock() {
            if *state == SessionState::Running {
                *state = SessionState::Terminating;
            }
        }
        kill_process_tree(pgid);
    }

    /// Blocks until the session has delivered its last event.
    pub fn wait(mut self) -> Result<BuildOutcome> {
        let Some(handle) = self.delivery.take() else {
            return Err(Error::msg(format!("session {} was already awaited", self.id)));
        };
        match handle.join() {
            Ok(SessionEnd::Completed(outcome)) => Ok(outcome),
            Ok(SessionEnd::StartFailed(msg)) => Err(Error::start_failure(msg)),
            Err(panic) => Err(Error::msg(format!(
                "session {} delivery thread panicked: {:?}",
                self.id, panic
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Controller {
    sink: Arc<dyn SessionSink>,
}

impl Controller {
    pub fn new(sink: Arc<dyn SessionSink>) -> Self {
        Self { sink }
    }

    /// Resolves `action` against `project` and starts it.
    pub fn run(&self, project: &Project, action: &BuildAction) -> Result<BuildSession> {
        self.execute(project.request(action)?)
    }

    /// Starts a build session.
    ///
    /// Fails with a configuration error, before anything is spawned, when the project
    /// directory or its `setup.py` is missing. A spawn failure is not an error here: the
    /// returned session reports `StartFailed` through the sink instead.
    pub fn execute(&self, request: BuildRequest) -> Result<BuildSession> {
        if !request.project_dir.is_dir() {
            return Err(Error::config(format!(
                "project directory {} does not exist; open a project first",
                request.project_dir.display()
            )));
        }
        if !request.project_dir.join(BUILD_DESCRIPTOR).is_file() {
            return Err(Error::config(format!(
                "you need to create {BUILD_DESCRIPTOR} in the project directory {} first",
                request.project_dir.display()
            )));
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let command = request.command_line();
        let sink = Arc::clone(&self.sink);

        let mut cmd = Command::new(&request.interpreter);
        cmd.arg("-u")
            .arg(BUILD_DESCRIPTOR)
            .args(&request.arguments)
            .current_dir(&request.project_dir)
            .env_clear()
            .envs(&request.environment)
            // The child gets its own process group; stdin must not stay attached to our TTY.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // On unix: own process group so terminate() also reaches the compilers it forks.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to start {}: {e}", request.interpreter.display());
                tracing::warn!(session = id, command = %command, error = %e, "build failed to start");
                let shared = Arc::new(SessionShared::new(SessionState::StartFailed));
                let delivery = spawn_delivery(id, move || {
                    sink.emit(SessionEvent::StartFailed {
                        session: id,
                        error: msg.clone(),
                    });
                    SessionEnd::StartFailed(msg)
                })?;
                return Ok(BuildSession {
                    id,
                    command,
                    shared,
                    delivery: Some(delivery),
                });
            }
        };

        let pgid = child.id();
        let shared = Arc::new(SessionShared::new(SessionState::Running));
        if let Ok(mut g) = shared.pgid.lock() {
            *g = Some(pgid);
        }
        tracing::info!(session = id, pid = pgid, command = %command, "build started");

        let (tx, rx) = mpsc::channel::<Captured>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || {
                read_output_stream(out, |chunk| tx.send(Captured::Chunk(chunk)).is_ok())
            });
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || {
                read_output_stream(err, |chunk| tx.send(Captured::Chunk(chunk)).is_ok())
            });
        }
        {
            // Reaps the interpreter as soon as it exits, independent of pipe EOF.
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let status = child.wait();
                // Cleared under the lock terminate() holds while killing.
                if let Ok(mut g) = shared.pgid.lock() {
                    *g = None;
                }
                let _ = tx.send(Captured::Exited(status));
            });
        }

        let run = SessionRun {
            id,
            command: command.clone(),
            request,
            shared: Arc::clone(&shared),
            sink,
        };
        let delivery = spawn_delivery(id, move || run.deliver(rx)).inspect_err(|_| {
            kill_process_tree(pgid);
        })?;

        Ok(BuildSession {
            id,
            command,
            shared,
            delivery: Some(delivery),
        })
    }
}

fn spawn_delivery(
    id: u64,
    f: impl FnOnce() -> SessionEnd + Send + 'static,
) -> Result<JoinHandle<SessionEnd>> {
    std::thread::Builder::new()
        .name(format!("pybuild-session-{id}"))
        .spawn(f)
        .map_err(|e| Error::msg(format!("failed to start session thread: {e}")))
}

// State owned by the delivery thread. It is the only caller of the sink for its session.
struct SessionRun {
    id: u64,
    command: String,
    request: BuildRequest,
    shared: Arc<SessionShared>,
    sink: Arc<dyn SessionSink>,
}

impl SessionRun {
    fn deliver(self, rx: mpsc::Receiver<Captured>) -> SessionEnd {
        let started = Instant::now();
        self.sink.emit(SessionEvent::Started {
            session: self.id,
            command: self.command.clone(),
        });

        let mut output = String::new();
        let mut status = None;
        let mut drain_until: Option<Instant> = None;
        loop {
            let msg = match drain_until {
                None => match rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(msg) => msg,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            tracing::debug!(
                                session = self.id,
                                "output pipes still open after exit; finishing without them"
                            );
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            };
            match msg {
                Captured::Chunk(chunk) => {
                    output.push_str(&chunk);
                    self.sink.emit(SessionEvent::Output {
                        session: self.id,
                        text: chunk,
                    });
                }
                Captured::Exited(res) => {
                    status = Some(res);
                    drain_until = Some(Instant::now() + EXIT_DRAIN_GRACE);
                }
            }
        }

        let requested = self.shared.terminate_requested.load(Ordering::SeqCst);
        let (exit_code, terminated) = match status {
            Some(Ok(status)) => (exit_code_of(status), killed_on_request(status, requested)),
            Some(Err(e)) => {
                tracing::warn!(session = self.id, error = %e, "failed to wait for build process");
                (UNKNOWN_EXIT_CODE, requested)
            }
            None => {
                tracing::warn!(session = self.id, "build process was never reaped");
                (UNKNOWN_EXIT_CODE, requested)
            }
        };

        if self.request.post_action == PostAction::CleanupScan {
            self.sweep_project();
        }

        let ok = exit_code == 0;
        self.note(summary_banner(ok, &self.request.arguments));

        let flavor = matcher::detect_flavor(&output);
        let records = matcher::match_errors(&output, flavor);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            session = self.id,
            exit_code,
            terminated,
            records = records.len(),
            flavor = flavor.label(),
            elapsed_ms,
            "build finished"
        );

        let outcome = BuildOutcome {
            session: self.id,
            arguments: self.request.arguments.clone(),
            exit_code,
            terminated,
            flavor,
            records,
            elapsed_ms,
            output,
        };
        self.shared.set_state(SessionState::Finished { exit_code });
        self.sink.emit(SessionEvent::Completed {
            session: self.id,
            outcome: Box::new(outcome.clone()),
        });
        SessionEnd::Completed(outcome)
    }

    fn note(&self, text: String) {
        self.sink.emit(SessionEvent::Note {
            session: self.id,
            text,
        });
    }

    fn sweep_project(&self) {
        let root = &self.request.project_dir;
        let res = cleanup::scan_and_remove(root, |ev| match ev {
            CleanupEvent::Removing(rel) => self.note(format!("Removing {}\n", rel.display())),
            CleanupEvent::Failed { path, error } => {
                self.note(format!("Failed to remove {}: {error}\n", path.display()))
            }
        });
        match res {
            Ok(report) => tracing::info!(
                session = self.id,
                removed = report.removed.len(),
                failed = report.failures.len(),
                "cleanup sweep done"
            ),
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "cleanup sweep aborted");
                self.note(format!("Cleanup failed: {e}\n"));
            }
        }
    }
}

/// The closing log line, e.g. `======== SUCCESS: build_ext -i ========`.
pub fn summary_banner(ok: bool, arguments: &[String]) -> String {
    let bar = "=".repeat(8);
    format!(
        "\n\n{bar} {}: {} {bar}\n",
        if ok { "SUCCESS" } else { "FAILED" },
        arguments.join(" ")
    )
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            // Shell convention: killed by signal N reports 128 + N.
            return 128 + sig;
        }
    }
    UNKNOWN_EXIT_CODE
}

// A terminate() that raced a natural exit must not mark the build as killed.
fn killed_on_request(status: ExitStatus, requested: bool) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        requested && status.signal() == Some(libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        requested
    }
}

fn kill_process_tree(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pgid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

// Forwards output line by line, terminators included, so the joined chunks reproduce the
// stream exactly. Overlong lines are split at MAX_CHUNK_BYTES; a UTF-8 sequence cut by the
// split is held back and completed by the next read. Stops when `emit` returns false.
fn read_output_stream<R: Read>(reader: R, mut emit: impl FnMut(String) -> bool) {
    const MAX_CHUNK_BYTES: u64 = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let mut buf = std::mem::take(&mut pending);
        match r.by_ref().take(MAX_CHUNK_BYTES).read_until(b'\n', &mut buf) {
            Ok(0) => {
                if !buf.is_empty() {
                    emit(String::from_utf8_lossy(&buf).into_owned());
                }
                break;
            }
            Ok(_) => {
                let chunk = match std::str::from_utf8(&buf) {
                    Ok(text) => text.to_owned(),
                    // error_len() is None only for a sequence truncated at the end.
                    Err(e) if e.error_len().is_none() => {
                        pending = buf.split_off(e.valid_up_to());
                        String::from_utf8_lossy(&buf).into_owned()
                    }
                    Err(_) => String::from_utf8_lossy(&buf).into_owned(),
                };
                if !chunk.is_empty() && !emit(chunk) {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => pending = buf,
            Err(_) => {
                if !buf.is_empty() {
                    emit(String::from_utf8_lossy(&buf).into_owned());
                }
                break;
            }
        }
    }
}
