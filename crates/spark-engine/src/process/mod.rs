//! Handle around one external helper process.
//!
//! A spawned helper is observed through an [`EventPublisher`]: stdout lines
//! (or raw chunks in [`StreamMode::Binary`]), stderr lines, at most one
//! failure and exactly one final [`ProcessEvent::Close`]. Completion waits
//! for both output streams to drain *and* the exit status, in whichever order
//! they arrive.

mod error;
mod publisher;

pub use error::{parse_traceback, ProcessError, Traceback};
pub use publisher::{EventPublisher, Subscription, SubscriptionId};

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use crate::line_splitter::{LineSplitter, LINE_SEPARATOR};

/// Interpreter flag that disables Python's output buffering.
pub const UNBUFFERED_FLAG: &str = "-u";
const READ_CHUNK: usize = 8 * 1024;
/// How much trailing stderr is kept for exit classification.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum KillSignal {
    #[default]
    Term,
    Kill,
    Interrupt,
}

impl KillSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Interrupt => "SIGINT",
        }
    }
}

/// What to run: `program [program_args...] [script] [args...]`.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
    pub mode: StreamMode,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// A Python helper run unbuffered so its lines arrive as they are printed.
    pub fn python_script(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: interpreter.into(),
            program_args: vec![UNBUFFERED_FLAG.to_string()],
            script: Some(script.into()),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            ..Default::default()
        }
    }

    pub fn program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Everything passed after `program`.
    pub fn command_args(&self) -> Vec<String> {
        let mut out = self.program_args.clone();
        if let Some(script) = &self.script {
            out.push(script.display().to_string());
        }
        out.extend(self.args.iter().cloned());
        out
    }

    /// The script when there is one, otherwise the program itself.
    pub fn executable(&self) -> PathBuf {
        self.script.clone().unwrap_or_else(|| self.program.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Message(String),
    Data(Vec<u8>),
    Stderr(String),
    Error(Arc<ProcessError>),
    Close(ExitOutcome),
}

pub type ProcessResult = Result<(), Arc<ProcessError>>;
type FinishCallback = Box<dyn FnOnce(ProcessResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Lifecycle {
    stdout_done: bool,
    stderr_done: bool,
    exit: Option<ExitOutcome>,
    stderr_text: String,
    on_finish: Option<FinishCallback>,
    result: Option<ProcessResult>,
}

struct Shared {
    executable: PathBuf,
    args: Vec<String>,
    events: EventPublisher<ProcessEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn chunk(&self, source: Stream, mode: StreamMode, bytes: &[u8], splitter: &mut LineSplitter) {
        if source == Stream::Stdout && mode == StreamMode::Binary {
            self.events.emit(ProcessEvent::Data(bytes.to_vec()));
            return;
        }
        for line in splitter.push(bytes) {
            self.line(source, line);
        }
    }

    fn line(&self, source: Stream, line: String) {
        match source {
            Stream::Stdout => {
                self.events.emit(ProcessEvent::Message(line));
            }
            Stream::Stderr => {
                {
                    let mut lc = self.lifecycle();
                    lc.stderr_text.push_str(&line);
                    lc.stderr_text.push('\n');
                    keep_tail(&mut lc.stderr_text, STDERR_TAIL_BYTES);
                }
                self.events.emit(ProcessEvent::Stderr(line));
            }
        }
    }

    fn stream_ended(&self, source: Stream) {
        let mut lc = self.lifecycle();
        match source {
            Stream::Stdout => lc.stdout_done = true,
            Stream::Stderr => lc.stderr_done = true,
        }
        self.settle(lc);
    }

    fn exited(&self, outcome: ExitOutcome) {
        let mut lc = self.lifecycle();
        lc.exit = Some(outcome);
        self.settle(lc);
    }

    fn settle(&self, mut lc: MutexGuard<'_, Lifecycle>) {
        if lc.result.is_some() || !lc.stdout_done || !lc.stderr_done {
            return;
        }
        let Some(outcome) = lc.exit else {
            return;
        };
        let result: ProcessResult = match outcome.code {
            Some(code) if code != 0 => Err(Arc::new(error::exit_error(
                self.executable.clone(),
                self.args.clone(),
                code,
                &lc.stderr_text,
            ))),
            _ => Ok(()),
        };
        lc.result = Some(result.clone());
        let on_finish = lc.on_finish.take();
        drop(lc);

        match on_finish {
            Some(cb) => cb(result),
            None => {
                if let Err(e) = result {
                    self.events.emit(ProcessEvent::Error(e));
                }
            }
        }
        self.events.emit(ProcessEvent::Close(outcome));
    }
}

/// Drops whole leading lines until `buf` fits in `max` bytes. A single line
/// longer than `max` is cut at a char boundary instead.
fn keep_tail(buf: &mut String, max: usize) {
    if buf.len() <= max {
        return;
    }
    let mut cut = buf.len() - max;
    while !buf.is_char_boundary(cut) {
        cut += 1;
    }
    if cut > 0 && buf.as_bytes()[cut - 1] != b'\n' {
        if let Some(nl) = buf[cut..].find('\n') {
            if cut + nl + 1 < buf.len() {
                cut += nl + 1;
            }
        }
    }
    buf.drain(..cut);
}

pub struct ProcessHandle {
    shared: Arc<Shared>,
    mode: StreamMode,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    control: Option<UnboundedSender<KillSignal>>,
}

impl ProcessHandle {
    /// Starts the process. The returned subscription is registered before the
    /// spawn, so it observes every event including a spawn failure (which is
    /// reported as `Error` followed by `Close`). Must be called inside a
    /// tokio runtime.
    pub fn spawn(spec: ProcessSpec) -> (Self, Subscription<ProcessEvent>) {
        let shared = Arc::new(Shared {
            executable: spec.executable(),
            args: spec.args.clone(),
            events: EventPublisher::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        });
        let subscription = shared.events.subscribe();

        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        match cmd.spawn() {
            Ok(child) => (Self::attach(shared, spec.mode, child), subscription),
            Err(source) => {
                let err = Arc::new(ProcessError::Spawn {
                    executable: spec.program.clone(),
                    source,
                });
                shared.lifecycle().result = Some(Err(err.clone()));
                shared.events.emit(ProcessEvent::Error(err));
                shared.events.emit(ProcessEvent::Close(ExitOutcome::default()));
                let handle = Self {
                    shared,
                    mode: spec.mode,
                    pid: None,
                    stdin: tokio::sync::Mutex::new(None),
                    control: None,
                };
                (handle, subscription)
            }
        }
    }

    fn attach(shared: Arc<Shared>, mode: StreamMode, mut child: Child) -> Self {
        let pid = child.id();
        let stdin = child.stdin.take();
        match child.stdout.take() {
            Some(out) => spawn_reader(shared.clone(), out, Stream::Stdout, mode),
            None => shared.stream_ended(Stream::Stdout),
        }
        match child.stderr.take() {
            Some(err) => spawn_reader(shared.clone(), err, Stream::Stderr, mode),
            None => shared.stream_ended(Stream::Stderr),
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(wait_for_exit(shared.clone(), child, rx));
        Self {
            shared,
            mode,
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            control: Some(tx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn subscribe(&self) -> Subscription<ProcessEvent> {
        self.shared.events.subscribe()
    }

    /// True once `Close` has been (or is being) delivered.
    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle().result.is_some()
    }

    /// Writes one message. Text mode appends the platform line terminator.
    pub async fn send(&self, message: impl AsRef<[u8]>) -> Result<(), ProcessError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::StdinClosed)?;
        stdin.write_all(message.as_ref()).await?;
        if self.mode == StreamMode::Text {
            stdin.write_all(LINE_SEPARATOR.as_bytes()).await?;
        }
        stdin.flush().await?;
        Ok(())
    }

    pub async fn close_stdin(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Closes stdin and registers the completion callback. While a callback
    /// is registered an exit failure goes to it instead of being broadcast
    /// as `Error`. Registering after completion invokes it immediately.
    pub async fn end(&self, on_finish: impl FnOnce(ProcessResult) + Send + 'static) {
        self.close_stdin().await;
        let mut lc = self.shared.lifecycle();
        let finished = lc.result.clone();
        match finished {
            Some(result) => {
                drop(lc);
                on_finish(result);
            }
            None => lc.on_finish = Some(Box::new(on_finish)),
        }
    }

    /// Delivers `signal` (default [`KillSignal::Term`]). Returns false when
    /// the process has already exited or never started.
    pub fn kill(&self, signal: Option<KillSignal>) -> bool {
        {
            let lc = self.shared.lifecycle();
            if lc.exit.is_some() || lc.result.is_some() {
                return false;
            }
        }
        self.control
            .as_ref()
            .is_some_and(|tx| tx.send(signal.unwrap_or_default()).is_ok())
    }
}

fn spawn_reader(
    shared: Arc<Shared>,
    mut stream: impl AsyncRead + Unpin + Send + 'static,
    source: Stream,
    mode: StreamMode,
) {
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => shared.chunk(source, mode, &buf[..n], &mut splitter),
                Err(_) => break,
            }
        }
        if let Some(tail) = splitter.finish() {
            shared.line(source, tail);
        }
        shared.stream_ended(source);
    });
}

async fn wait_for_exit(
    shared: Arc<Shared>,
    mut child: Child,
    mut control: UnboundedReceiver<KillSignal>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = control.recv() => {
                if let Err(e) = deliver_signal(&mut child, signal) {
                    spark_observability::safe_eprintln!(
                        "process: {} to pid {:?} failed: {e}",
                        signal.as_str(),
                        child.id()
                    );
                }
            }
        }
    };
    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status),
        Err(e) => {
            shared
                .events
                .emit(ProcessEvent::Error(Arc::new(ProcessError::Io(e))));
            ExitOutcome::default()
        }
    };
    shared.exited(outcome);
}

#[cfg(unix)]
fn deliver_signal(child: &mut Child, signal: KillSignal) -> std::io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let sig = match signal {
        KillSignal::Term => Signal::SIGTERM,
        KillSignal::Kill => Signal::SIGKILL,
        KillSignal::Interrupt => Signal::SIGINT,
    };
    match kill(Pid::from_raw(pid as i32), sig) {
        // Already gone; the pending wait() reports the exit.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::other(e)),
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, _signal: KillSignal) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_script_runs_unbuffered_with_flag_before_script() {
        let spec = ProcessSpec::python_script("/usr/bin/python3", "/b/host.py").args(["--model", "m"]);
        assert_eq!(
            spec.command_args(),
            vec!["-u", "/b/host.py", "--model", "m"]
        );
        assert_eq!(spec.executable(), PathBuf::from("/b/host.py"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "1"));
    }

    #[test]
    fn keep_tail_drops_whole_leading_lines() {
        let mut buf = "aaaa\nbbbb\ncccc\n".to_string();
        keep_tail(&mut buf, 12);
        assert_eq!(buf, "bbbb\ncccc\n");

        let mut short = "ok\n".to_string();
        keep_tail(&mut short, 12);
        assert_eq!(short, "ok\n");

        let mut long = "é".repeat(10);
        keep_tail(&mut long, 5);
        assert!(long.len() <= 5);
        assert!(long.chars().all(|c| c == 'é'));
    }

    #[test]
    fn interpreter_flags_can_be_cleared() {
        let spec = ProcessSpec::python_script("sh", "x.sh").program_args(Vec::<String>::new());
        assert_eq!(spec.command_args(), vec!["x.sh"]);
    }
}
