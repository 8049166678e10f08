use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::{Map, Value};

const DEFAULT_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_MAX_FILES: usize = 5;
const BACKTRACE_MAX_CHARS: usize = 12_000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn env_flag(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !matches!(t.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Trace settings, read from `SPARK_TRACE_*` on every write so tests and
/// long-running sessions can flip them without a restart.
#[derive(Debug, Clone, Copy)]
struct TraceConfig {
    enabled: bool,
    backtrace: bool,
    max_bytes: u64,
    max_files: usize,
}

impl TraceConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_flag("SPARK_TRACE_ENABLED"),
            backtrace: env_flag("SPARK_TRACE_BACKTRACE"),
            max_bytes: env_parse("SPARK_TRACE_MAX_BYTES", DEFAULT_MAX_BYTES),
            max_files: env_parse("SPARK_TRACE_MAX_FILES", DEFAULT_MAX_FILES),
        }
    }
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

fn rotated_path(data_dir: &Path, n: usize) -> PathBuf {
    data_dir.join(format!("trace.jsonl.{n}"))
}

fn rotate_if_needed(data_dir: &Path, cfg: &TraceConfig) {
    if cfg.max_files == 0 {
        return;
    }
    let current = trace_path(data_dir);
    let len = match std::fs::metadata(&current) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if len <= cfg.max_bytes {
        return;
    }

    // Drop the oldest first; rename onto an existing file fails on Windows.
    let _ = std::fs::remove_file(rotated_path(data_dir, cfg.max_files));
    for i in (1..cfg.max_files).rev() {
        let src = rotated_path(data_dir, i);
        if src.exists() {
            let _ = std::fs::rename(&src, rotated_path(data_dir, i + 1));
        }
    }
    let _ = std::fs::rename(&current, rotated_path(data_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    let cfg = TraceConfig::from_env();
    if !cfg.enabled {
        return;
    }
    let mut line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };
    line.push('\n');

    let _guard = write_lock().lock().unwrap_or_else(|p| p.into_inner());
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed(data_dir, &cfg);

    let p = trace_path(data_dir);
    let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
        Ok(f) => f,
        Err(e) => {
            crate::safe_eprintln!("trace: open failed: {}: {e}", p.display());
            return;
        }
    };
    if let Err(e) = f.write_all(line.as_bytes()) {
        crate::safe_eprintln!("trace: write failed: {e}");
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

// Replaces the user-name segment after common home-dir prefixes.
fn redact_home_dirs(s: &str) -> String {
    fn scrub(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let tail = &rest[pos + marker.len()..];
            let end = tail.find(sep).unwrap_or(tail.len());
            rest = &tail[end..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub(s, "\\Users\\", '\\');
    let t = scrub(&t, "/Users/", '/');
    scrub(&t, "/home/", '/')
}

fn backtrace_string(cfg: &TraceConfig) -> Option<String> {
    if !cfg.backtrace {
        return None;
    }
    let bt = std::backtrace::Backtrace::force_capture();
    Some(clamp_chars(
        &redact_home_dirs(&format!("{bt:?}")),
        BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(mut base: Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => {}
        Some(Value::Object(m)) => base.extend(m),
        Some(v) => {
            base.insert("extra".to_string(), v);
        }
    }
    Value::Object(base)
}

fn error_ctx(err: Option<&AnyhowError>, extra: Option<Value>) -> Option<Value> {
    let cfg = TraceConfig::from_env();
    let mut m = Map::new();
    if let Some(err) = err {
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        m.insert("err_chain".to_string(), Value::from(chain));
    }
    if let Some(bt) = backtrace_string(&cfg) {
        m.insert("backtrace".to_string(), Value::from(bt));
    }
    if m.is_empty() {
        return extra;
    }
    Some(merge_ctx(m, extra))
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String, // io|process|parse|db|logic
    pub code: String, // E_*
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub task_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn event(
    data_dir: &Path,
    task_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            task_id: task_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// A timed trace step. Exactly one `end` record is written: by `ok`/`err`/
/// `skipped`, or as `aborted` when the span is dropped unfinished.
pub struct Span {
    data_dir: PathBuf,
    task_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        task_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            data_dir: data_dir.to_path_buf(),
            task_id: task_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.write("start", "ok", None, None, ctx);
        span
    }

    fn write(
        &self,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        emit_best_effort(
            &self.data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                task_id: self.task_id.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op: op.to_string(),
                status: status.to_string(),
                duration_ms,
                error,
                ctx,
            },
        );
    }

    fn finish(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        let elapsed = self.t0.elapsed().as_millis();
        self.write("end", status, Some(elapsed), error, ctx);
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finish("ok", None, ctx);
    }

    pub fn skipped(mut self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.finish("skipped", Some(error), ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.finish("err", Some(error), error_ctx(None, ctx));
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.finish("err", Some(error), error_ctx(Some(err), ctx));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        self.finish("aborted", Some(error), error_ctx(None, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread};

    // Trace settings are read from the environment on every write.
    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn read_lines(dir: &Path) -> Vec<Value> {
        let raw = fs::read_to_string(trace_path(dir)).expect("read trace");
        raw.lines()
            .map(|l| serde_json::from_str(l).expect("valid json line"))
            .collect()
    }

    #[test]
    fn concurrent_emit_keeps_jsonl_lines_parseable() {
        let _g = env_lock();
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().to_path_buf();
        let threads = 6;
        let per_thread = 100;

        let joins: Vec<_> = (0..threads)
            .map(|i| {
                let dir2 = dir.clone();
                thread::spawn(move || {
                    for j in 0..per_thread {
                        event(
                            &dir2,
                            Some("run-concurrent"),
                            "TraceTest",
                            "TRACE.concurrent_emit",
                            "ok",
                            Some(serde_json::json!({"i": i, "j": j})),
                        );
                    }
                })
            })
            .collect();
        for j in joins {
            j.join().expect("join");
        }

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), threads * per_thread);
        assert!(lines.iter().all(|v| v.get("step_id").is_some()));
    }

    #[test]
    fn dropped_span_is_recorded_as_aborted() {
        let _g = env_lock();
        let td = tempfile::tempdir().expect("tempdir");
        {
            let _span = Span::start(td.path(), None, "TraceTest", "TRACE.drop", None);
        }
        let lines = read_lines(td.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["op"], "start");
        assert_eq!(lines[1]["status"], "aborted");
        assert_eq!(lines[1]["error"]["code"], "ABORTED");
    }

    #[test]
    fn err_anyhow_records_error_chain() {
        let _g = env_lock();
        let td = tempfile::tempdir().expect("tempdir");
        let span = Span::start(td.path(), Some("t1"), "TraceTest", "TRACE.err", None);
        let e = anyhow::anyhow!("root cause").context("outer");
        span.err_anyhow("db", "E_TEST", &e, Some(serde_json::json!({"k": 1})));

        let lines = read_lines(td.path());
        let end = &lines[1];
        assert_eq!(end["status"], "err");
        assert_eq!(end["error"]["code"], "E_TEST");
        assert_eq!(end["ctx"]["k"], 1);
        let chain = end["ctx"]["err_chain"].as_array().expect("chain");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn disabled_trace_writes_nothing() {
        let _g = env_lock();
        let td = tempfile::tempdir().expect("tempdir");
        std::env::set_var("SPARK_TRACE_ENABLED", "0");
        event(td.path(), None, "TraceTest", "TRACE.off", "ok", None);
        Span::start(td.path(), None, "TraceTest", "TRACE.off_span", None).ok(None);
        std::env::remove_var("SPARK_TRACE_ENABLED");

        assert!(!trace_path(td.path()).exists());
    }

    #[test]
    fn oversized_trace_is_rotated_and_oldest_dropped() {
        let _g = env_lock();
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path();
        fs::write(rotated_path(dir, 2), "stale-marker\n").expect("seed oldest");

        std::env::set_var("SPARK_TRACE_MAX_BYTES", "200");
        std::env::set_var("SPARK_TRACE_MAX_FILES", "2");
        for i in 0..30 {
            event(
                dir,
                None,
                "TraceTest",
                "TRACE.rotate",
                "ok",
                Some(serde_json::json!({"i": i})),
            );
        }
        std::env::remove_var("SPARK_TRACE_MAX_BYTES");
        std::env::remove_var("SPARK_TRACE_MAX_FILES");

        assert!(trace_path(dir).exists());
        assert!(rotated_path(dir, 1).exists());
        assert!(rotated_path(dir, 2).exists());
        assert!(!rotated_path(dir, 3).exists());
        for n in 1..=2 {
            let raw = fs::read_to_string(rotated_path(dir, n)).expect("read rotated");
            assert!(!raw.contains("stale-marker"));
        }
        let current = fs::metadata(trace_path(dir)).expect("meta").len();
        assert!(current < 1_000);
        // The newest record is always in the live file.
        let last = read_lines(dir).pop().expect("line");
        assert_eq!(last["ctx"]["i"], 29);
    }

    #[test]
    fn redact_home_dirs_hides_user_segment() {
        let s = redact_home_dirs("at /home/alice/src/main.rs and C:\\Users\\bob\\x.rs");
        assert!(!s.contains("alice"));
        assert!(!s.contains("bob"));
        assert!(s.contains("/home/<redacted>/src/main.rs"));
    }
}
