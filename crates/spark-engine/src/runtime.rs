use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use spark_observability::trace;

use crate::process::UNBUFFERED_FLAG;

pub const PYTHON_ENV: &str = "SPARK_PYTHON";
pub const BRIDGE_DIR_ENV: &str = "SPARK_BRIDGE_DIR";
pub const MODEL_CACHE_DIR_ENV: &str = "SPARK_MODEL_CACHE_DIR";
const FALLBACK_PYTHON: &str = "python3";

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub ready: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub python_path: Option<String>,
    pub python_version: Option<String>,
}

impl RuntimeStatus {
    fn failed(message: String, python_path: Option<String>) -> Self {
        Self {
            ready: false,
            code: Some("E_PYTHON_NOT_READY".to_string()),
            message: Some(message),
            python_path,
            python_version: None,
        }
    }
}

pub fn default_python_path(repo_root: &Path) -> PathBuf {
    if cfg!(windows) {
        repo_root.join(".venv").join("Scripts").join("python.exe")
    } else {
        repo_root.join(".venv").join("bin").join("python")
    }
}

/// `SPARK_PYTHON`, then the repo-local venv, then `python3` from `PATH`.
pub fn resolve_python_binary(repo_root: &Path) -> Result<PathBuf> {
    if let Ok(raw) = std::env::var(PYTHON_ENV) {
        let t = raw.trim();
        if !t.is_empty() {
            let p = PathBuf::from(t);
            if p.exists() {
                return Ok(p);
            }
            return Err(anyhow!(
                "E_PYTHON_NOT_READY: {PYTHON_ENV} points to missing file: {}",
                p.display()
            ));
        }
    }

    let p = default_python_path(repo_root);
    if p.exists() {
        return Ok(p);
    }
    Ok(PathBuf::from(FALLBACK_PYTHON))
}

fn verify_python_version(python: &Path) -> Result<String> {
    let out = Command::new(python)
        .arg("--version")
        .output()
        .with_context(|| format!("run python --version failed: {}", python.display()))?;
    if !out.status.success() {
        return Err(anyhow!(
            "E_PYTHON_NOT_READY: python --version exited with {} ({})",
            out.status,
            python.display()
        ));
    }
    // Python 2 prints its version on stderr.
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    let merged = if stdout.trim().is_empty() {
        stderr
    } else {
        stdout
    };
    let line = merged.lines().next().unwrap_or("").trim().to_string();
    if line.is_empty() {
        return Err(anyhow!(
            "E_PYTHON_NOT_READY: python --version returned empty output ({})",
            python.display()
        ));
    }
    Ok(line)
}

/// Resolves the interpreter and checks its version once at startup. Helpers are still
/// launched when this fails; each launch then reports its own spawn error.
pub fn initialize_and_verify(data_dir: &Path, repo_root: &Path) -> (PathBuf, RuntimeStatus) {
    let resolved = match resolve_python_binary(repo_root) {
        Ok(p) => p,
        Err(e) => {
            let msg = e.to_string();
            trace::event(
                data_dir,
                None,
                "Python",
                "PY.verify",
                "err",
                Some(serde_json::json!({"code": "E_PYTHON_NOT_READY", "message": msg})),
            );
            return (PathBuf::from(FALLBACK_PYTHON), RuntimeStatus::failed(msg, None));
        }
    };
    let python_path = resolved.display().to_string();

    match verify_python_version(&resolved) {
        Ok(version) => {
            trace::event(
                data_dir,
                None,
                "Python",
                "PY.verify",
                "ok",
                Some(serde_json::json!({"python": python_path, "version": version})),
            );
            let status = RuntimeStatus {
                ready: true,
                code: None,
                message: None,
                python_path: Some(python_path),
                python_version: Some(version),
            };
            (resolved, status)
        }
        Err(e) => {
            let msg = format!("{e:#}");
            trace::event(
                data_dir,
                None,
                "Python",
                "PY.verify",
                "err",
                Some(serde_json::json!({
                    "code": "E_PYTHON_NOT_READY",
                    "message": msg,
                    "python": python_path,
                })),
            );
            (resolved, RuntimeStatus::failed(msg, Some(python_path)))
        }
    }
}

fn env_dir(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Where helpers live and how they are launched.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub python: PathBuf,
    /// Flags placed before the script path.
    pub python_args: Vec<String>,
    pub bridge_dir: PathBuf,
    pub model_cache_dir: PathBuf,
}

impl RuntimeConfig {
    pub fn new(python: PathBuf, bridge_dir: PathBuf, model_cache_dir: PathBuf) -> Self {
        Self {
            python,
            python_args: vec![UNBUFFERED_FLAG.to_string()],
            bridge_dir,
            model_cache_dir,
        }
    }

    /// `SPARK_BRIDGE_DIR` (default `<repo>/python_bridge`) and
    /// `SPARK_MODEL_CACHE_DIR` (default `~/.cache/spark-models`).
    pub fn from_env(repo_root: &Path, python: PathBuf) -> Self {
        let bridge_dir =
            env_dir(BRIDGE_DIR_ENV).unwrap_or_else(|| repo_root.join("python_bridge"));
        let model_cache_dir = env_dir(MODEL_CACHE_DIR_ENV).unwrap_or_else(default_model_cache_dir);
        Self::new(python, bridge_dir, model_cache_dir)
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.bridge_dir.join(name)
    }

    /// Local directory a downloaded model lands in.
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.model_cache_dir.join(model_id.replace('/', "_"))
    }
}

fn default_model_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("spark-models")
}

#[cfg(test)]
pub(crate) fn env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn resolve_python_binary_falls_back_to_path_python3() {
        let _g = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var(PYTHON_ENV);
        let td = tempfile::tempdir().expect("tempdir");
        let got = resolve_python_binary(td.path()).expect("resolve");
        assert_eq!(got, PathBuf::from("python3"));
    }

    #[test]
    fn resolve_python_binary_rejects_missing_explicit_path() {
        let _g = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let td = tempfile::tempdir().expect("tempdir");
        std::env::set_var(PYTHON_ENV, td.path().join("nope").display().to_string());
        let err = resolve_python_binary(td.path()).unwrap_err();
        std::env::remove_var(PYTHON_ENV);
        assert!(err.to_string().contains("E_PYTHON_NOT_READY"));
    }

    #[test]
    fn resolve_python_binary_prefers_explicit_env_path() {
        let _g = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let td = tempfile::tempdir().expect("tempdir");
        let py = td.path().join("python");
        std::fs::write(&py, b"x").expect("write");
        std::env::set_var(PYTHON_ENV, py.display().to_string());
        let got = resolve_python_binary(td.path()).expect("resolve");
        std::env::remove_var(PYTHON_ENV);
        assert_eq!(got, py);
    }

    #[test]
    fn resolve_python_binary_uses_repo_venv() {
        let _g = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var(PYTHON_ENV);
        let td = tempfile::tempdir().expect("tempdir");
        let py = default_python_path(td.path());
        std::fs::create_dir_all(py.parent().unwrap_or(Path::new("."))).expect("mkdir");
        std::fs::write(&py, b"x").expect("write");

        let got = resolve_python_binary(td.path()).expect("resolve");
        assert_eq!(got, py);
    }

    #[test]
    fn config_dirs_follow_env_overrides() {
        let _g = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let td = tempfile::tempdir().expect("tempdir");
        std::env::remove_var(BRIDGE_DIR_ENV);
        std::env::set_var(MODEL_CACHE_DIR_ENV, td.path().join("models").display().to_string());
        let cfg = RuntimeConfig::from_env(td.path(), PathBuf::from("python3"));
        std::env::remove_var(MODEL_CACHE_DIR_ENV);

        assert_eq!(cfg.script("host.py"), td.path().join("python_bridge").join("host.py"));
        assert_eq!(
            cfg.model_dir("Qwen/Qwen2.5-0.5B-Instruct"),
            td.path().join("models").join("Qwen_Qwen2.5-0.5B-Instruct")
        );
        assert_eq!(cfg.python_args, vec!["-u"]);
    }

    #[cfg(unix)]
    #[test]
    fn verify_reports_failing_interpreter() {
        let td = tempfile::tempdir().expect("tempdir");
        let _g = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var(PYTHON_ENV, "/bin/false");
        let (python, status) = initialize_and_verify(td.path(), td.path());
        std::env::remove_var(PYTHON_ENV);
        assert_eq!(python, PathBuf::from("/bin/false"));
        assert!(!status.ready);
        assert_eq!(status.code.as_deref(), Some("E_PYTHON_NOT_READY"));
    }
}
