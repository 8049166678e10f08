use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

pub const DATA_DIR_ENV: &str = "SPARK_DATA_DIR";

/// The checkout this shell was built from (`apps/desktop/src-tauri` is three
/// levels below it). Helper scripts and the dev venv are looked up here.
pub fn repo_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(3)
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("failed to locate repo root"))
}

pub fn data_dir() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(DATA_DIR_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    // Dev default: repo-root/tmp/spark-data
    Ok(repo_root()?.join("tmp").join("spark-data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_root_holds_the_desktop_app() {
        let root = repo_root().expect("root");
        assert!(root.join("apps").join("desktop").join("src-tauri").is_dir());
    }

    /// Tests that read or write `SPARK_DATA_DIR` hold this for their whole body.
    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
        LOCK.get_or_init(Default::default)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn data_dir_honours_env_override() {
        let _g = env_lock();
        let td = tempfile::tempdir().expect("tempdir");
        std::env::set_var(DATA_DIR_ENV, td.path());
        let got = data_dir().expect("data dir");
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(got, td.path());
    }

    #[test]
    fn empty_override_falls_back_to_repo_tmp() {
        let _g = env_lock();
        std::env::set_var(DATA_DIR_ENV, "");
        let got = data_dir().expect("data dir");
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(got, repo_root().unwrap().join("tmp").join("spark-data"));
    }
}
