use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit. `message` is the exception line when stderr carried a
    /// Python traceback, otherwise the raw stderr text.
    #[error("{message}")]
    Exited {
        message: String,
        exit_code: i32,
        executable: PathBuf,
        args: Vec<String>,
        traceback: Option<String>,
    },

    #[error("stdin is closed")]
    StdinClosed,

    #[error("process io failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "E_PROC_SPAWN",
            Self::Exited { .. } => "E_PROC_EXIT",
            Self::StdinClosed => "E_PROC_STDIN_CLOSED",
            Self::Io(_) => "E_PROC_IO",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceback {
    /// The final `ExceptionType: message` line.
    pub summary: String,
    /// From the `Traceback` header up to and including the summary.
    pub trace: String,
}

/// Finds the last Python traceback in `stderr`. Output logged before the
/// `Traceback` header is ignored.
pub fn parse_traceback(stderr: &str) -> Option<Traceback> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(|l| l.trim_end())
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.iter().rposition(|l| l.starts_with("Traceback"))?;
    let block = &lines[start..];
    if block.len() < 2 {
        return None;
    }
    let summary = block.last()?.trim().to_string();
    Some(Traceback {
        summary,
        trace: block.join("\n"),
    })
}

/// `traceback` keeps the whole stderr text the message was taken from.
pub(crate) fn exit_error(
    executable: PathBuf,
    args: Vec<String>,
    exit_code: i32,
    stderr: &str,
) -> ProcessError {
    let (message, traceback) = match parse_traceback(stderr) {
        Some(tb) => (tb.summary, Some(stderr.trim_end().to_string())),
        None if !stderr.trim().is_empty() => (stderr.trim().to_string(), None),
        None => (format!("process exited with code {exit_code}"), None),
    };
    ProcessError::Exited {
        message,
        exit_code,
        executable,
        args,
        traceback,
    }
}
