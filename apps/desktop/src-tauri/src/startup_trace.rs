use std::{fs::OpenOptions, io::Write};

use spark_observability::now_ms;

// Breadcrumbs written before the trace log and store exist, so a crash
// during startup still leaves a trail in `startup_trace.log`.
pub fn mark_best_effort(stage: &str) {
    let Ok(dir) = crate::data_dir::data_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("startup_trace.log"))
    else {
        return;
    };
    let _ = writeln!(f, "ts_ms={} stage={stage}", now_ms());
}
