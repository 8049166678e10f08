use std::{fs::OpenOptions, io::Write};

use spark_observability::now_ms;

// Panics are appended to `<data_dir>/panic.log` instead of stderr: a
// `windows_subsystem = "windows"` build has no usable stderr, and a failing
// write inside the default hook recurses until the stack overflows.
pub fn install_best_effort() {
    std::panic::set_hook(Box::new(|info| {
        let bt = std::backtrace::Backtrace::force_capture();
        let msg = format!("ts_ms={}\npanic={info}\nbacktrace={bt}\n---\n", now_ms());

        if let Ok(dir) = crate::data_dir::data_dir() {
            let _ = std::fs::create_dir_all(&dir);
            if let Ok(mut f) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("panic.log"))
            {
                let _ = f.write_all(msg.as_bytes());
            }
        }
    }));
}
