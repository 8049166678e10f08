// stderr logging that never panics.
//
// A GUI process may run without an attached console; a failing `eprintln!`
// would panic there, so write errors are ignored.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
