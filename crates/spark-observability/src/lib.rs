pub mod safe_print;
pub mod trace;

pub use trace::{event, now_ms, Span, TraceError, TraceEvent};
