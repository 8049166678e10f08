pub mod events;
pub mod line_splitter;
pub mod process;
pub mod runtime;
pub mod supervisor;
pub mod tagged_line;
pub mod tasks;

pub use events::{AppEvent, EventSink};
pub use line_splitter::{LineSplitter, LINE_SEPARATOR};
pub use process::{
    EventPublisher, ExitOutcome, KillSignal, ProcessError, ProcessEvent, ProcessHandle,
    ProcessSpec, StreamMode, Subscription,
};
pub use runtime::{RuntimeConfig, RuntimeStatus};
pub use supervisor::{BrowsedModel, Supervisor, SupervisorError};
pub use tagged_line::{parse_tagged_line, TaggedLine};
pub use tasks::TaskSlot;
