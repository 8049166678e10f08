use serde_json::Value;
use spark_storage::Device;

/// A notification pushed to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    LogUpdate(String),
    StateUpdate(String),
    NetworkDiscoveryUpdate(String),
    DevicesUpdated(Vec<Device>),
    ModelDownloadProgress(String),
    ModelDownloadComplete(String),
    MainProcessMessage(String),
}

impl AppEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::LogUpdate(_) => "log-update",
            Self::StateUpdate(_) => "state-update",
            Self::NetworkDiscoveryUpdate(_) => "network-discovery-update",
            Self::DevicesUpdated(_) => "devices-updated",
            Self::ModelDownloadProgress(_) => "model-download-progress",
            Self::ModelDownloadComplete(_) => "model-download-complete",
            Self::MainProcessMessage(_) => "main-process-message",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::LogUpdate(s)
            | Self::StateUpdate(s)
            | Self::NetworkDiscoveryUpdate(s)
            | Self::ModelDownloadProgress(s)
            | Self::ModelDownloadComplete(s)
            | Self::MainProcessMessage(s) => Value::String(s.clone()),
            Self::DevicesUpdated(devices) => {
                serde_json::to_value(devices).unwrap_or(Value::Array(Vec::new()))
            }
        }
    }
}

/// Where supervisor notifications go. The desktop shell forwards them to the
/// webview; tests record them.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AppEvent);
}

impl<F> EventSink for F
where
    F: Fn(AppEvent) + Send + Sync,
{
    fn emit(&self, event: AppEvent) {
        self(event)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::{AppEvent, EventSink};

    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<AppEvent>>,
    }

    impl RecordingSink {
        pub fn snapshot(&self) -> Vec<AppEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn on_channel(&self, channel: &str) -> Vec<AppEvent> {
            self.snapshot()
                .into_iter()
                .filter(|e| e.channel() == channel)
                .collect()
        }

        pub fn strings(&self, channel: &str) -> Vec<String> {
            self.on_channel(channel)
                .into_iter()
                .filter_map(|e| match e.payload() {
                    serde_json::Value::String(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: AppEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
