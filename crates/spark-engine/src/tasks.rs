use serde::Serialize;

pub const DEFAULT_HOST_MODEL: &str = "Qwen/Qwen2.5-0.5B-Instruct";
pub const DEFAULT_SCHEDULER_ADDR: &str = "127.0.0.1:8888";

/// Setting keys that feed helper arguments.
pub const SETTING_SCHEDULER_ADDR: &str = "scheduler_addr";
pub const SETTING_HOST_PORT: &str = "host_port";
pub const SETTING_ASSISTANT_NAME: &str = "assistant_name";

/// A named slot holding at most one running helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskSlot {
    Host,
    Client,
    Voice,
    NetworkDiscovery,
    ModelBrowse,
    ModelDownload,
}

impl TaskSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
            Self::Voice => "voice",
            Self::NetworkDiscovery => "network-discovery",
            Self::ModelBrowse => "model-browse",
            Self::ModelDownload => "model-download",
        }
    }

    pub fn script(self) -> &'static str {
        match self {
            Self::Host => "host.py",
            Self::Client => "client.py",
            Self::Voice => "voice_assistant.py",
            Self::NetworkDiscovery => "network_discovery.py",
            Self::ModelBrowse | Self::ModelDownload => "model_manager.py",
        }
    }
}

pub fn host_args(model_id: &str, port: Option<&str>) -> Vec<String> {
    let mut args = vec!["--model".to_string(), model_id.to_string()];
    if let Some(port) = port.filter(|p| !p.trim().is_empty()) {
        args.extend(["--port".to_string(), port.trim().to_string()]);
    }
    args
}

pub fn client_args(scheduler_addr: &str) -> Vec<String> {
    vec!["--scheduler-addr".to_string(), scheduler_addr.to_string()]
}

pub fn voice_args(assistant_name: Option<&str>) -> Vec<String> {
    match assistant_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => vec!["--name".to_string(), name.to_string()],
        None => Vec::new(),
    }
}

pub fn discovery_args(device_name: &str, role: &str) -> Vec<String> {
    vec![device_name.to_string(), role.to_string()]
}

pub fn browse_args(task: &str, limit: u32) -> Vec<String> {
    vec!["browse".to_string(), task.to_string(), limit.to_string()]
}

pub fn download_args(model_id: &str) -> Vec<String> {
    vec!["download".to_string(), model_id.to_string()]
}

/// `org/name` -> `name`.
pub fn model_display_name(model_id: &str) -> String {
    model_id
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(model_id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browse_and_download_share_the_model_manager() {
        assert_eq!(TaskSlot::ModelBrowse.script(), TaskSlot::ModelDownload.script());
        assert_eq!(browse_args("text-generation", 20), vec!["browse", "text-generation", "20"]);
        assert_eq!(download_args("org/m"), vec!["download", "org/m"]);
    }

    #[test]
    fn optional_arguments_are_omitted_when_blank() {
        assert_eq!(host_args("m", None), vec!["--model", "m"]);
        assert_eq!(host_args("m", Some(" ")), vec!["--model", "m"]);
        assert_eq!(host_args("m", Some("9000")), vec!["--model", "m", "--port", "9000"]);
        assert!(voice_args(Some("")).is_empty());
        assert_eq!(voice_args(Some("Spark")), vec!["--name", "Spark"]);
    }

    #[test]
    fn display_name_is_last_segment() {
        assert_eq!(model_display_name("Qwen/Qwen2.5-0.5B-Instruct"), "Qwen2.5-0.5B-Instruct");
        assert_eq!(model_display_name("gpt2"), "gpt2");
        assert_eq!(model_display_name("org/name/"), "name");
    }
}
