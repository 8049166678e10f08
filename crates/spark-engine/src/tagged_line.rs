//! The `TAG:payload` line protocol spoken by the voice and discovery helpers.
//!
//! ```text
//! STATE:LISTENING
//! LOG:heard something
//! FOUND: {"name":"nodeA","address":"10.0.0.5","port":9000,"role":"client"}
//! LOST: {"name":"nodeA"}
//! ```

use serde::{de::DeserializeOwned, Deserialize};
use spark_storage::{DeviceRole, DeviceStatus, DeviceUpsert};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    State,
    Log,
    Found,
    Lost,
}

impl Tag {
    /// Matching order.
    pub const ALL: [Tag; 4] = [Tag::State, Tag::Log, Tag::Found, Tag::Lost];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::State => "STATE:",
            Self::Log => "LOG:",
            Self::Found => "FOUND:",
            Self::Lost => "LOST:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FoundDevice {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub gpu_info: Option<String>,
}

impl FoundDevice {
    /// Announced devices are keyed by name and are online by definition.
    pub fn to_upsert(&self) -> DeviceUpsert {
        DeviceUpsert {
            device_id: self.name.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            role: self.role.as_deref().map(DeviceRole::parse),
            status: Some(DeviceStatus::Online),
            personality: self.personality.clone(),
            model: self.model.clone(),
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            gpu_info: self.gpu_info.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LostDevice {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaggedLine {
    /// Trimmed state name.
    State(String),
    /// Everything after `LOG:`, untouched.
    Log(String),
    Found(FoundDevice),
    Lost(LostDevice),
    /// A FOUND/LOST line whose payload did not parse.
    Invalid {
        tag: Tag,
        line: String,
        reason: String,
    },
    Plain(String),
}

pub fn parse_tagged_line(line: &str) -> TaggedLine {
    let Some((tag, rest)) = Tag::ALL
        .iter()
        .find_map(|t| line.strip_prefix(t.prefix()).map(|rest| (*t, rest)))
    else {
        return TaggedLine::Plain(line.to_string());
    };

    let invalid = |reason: String| TaggedLine::Invalid {
        tag,
        line: line.to_string(),
        reason,
    };
    match tag {
        Tag::State => TaggedLine::State(rest.trim().to_string()),
        Tag::Log => TaggedLine::Log(rest.to_string()),
        Tag::Found => match json_payload::<FoundDevice>(rest) {
            Ok(d) => TaggedLine::Found(d),
            Err(e) => invalid(e),
        },
        Tag::Lost => match json_payload::<LostDevice>(rest) {
            Ok(d) => TaggedLine::Lost(d),
            Err(e) => invalid(e),
        },
    }
}

/// The JSON object starting at the first `{` of the payload.
fn json_payload<T: DeserializeOwned>(rest: &str) -> Result<T, String> {
    let start = rest
        .find('{')
        .ok_or_else(|| "payload has no JSON object".to_string())?;
    serde_json::from_str(rest[start..].trim_end()).map_err(|e| e.to_string())
}
