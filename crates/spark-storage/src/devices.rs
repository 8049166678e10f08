use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use spark_observability::now_ms;

use crate::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Host,
    Client,
    #[default]
    Unknown,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient: anything that is not `host`/`client` is `unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Self::Host,
            "client" => Self::Client,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("online") {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub address: Option<String>,
    pub port: Option<i64>,
    pub role: DeviceRole,
    pub status: DeviceStatus,
    pub personality: String,
    pub model: String,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub gpu_info: Option<String>,
    pub last_seen: i64,
    pub created_at: i64,
}

const DEVICE_COLUMNS: &str = "id, device_id, name, address, port, role, status, personality, model, \
     cpu_percent, memory_percent, gpu_info, last_seen, created_at";

impl Device {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            device_id: r.get(1)?,
            name: r.get(2)?,
            address: r.get(3)?,
            port: r.get(4)?,
            role: DeviceRole::parse(&r.get::<_, Option<String>>(5)?.unwrap_or_default()),
            status: DeviceStatus::parse(&r.get::<_, Option<String>>(6)?.unwrap_or_default()),
            personality: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
            model: r.get::<_, Option<String>>(8)?.unwrap_or_default(),
            cpu_percent: r.get(9)?,
            memory_percent: r.get(10)?,
            gpu_info: r.get(11)?,
            last_seen: r.get(12)?,
            created_at: r.get(13)?,
        })
    }
}

/// A partial device record. Unset fields fall back to the registry defaults
/// (`role=unknown`, `status=offline`, empty personality/model, null
/// address/port/metrics) on every upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUpsert {
    pub device_id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub role: Option<DeviceRole>,
    #[serde(default)]
    pub status: Option<DeviceStatus>,
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

impl Store {
    /// Insert-or-update keyed on `device_id`; `last_seen` is always refreshed.
    pub fn upsert_device(&self, device: &DeviceUpsert) -> Result<()> {
        let now = now_ms();
        let role = device.role.unwrap_or_default();
        let status = device.status.unwrap_or_default();
        self.write(
            "STORE.upsert_device",
            "E_DEVICE_UPSERT",
            Some(serde_json::json!({
                "device_id": device.device_id,
                "role": role.as_str(),
                "status": status.as_str(),
            })),
            |c| {
                c.execute(
                    r#"
                    INSERT INTO devices
                    (device_id, name, address, port, role, status, personality, model,
                     cpu_percent, memory_percent, gpu_info, last_seen, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                    ON CONFLICT(device_id) DO UPDATE SET
                      name = excluded.name,
                      address = excluded.address,
                      port = excluded.port,
                      role = excluded.role,
                      status = excluded.status,
                      personality = excluded.personality,
                      model = excluded.model,
                      cpu_percent = excluded.cpu_percent,
                      memory_percent = excluded.memory_percent,
                      gpu_info = excluded.gpu_info,
                      last_seen = excluded.last_seen
                    "#,
                    params![
                        device.device_id,
                        device.name,
                        device.address,
                        device.port,
                        role.as_str(),
                        status.as_str(),
                        device.personality.as_deref().unwrap_or(""),
                        device.model.as_deref().unwrap_or(""),
                        device.cpu_percent,
                        device.memory_percent,
                        device.gpu_info,
                        now,
                    ],
                )
                .map(|_| ())
            },
        )
    }

    /// Most recently seen first.
    pub fn get_all_devices(&self) -> Result<Vec<Device>> {
        self.read("list devices", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY last_seen DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], Device::from_row)?;
            rows.collect()
        })
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        self.read("get device", |c| {
            c.query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"),
                params![device_id],
                Device::from_row,
            )
            .optional()
        })
    }

    /// Returns whether a device row was touched.
    pub fn update_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<bool> {
        let now = now_ms();
        self.write(
            "STORE.update_device_status",
            "E_DEVICE_STATUS",
            Some(serde_json::json!({"device_id": device_id, "status": status.as_str()})),
            |c| {
                c.execute(
                    "UPDATE devices SET status = ?1, last_seen = ?2 WHERE device_id = ?3",
                    params![status.as_str(), now, device_id],
                )
                .map(|n| n > 0)
            },
        )
    }
}
