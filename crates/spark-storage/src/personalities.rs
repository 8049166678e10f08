use anyhow::Result;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use spark_observability::now_ms;

use crate::{DeviceRole, DeviceStatus, Store};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub backstory: String,
    pub traits: String,
    pub voice_settings: String,
    pub system_prompt: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Personality {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let text = |i: usize| -> rusqlite::Result<String> {
            Ok(r.get::<_, Option<String>>(i)?.unwrap_or_default())
        };
        Ok(Self {
            id: r.get(0)?,
            device_id: text(1)?,
            name: r.get(2)?,
            backstory: text(3)?,
            traits: text(4)?,
            voice_settings: text(5)?,
            system_prompt: text(6)?,
            created_at: r.get(7)?,
            updated_at: r.get(8)?,
        })
    }
}

/// The editor submits either naming: `voice_style`/`response_style` are
/// accepted in place of `voice_settings`/`system_prompt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPersonality {
    pub device_id: String,
    pub name: String,
    #[serde(default)]
    pub backstory: Option<String>,
    #[serde(default)]
    pub traits: Option<String>,
    #[serde(default)]
    pub voice_settings: Option<String>,
    #[serde(default)]
    pub voice_style: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub response_style: Option<String>,
}

fn first_non_empty(a: &Option<String>, b: &Option<String>) -> String {
    [a, b]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .cloned()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalityUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub backstory: Option<String>,
    #[serde(default)]
    pub traits: Option<String>,
    #[serde(default)]
    pub voice_settings: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl PersonalityUpdate {
    fn assignments(&self) -> Vec<(&'static str, &str)> {
        [
            ("name", &self.name),
            ("backstory", &self.backstory),
            ("traits", &self.traits),
            ("voice_settings", &self.voice_settings),
            ("system_prompt", &self.system_prompt),
        ]
        .into_iter()
        .filter_map(|(col, v)| v.as_deref().map(|v| (col, v)))
        .collect()
    }
}

const PERSONALITY_COLUMNS: &str =
    "id, device_id, name, backstory, traits, voice_settings, system_prompt, created_at, updated_at";

impl Store {
    /// Always inserts a new row. A placeholder device is created first when
    /// `device_id` is not yet known.
    pub fn save_personality(&self, p: &NewPersonality) -> Result<i64> {
        let now = now_ms();
        let voice_settings = first_non_empty(&p.voice_settings, &p.voice_style);
        let system_prompt = first_non_empty(&p.system_prompt, &p.response_style);
        self.write(
            "STORE.save_personality",
            "E_PERSONALITY_SAVE",
            Some(serde_json::json!({"device_id": p.device_id, "name_chars": p.name.len()})),
            |c| {
                let tx = c.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO devices (device_id, name, role, status, last_seen, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                    ON CONFLICT(device_id) DO NOTHING
                    "#,
                    params![
                        p.device_id,
                        p.name,
                        DeviceRole::Unknown.as_str(),
                        DeviceStatus::Online.as_str(),
                        now,
                    ],
                )?;
                tx.execute(
                    r#"
                    INSERT INTO personalities
                    (device_id, name, backstory, traits, voice_settings, system_prompt, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                    "#,
                    params![
                        p.device_id,
                        p.name,
                        p.backstory.as_deref().unwrap_or(""),
                        p.traits.as_deref().unwrap_or(""),
                        voice_settings,
                        system_prompt,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            },
        )
    }

    /// The device's current personality: the most recently created row.
    pub fn get_personality(&self, device_id: &str) -> Result<Option<Personality>> {
        self.read("get personality", |c| {
            c.query_row(
                &format!(
                    "SELECT {PERSONALITY_COLUMNS} FROM personalities WHERE device_id = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![device_id],
                Personality::from_row,
            )
            .optional()
        })
    }

    /// Touches only the supplied fields plus `updated_at`. Returns whether the
    /// row exists.
    pub fn update_personality(&self, id: i64, updates: &PersonalityUpdate) -> Result<bool> {
        let assignments = updates.assignments();
        let fields: Vec<&str> = assignments.iter().map(|(col, _)| *col).collect();

        let mut sets: Vec<String> = assignments
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
            .collect();
        sets.push(format!("updated_at = ?{}", assignments.len() + 1));
        let sql = format!(
            "UPDATE personalities SET {} WHERE id = ?{}",
            sets.join(", "),
            assignments.len() + 2
        );

        let mut values: Vec<SqlValue> = assignments
            .iter()
            .map(|(_, v)| SqlValue::Text((*v).to_string()))
            .collect();
        values.push(SqlValue::Integer(now_ms()));
        values.push(SqlValue::Integer(id));

        self.write(
            "STORE.update_personality",
            "E_PERSONALITY_UPDATE",
            Some(serde_json::json!({"id": id, "fields": fields})),
            |c| c.execute(&sql, params_from_iter(values)).map(|n| n > 0),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::store;

    use super::*;

    fn new_personality(device_id: &str, name: &str) -> NewPersonality {
        NewPersonality {
            device_id: device_id.to_string(),
            name: name.to_string(),
            backstory: Some("grew up in a lab".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn save_creates_placeholder_device() {
        let (_td, store) = store();
        store.save_personality(&new_personality("desk-1", "Ada")).unwrap();
        let d = store.get_device("desk-1").unwrap().expect("placeholder device");
        assert_eq!(d.name, "Ada");
        assert_eq!(d.status, DeviceStatus::Online);
        assert_eq!(d.role, DeviceRole::Unknown);
    }

    #[test]
    fn save_keeps_existing_device_untouched() {
        let (_td, store) = store();
        store
            .upsert_device(&crate::DeviceUpsert {
                device_id: "desk-1".to_string(),
                name: "Desk".to_string(),
                role: Some(DeviceRole::Host),
                ..Default::default()
            })
            .unwrap();
        store.save_personality(&new_personality("desk-1", "Ada")).unwrap();
        let d = store.get_device("desk-1").unwrap().unwrap();
        assert_eq!(d.name, "Desk");
        assert_eq!(d.role, DeviceRole::Host);
    }

    #[test]
    fn current_personality_is_latest_insert() {
        let (_td, store) = store();
        store.save_personality(&new_personality("desk-1", "Ada")).unwrap();
        store.save_personality(&new_personality("desk-1", "Grace")).unwrap();
        let p = store.get_personality("desk-1").unwrap().expect("personality");
        assert_eq!(p.name, "Grace");
        assert!(store.get_personality("other").unwrap().is_none());
    }

    #[test]
    fn alias_fields_fill_voice_settings_and_system_prompt() {
        let (_td, store) = store();
        let p: NewPersonality = serde_json::from_value(serde_json::json!({
            "device_id": "desk-1",
            "name": "Ada",
            "voice_style": "calm",
            "response_style": "be brief",
        }))
        .unwrap();
        store.save_personality(&p).unwrap();
        let got = store.get_personality("desk-1").unwrap().unwrap();
        assert_eq!(got.voice_settings, "calm");
        assert_eq!(got.system_prompt, "be brief");
        assert_eq!(got.traits, "");
    }

    #[test]
    fn update_touches_only_supplied_fields() {
        let (_td, store) = store();
        let id = store.save_personality(&new_personality("desk-1", "Ada")).unwrap();
        let before = store.get_personality("desk-1").unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let changed = store
            .update_personality(
                id,
                &PersonalityUpdate {
                    traits: Some("curious".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(changed);

        let after = store.get_personality("desk-1").unwrap().unwrap();
        assert_eq!(after.traits, "curious");
        assert_eq!(after.name, "Ada");
        assert_eq!(after.backstory, before.backstory);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn update_of_unknown_id_reports_false() {
        let (_td, store) = store();
        assert!(!store
            .update_personality(42, &PersonalityUpdate::default())
            .unwrap());
    }
}
