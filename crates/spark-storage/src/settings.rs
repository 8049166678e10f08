use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::Store;

pub const DEFAULT_ASSISTANT_NAME: &str = "Spark";
pub const DEFAULT_THEME_COLOR: &str = "#00ffcc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

pub(crate) fn seed_defaults(conn: &Connection) -> Result<()> {
    for (key, value) in [
        ("assistant_name", DEFAULT_ASSISTANT_NAME),
        ("theme_color", DEFAULT_THEME_COLOR),
    ] {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .with_context(|| format!("seed setting {key} failed"))?;
    }
    Ok(())
}

impl Store {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> = self.read("get setting", |c| {
            c.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
        })?;
        Ok(value.flatten())
    }

    /// Last write wins.
    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        self.write(
            "STORE.save_setting",
            "E_SETTING_SAVE",
            Some(serde_json::json!({"key": key, "value_chars": value.len()})),
            |c| {
                c.execute(
                    "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
                .map(|_| ())
            },
        )
    }

    pub fn get_all_settings(&self) -> Result<Vec<Setting>> {
        self.read("list settings", |c| {
            let mut stmt = c.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], |r| {
                Ok(Setting {
                    key: r.get(0)?,
                    value: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?;
            rows.collect()
        })
    }
}
