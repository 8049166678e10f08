use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use spark_observability::now_ms;

use crate::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub model_id: String,
    pub name: String,
    pub size_mb: Option<f64>,
    pub local_path: Option<String>,
    pub download_date: Option<i64>,
    pub last_used: Option<i64>,
    pub is_active: bool,
}

const MODEL_COLUMNS: &str =
    "id, model_id, name, size_mb, local_path, download_date, last_used, is_active";

impl Model {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            model_id: r.get(1)?,
            name: r.get(2)?,
            size_mb: r.get(3)?,
            local_path: r.get(4)?,
            download_date: r.get(5)?,
            last_used: r.get(6)?,
            is_active: r.get::<_, i64>(7)? != 0,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewModel {
    pub model_id: String,
    pub name: String,
    #[serde(default)]
    pub size_mb: Option<f64>,
    #[serde(default)]
    pub local_path: Option<String>,
}

impl Store {
    /// Records a downloaded model; a repeat download refreshes its metadata
    /// but leaves the active flag alone.
    pub fn save_model(&self, model: &NewModel) -> Result<()> {
        let now = now_ms();
        self.write(
            "STORE.save_model",
            "E_MODEL_SAVE",
            Some(serde_json::json!({"model_id": model.model_id})),
            |c| {
                c.execute(
                    r#"
                    INSERT INTO models (model_id, name, size_mb, local_path, download_date)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(model_id) DO UPDATE SET
                      name = excluded.name,
                      size_mb = excluded.size_mb,
                      local_path = excluded.local_path,
                      download_date = excluded.download_date
                    "#,
                    params![model.model_id, model.name, model.size_mb, model.local_path, now],
                )
                .map(|_| ())
            },
        )
    }

    /// Most recently downloaded first.
    pub fn get_models(&self) -> Result<Vec<Model>> {
        self.read("list models", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM models ORDER BY download_date DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], Model::from_row)?;
            rows.collect()
        })
    }

    /// Clears every active flag, then activates `model_id`, inside one
    /// transaction. Returns whether `model_id` exists; an unknown id leaves no
    /// model active.
    pub fn set_active_model(&self, model_id: &str) -> Result<bool> {
        let now = now_ms();
        self.write(
            "STORE.set_active_model",
            "E_MODEL_ACTIVATE",
            Some(serde_json::json!({"model_id": model_id})),
            |c| {
                let tx = c.transaction()?;
                tx.execute("UPDATE models SET is_active = 0 WHERE is_active != 0", [])?;
                let n = tx.execute(
                    "UPDATE models SET is_active = 1, last_used = ?1 WHERE model_id = ?2",
                    params![now, model_id],
                )?;
                tx.commit()?;
                Ok(n > 0)
            },
        )
    }

    /// If several rows claim to be active (a database written by an older
    /// build), the most recently used one wins.
    pub fn get_active_model(&self) -> Result<Option<Model>> {
        self.read("get active model", |c| {
            c.query_row(
                &format!(
                    "SELECT {MODEL_COLUMNS} FROM models WHERE is_active = 1 \
                     ORDER BY last_used DESC, id DESC LIMIT 1"
                ),
                [],
                Model::from_row,
            )
            .optional()
        })
    }
}
