use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use spark_observability::now_ms;

use crate::Store;

pub const DEFAULT_NETWORK_STAT_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStat {
    pub id: i64,
    pub device_id: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub timestamp: i64,
}

impl Store {
    pub fn save_network_stat(&self, device_id: &str, metric_name: &str, metric_value: f64) -> Result<i64> {
        let now = now_ms();
        self.write(
            "STORE.save_network_stat",
            "E_NETWORK_STAT_SAVE",
            Some(serde_json::json!({"device_id": device_id, "metric": metric_name})),
            |c| {
                c.execute(
                    "INSERT INTO network_stats (device_id, metric_name, metric_value, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![device_id, metric_name, metric_value, now],
                )?;
                Ok(c.last_insert_rowid())
            },
        )
    }

    /// The newest `limit` samples of one series (default
    /// [`DEFAULT_NETWORK_STAT_LIMIT`]).
    pub fn get_network_stats(
        &self,
        device_id: &str,
        metric_name: &str,
        limit: Option<i64>,
    ) -> Result<Vec<NetworkStat>> {
        let limit = limit.unwrap_or(DEFAULT_NETWORK_STAT_LIMIT);
        self.read("list network stats", |c| {
            let mut stmt = c.prepare(
                r#"
                SELECT id, device_id, metric_name, metric_value, timestamp
                FROM network_stats
                WHERE device_id = ?1 AND metric_name = ?2
                ORDER BY timestamp DESC, id DESC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt.query_map(params![device_id, metric_name, limit], |r| {
                Ok(NetworkStat {
                    id: r.get(0)?,
                    device_id: r.get(1)?,
                    metric_name: r.get(2)?,
                    metric_value: r.get(3)?,
                    timestamp: r.get(4)?,
                })
            })?;
            rows.collect()
        })
    }
}
