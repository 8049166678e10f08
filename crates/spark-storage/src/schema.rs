use anyhow::{Context, Result};
use rusqlite::Connection;

// Timestamps are unix milliseconds. Foreign keys document intent only;
// `PRAGMA foreign_keys` stays off, the personality registry creates
// placeholder devices instead.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT
);

CREATE TABLE IF NOT EXISTS devices (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_id TEXT UNIQUE,
  name TEXT NOT NULL,
  address TEXT,
  port INTEGER,
  role TEXT,
  status TEXT DEFAULT 'offline',
  personality TEXT,
  model TEXT,
  cpu_percent REAL,
  memory_percent REAL,
  gpu_info TEXT,
  last_seen INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen DESC);

CREATE TABLE IF NOT EXISTS personalities (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_id TEXT,
  name TEXT NOT NULL,
  backstory TEXT,
  traits TEXT,
  voice_settings TEXT,
  system_prompt TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  FOREIGN KEY (device_id) REFERENCES devices(device_id)
);

CREATE TABLE IF NOT EXISTS conversations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_id TEXT,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  FOREIGN KEY (device_id) REFERENCES devices(device_id)
);
CREATE INDEX IF NOT EXISTS idx_conversations_device ON conversations(device_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS models (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  model_id TEXT UNIQUE NOT NULL,
  name TEXT NOT NULL,
  size_mb REAL,
  local_path TEXT,
  download_date INTEGER,
  last_used INTEGER,
  is_active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS network_stats (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_id TEXT,
  metric_name TEXT,
  metric_value REAL,
  timestamp INTEGER NOT NULL,
  FOREIGN KEY (device_id) REFERENCES devices(device_id)
);
CREATE INDEX IF NOT EXISTS idx_network_stats_series ON network_stats(device_id, metric_name, timestamp DESC);

-- Kept so databases written by older builds still open.
CREATE TABLE IF NOT EXISTS history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  role TEXT,
  content TEXT,
  timestamp INTEGER
);
"#;

pub(crate) fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("init sqlite schema failed")
}
