//! Embedded SQLite persistence for settings and the device, personality,
//! conversation, model and network-stat registries.
//!
//! One [`Store`] owns the only connection. It is opened once by the
//! application root and handed to whoever needs it; every call locks the
//! connection for its duration, so statements never overlap.

mod conversations;
mod devices;
mod models;
mod network_stats;
mod personalities;
mod schema;
mod settings;

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use serde_json::Value;
use spark_observability::{trace, Span};

pub use conversations::{ConversationMessage, ConversationRole, DEFAULT_CONVERSATION_LIMIT};
pub use devices::{Device, DeviceRole, DeviceStatus, DeviceUpsert};
pub use models::{Model, NewModel};
pub use network_stats::{NetworkStat, DEFAULT_NETWORK_STAT_LIMIT};
pub use personalities::{NewPersonality, Personality, PersonalityUpdate};
pub use settings::{Setting, DEFAULT_ASSISTANT_NAME, DEFAULT_THEME_COLOR};

pub const DB_FILE_NAME: &str = "spark.db";
const STORE_CLOSED: &str = "store is closed";

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE_NAME)
}

pub struct Store {
    conn: Mutex<Option<Connection>>,
    data_dir: PathBuf,
}

impl Store {
    /// Opens (or creates) `<data_dir>/spark.db`, applies the schema and seeds
    /// default settings.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir failed: {}", data_dir.display()))?;
        let path = db_path(data_dir);
        let span = Span::start(
            data_dir,
            None,
            "Store",
            "STORE.open",
            Some(serde_json::json!({"db": path.display().to_string()})),
        );
        let conn = match Connection::open(&path) {
            Ok(c) => c,
            Err(e) => {
                span.err("db", "E_STORE_OPEN", &e.to_string(), None);
                return Err(anyhow!(e).context("open sqlite failed"));
            }
        };
        match Self::init(conn, data_dir) {
            Ok(store) => {
                span.ok(None);
                Ok(store)
            }
            Err(e) => {
                span.err_anyhow("db", "E_STORE_INIT", &e, None);
                Err(e)
            }
        }
    }

    /// A private in-memory database; traces still go to `data_dir`.
    pub fn open_in_memory(data_dir: &Path) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite failed")?;
        Self::init(conn, data_dir)
    }

    fn init(conn: Connection, data_dir: &Path) -> Result<Self> {
        schema::apply(&conn)?;
        settings::seed_defaults(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Closes the connection, surfacing any error SQLite reports on close.
    /// Later calls fail with "store is closed"; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(conn) = self.lock().take() else {
            return Ok(());
        };
        let res = conn
            .close()
            .map_err(|(_, e)| anyhow!(e).context("close sqlite failed"));
        trace::event(
            &self.data_dir,
            None,
            "Store",
            "STORE.close",
            if res.is_ok() { "ok" } else { "err" },
            None,
        );
        res
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read<T>(&self, what: &'static str, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or_else(|| anyhow!(STORE_CLOSED))?;
        f(conn).with_context(|| format!("{what} failed"))
    }

    /// Runs a write under a trace span named `step_id`.
    fn write<T>(
        &self,
        step_id: &str,
        code: &str,
        ctx: Option<Value>,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let span = Span::start(&self.data_dir, None, "Store", step_id, ctx);
        let mut guard = self.lock();
        let Some(conn) = guard.as_mut() else {
            span.err("db", "E_STORE_CLOSED", STORE_CLOSED, None);
            return Err(anyhow!(STORE_CLOSED).context(format!("{step_id} failed")));
        };
        match f(conn) {
            Ok(v) => {
                span.ok(None);
                Ok(v)
            }
            Err(e) => {
                span.err("db", code, &e.to_string(), None);
                Err(anyhow!(e).context(format!("{step_id} failed")))
            }
        }
    }
}
