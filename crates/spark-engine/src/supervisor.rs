//! Named task slots, one live helper each.
//!
//! Starting an occupied slot kills the old helper and replaces it at once;
//! every slot entry carries an instance number and events from any other
//! instance are dropped, so a restarted task never leaks stale output.
//! Stopping keeps the entry until its `Close` arrives so the termination
//! notices still reach the UI.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spark_observability::{trace, Span};
use spark_storage::{DeviceStatus, NewModel, Store};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::{
    events::{AppEvent, EventSink},
    process::{ExitOutcome, ProcessError, ProcessEvent, ProcessHandle, ProcessSpec, Subscription},
    runtime::RuntimeConfig,
    tagged_line::{parse_tagged_line, FoundDevice, LostDevice, TaggedLine},
    tasks::{self, TaskSlot},
};

pub const ACK_HOST_STARTED: &str = "Host process initiated";
pub const ACK_CLIENT_STARTED: &str = "Client process initiated";
pub const ACK_VOICE_STARTED: &str = "Voice Assistant initiated";
pub const ACK_VOICE_STOPPED: &str = "Voice Assistant stopped";
pub const ACK_DISCOVERY_STARTED: &str = "Network discovery initiated";
pub const ACK_DISCOVERY_STOPPED: &str = "Network discovery stopped";
pub const ACK_DOWNLOAD_STARTED: &str = "Model download initiated";

pub const IDLE_STATE: &str = "IDLE";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{0}")]
    Process(Arc<ProcessError>),
    #[error("failed to parse model list: {0}")]
    ParseModelList(String),
    #[error("model browse was superseded by a newer request")]
    Superseded,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Process(e) => e.code(),
            Self::ParseModelList(_) => "E_MODEL_LIST_PARSE",
            Self::Superseded => "E_SUPERSEDED",
            Self::Store(_) => "E_STORE",
        }
    }
}

/// One entry of the model catalogue printed by the browse helper. Unknown
/// fields are kept in `extra` and passed through to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowsedModel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub downloads: Option<u64>,
    #[serde(default)]
    pub likes: Option<u64>,
    #[serde(default)]
    pub size_mb: Option<f64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

struct SlotEntry {
    instance: u64,
    handle: Arc<ProcessHandle>,
}

/// Per-instance routing state owned by its dispatch task.
struct Dispatch {
    slot: TaskSlot,
    instance: u64,
    run_id: String,
    model_id: Option<String>,
    failed: bool,
    discarded: usize,
}

struct Inner {
    config: RuntimeConfig,
    store: Arc<Store>,
    sink: Arc<dyn EventSink>,
    slots: Mutex<HashMap<TaskSlot, SlotEntry>>,
    next_instance: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: RuntimeConfig, store: Arc<Store>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                sink,
                slots: Mutex::new(HashMap::new()),
                next_instance: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn is_running(&self, slot: TaskSlot) -> bool {
        self.lock_slots().contains_key(&slot)
    }

    pub fn current_instance(&self, slot: TaskSlot) -> Option<u64> {
        self.lock_slots().get(&slot).map(|e| e.instance)
    }

    /// Serves the active model, or the default one when none is active.
    pub fn start_host(&self) -> Result<&'static str> {
        let model_id = self
            .inner
            .store
            .get_active_model()?
            .map(|m| m.model_id)
            .unwrap_or_else(|| tasks::DEFAULT_HOST_MODEL.to_string());
        let port = self.inner.store.get_setting(tasks::SETTING_HOST_PORT)?;
        self.start(TaskSlot::Host, tasks::host_args(&model_id, port.as_deref()), None);
        Ok(ACK_HOST_STARTED)
    }

    pub fn start_client(&self) -> Result<&'static str> {
        let addr = self
            .inner
            .store
            .get_setting(tasks::SETTING_SCHEDULER_ADDR)?
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| tasks::DEFAULT_SCHEDULER_ADDR.to_string());
        self.start(TaskSlot::Client, tasks::client_args(addr.trim()), None);
        Ok(ACK_CLIENT_STARTED)
    }

    pub fn start_voice(&self) -> Result<&'static str> {
        let name = self.inner.store.get_setting(tasks::SETTING_ASSISTANT_NAME)?;
        self.start(TaskSlot::Voice, tasks::voice_args(name.as_deref()), None);
        Ok(ACK_VOICE_STARTED)
    }

    pub fn stop_voice(&self) -> &'static str {
        self.stop(TaskSlot::Voice);
        ACK_VOICE_STOPPED
    }

    /// The helper only takes the name and role; personality and model are
    /// recorded in the trace.
    pub fn start_network_discovery(
        &self,
        device_name: &str,
        role: &str,
        personality: Option<&str>,
        model: Option<&str>,
    ) -> &'static str {
        let instance = self.start(
            TaskSlot::NetworkDiscovery,
            tasks::discovery_args(device_name, role),
            None,
        );
        trace::event(
            self.data_dir(),
            None,
            "Supervisor",
            "SUP.discovery_identity",
            "ok",
            Some(serde_json::json!({
                "instance": instance,
                "device_name": device_name,
                "role": role,
                "personality": personality,
                "model": model,
            })),
        );
        ACK_DISCOVERY_STARTED
    }

    pub fn stop_network_discovery(&self) -> &'static str {
        self.stop(TaskSlot::NetworkDiscovery);
        ACK_DISCOVERY_STOPPED
    }

    /// Progress lines stream to the UI; a clean exit records the model.
    pub fn download_model(&self, model_id: &str) -> &'static str {
        self.start(
            TaskSlot::ModelDownload,
            tasks::download_args(model_id),
            Some(model_id.to_string()),
        );
        ACK_DOWNLOAD_STARTED
    }

    /// Runs the catalogue helper to completion and parses everything it
    /// printed as one JSON array.
    pub async fn browse_models(
        &self,
        task: &str,
        limit: u32,
    ) -> Result<Vec<BrowsedModel>, SupervisorError> {
        let slot = TaskSlot::ModelBrowse;
        let (instance, handle, mut events) = self.launch(slot, tasks::browse_args(task, limit));
        let run_id = run_id();
        let span = Span::start(
            self.data_dir(),
            Some(run_id.as_str()),
            "Supervisor",
            "SUP.browse_models",
            Some(serde_json::json!({"task": task, "limit": limit, "instance": instance})),
        );

        let (tx, rx) = oneshot::channel();
        handle
            .end(move |result| {
                let _ = tx.send(result);
            })
            .await;

        let mut output = String::new();
        let mut broadcast_error = None;
        while let Some(ev) = events.recv().await {
            match ev {
                ProcessEvent::Message(line) => {
                    output.push_str(&line);
                    output.push('\n');
                }
                ProcessEvent::Error(e) => {
                    broadcast_error.get_or_insert(e);
                }
                ProcessEvent::Close(_) => break,
                ProcessEvent::Stderr(_) | ProcessEvent::Data(_) => {}
            }
        }
        let finished = rx.await.unwrap_or(Ok(()));
        let still_current = self.release(slot, instance);

        let result = if !still_current {
            Err(SupervisorError::Superseded)
        } else if let Some(e) = finished.err().or(broadcast_error) {
            Err(SupervisorError::Process(e))
        } else {
            serde_json::from_str::<Vec<BrowsedModel>>(output.trim())
                .map_err(|e| SupervisorError::ParseModelList(e.to_string()))
        };

        match &result {
            Ok(models) => span.ok(Some(serde_json::json!({"models": models.len()}))),
            Err(SupervisorError::Superseded) => span.skipped("superseded", None),
            Err(e) => {
                span.err(
                    "process",
                    e.code(),
                    &e.to_string(),
                    Some(serde_json::json!({"output_chars": output.len()})),
                );
                self.emit(AppEvent::LogUpdate(format!("ERROR: {e}")));
            }
        }
        result
    }

    /// Signals every live helper and stops routing their events. Returns how
    /// many were signalled.
    pub fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        let slots = self.lock_slots();
        let signalled: Vec<&'static str> = slots
            .iter()
            .filter(|(_, e)| e.handle.kill(None))
            .map(|(slot, _)| slot.as_str())
            .collect();
        trace::event(
            self.data_dir(),
            None,
            "Supervisor",
            "SUP.shutdown",
            "ok",
            Some(serde_json::json!({"signalled": signalled})),
        );
        signalled.len()
    }

    fn data_dir(&self) -> &Path {
        self.inner.store.data_dir()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<TaskSlot, SlotEntry>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: AppEvent) {
        self.inner.sink.emit(event);
    }

    /// Drops the slot entry if it still belongs to `instance`.
    fn release(&self, slot: TaskSlot, instance: u64) -> bool {
        let mut slots = self.lock_slots();
        if slots.get(&slot).is_some_and(|e| e.instance == instance) {
            slots.remove(&slot);
            true
        } else {
            false
        }
    }

    /// Kills whatever occupies `slot` and spawns the replacement under the
    /// same lock, so two racing starts cannot both survive.
    fn launch(
        &self,
        slot: TaskSlot,
        args: Vec<String>,
    ) -> (u64, Arc<ProcessHandle>, Subscription<ProcessEvent>) {
        let config = &self.inner.config;
        let spec = ProcessSpec::python_script(&config.python, config.script(slot.script()))
            .program_args(config.python_args.clone())
            .args(args);
        let command = spec.command_args();

        let mut slots = self.lock_slots();
        if let Some(old) = slots.remove(&slot) {
            let signalled = old.handle.kill(None);
            trace::event(
                self.data_dir(),
                None,
                "Supervisor",
                "SUP.replace",
                "ok",
                Some(serde_json::json!({
                    "slot": slot.as_str(),
                    "instance": old.instance,
                    "signalled": signalled,
                })),
            );
        }
        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, events) = ProcessHandle::spawn(spec);
        let handle = Arc::new(handle);
        slots.insert(
            slot,
            SlotEntry {
                instance,
                handle: handle.clone(),
            },
        );
        drop(slots);

        trace::event(
            self.data_dir(),
            None,
            "Supervisor",
            "SUP.start",
            "ok",
            Some(serde_json::json!({
                "slot": slot.as_str(),
                "instance": instance,
                "pid": handle.pid(),
                "python": config.python.display().to_string(),
                "args": command,
            })),
        );
        (instance, handle, events)
    }

    fn start(&self, slot: TaskSlot, args: Vec<String>, model_id: Option<String>) -> u64 {
        let (instance, _handle, events) = self.launch(slot, args);
        let dispatch = Dispatch {
            slot,
            instance,
            run_id: run_id(),
            model_id,
            failed: false,
            discarded: 0,
        };
        self.spawn_dispatch(dispatch, events);
        instance
    }

    fn stop(&self, slot: TaskSlot) -> bool {
        let (instance, signalled) = match self.lock_slots().get(&slot) {
            Some(e) => (Some(e.instance), e.handle.kill(None)),
            None => (None, false),
        };
        trace::event(
            self.data_dir(),
            None,
            "Supervisor",
            "SUP.stop",
            if instance.is_some() { "ok" } else { "skipped" },
            Some(serde_json::json!({
                "slot": slot.as_str(),
                "instance": instance,
                "signalled": signalled,
            })),
        );
        signalled
    }

    fn spawn_dispatch(&self, mut dispatch: Dispatch, mut events: Subscription<ProcessEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = this.inner.shutdown.cancelled() => None,
                    ev = events.recv() => ev,
                };
                let Some(event) = next else {
                    break;
                };
                let closing = matches!(event, ProcessEvent::Close(_));
                // Routed under the slot lock so a concurrent restart cannot
                // replace this instance between the check and the emit.
                let slots = this.lock_slots();
                if slots
                    .get(&dispatch.slot)
                    .is_some_and(|e| e.instance == dispatch.instance)
                {
                    this.route(&mut dispatch, event);
                } else {
                    dispatch.discarded += 1;
                }
                drop(slots);
                if closing {
                    break;
                }
            }
            if dispatch.discarded > 0 {
                trace::event(
                    this.data_dir(),
                    Some(dispatch.run_id.as_str()),
                    "Supervisor",
                    "SUP.stale_events",
                    "skipped",
                    Some(serde_json::json!({
                        "slot": dispatch.slot.as_str(),
                        "instance": dispatch.instance,
                        "discarded": dispatch.discarded,
                    })),
                );
            }
            this.release(dispatch.slot, dispatch.instance);
        });
    }

    fn route(&self, d: &mut Dispatch, event: ProcessEvent) {
        match event {
            ProcessEvent::Message(line) => self.route_line(d, line),
            ProcessEvent::Stderr(line) => trace::event(
                self.data_dir(),
                Some(d.run_id.as_str()),
                "Supervisor",
                "SUP.stderr",
                "ok",
                Some(serde_json::json!({"slot": d.slot.as_str(), "line": line})),
            ),
            ProcessEvent::Data(_) => {}
            ProcessEvent::Error(e) => {
                d.failed = true;
                trace::event(
                    self.data_dir(),
                    Some(d.run_id.as_str()),
                    "Supervisor",
                    "SUP.process_error",
                    "err",
                    Some(serde_json::json!({
                        "slot": d.slot.as_str(),
                        "instance": d.instance,
                        "code": e.code(),
                        "message": e.to_string(),
                        "exit_code": e.exit_code(),
                    })),
                );
                self.emit(AppEvent::LogUpdate(format!("ERROR: {e}")));
            }
            ProcessEvent::Close(outcome) => self.on_close(d, outcome),
        }
    }

    fn route_line(&self, d: &Dispatch, line: String) {
        match d.slot {
            TaskSlot::Host | TaskSlot::Client => self.emit(AppEvent::LogUpdate(line)),
            TaskSlot::Voice | TaskSlot::NetworkDiscovery => self.route_tagged(d, line),
            TaskSlot::ModelDownload => self.emit(AppEvent::ModelDownloadProgress(line)),
            // Collected by browse_models itself.
            TaskSlot::ModelBrowse => {}
        }
    }

    /// Discovery mirrors every raw line to its own channel, which then
    /// stands in for the plain log.
    fn route_tagged(&self, d: &Dispatch, line: String) {
        let mirrored = d.slot == TaskSlot::NetworkDiscovery;
        if mirrored {
            self.emit(AppEvent::NetworkDiscoveryUpdate(line.clone()));
        }
        match parse_tagged_line(&line) {
            TaggedLine::State(state) => self.emit(AppEvent::StateUpdate(state)),
            TaggedLine::Log(text) | TaggedLine::Plain(text) => {
                if !mirrored {
                    self.emit(AppEvent::LogUpdate(text));
                }
            }
            TaggedLine::Found(device) => self.device_found(d, &device),
            TaggedLine::Lost(device) => self.device_lost(d, &device),
            TaggedLine::Invalid { tag, line, reason } => {
                trace::event(
                    self.data_dir(),
                    Some(d.run_id.as_str()),
                    "Supervisor",
                    "SUP.tagged_line",
                    "err",
                    Some(serde_json::json!({
                        "code": "E_TAG_PAYLOAD",
                        "tag": tag.prefix(),
                        "reason": reason,
                        "line": line,
                    })),
                );
                if !mirrored {
                    self.emit(AppEvent::LogUpdate(line));
                }
            }
        }
    }

    fn device_found(&self, d: &Dispatch, device: &FoundDevice) {
        let store = &self.inner.store;
        match store
            .upsert_device(&device.to_upsert())
            .and_then(|_| store.get_all_devices())
        {
            Ok(devices) => self.emit(AppEvent::DevicesUpdated(devices)),
            Err(e) => self.store_failed(&d.run_id, "SUP.device_found", &e),
        }
    }

    fn device_lost(&self, d: &Dispatch, device: &LostDevice) {
        let store = &self.inner.store;
        match store
            .update_device_status(&device.name, DeviceStatus::Offline)
            .and_then(|_| store.get_all_devices())
        {
            Ok(devices) => self.emit(AppEvent::DevicesUpdated(devices)),
            Err(e) => self.store_failed(&d.run_id, "SUP.device_lost", &e),
        }
    }

    fn on_close(&self, d: &Dispatch, outcome: ExitOutcome) {
        trace::event(
            self.data_dir(),
            Some(d.run_id.as_str()),
            "Supervisor",
            "SUP.exit",
            if d.failed { "err" } else { "ok" },
            Some(serde_json::json!({
                "slot": d.slot.as_str(),
                "instance": d.instance,
                "code": outcome.code,
                "signal": outcome.signal,
            })),
        );
        match d.slot {
            TaskSlot::Host => self.emit(AppEvent::LogUpdate("Host process terminated.".to_string())),
            TaskSlot::Client => {
                self.emit(AppEvent::LogUpdate("Client process terminated.".to_string()))
            }
            TaskSlot::Voice => {
                self.emit(AppEvent::LogUpdate("Voice Assistant terminated.".to_string()));
                self.emit(AppEvent::StateUpdate(IDLE_STATE.to_string()));
            }
            TaskSlot::ModelDownload => {
                if let Some(model_id) = d.model_id.clone() {
                    if !d.failed && outcome.success() {
                        let this = self.clone();
                        let run_id = d.run_id.clone();
                        tokio::spawn(async move { this.record_download(&run_id, &model_id).await });
                    }
                }
            }
            TaskSlot::NetworkDiscovery | TaskSlot::ModelBrowse => {}
        }
    }

    /// Measures the downloaded directory off the runtime threads, then
    /// registers the model.
    async fn record_download(&self, run_id: &str, model_id: &str) {
        let local_path = self.inner.config.model_dir(model_id);
        let dir = local_path.clone();
        let size_mb = tokio::task::spawn_blocking(move || dir_size_mb(&dir))
            .await
            .unwrap_or(None);
        let model = NewModel {
            model_id: model_id.to_string(),
            name: tasks::model_display_name(model_id),
            size_mb,
            local_path: Some(local_path.display().to_string()),
        };
        match self.inner.store.save_model(&model) {
            Ok(()) => self.emit(AppEvent::ModelDownloadComplete(model_id.to_string())),
            Err(e) => self.store_failed(run_id, "SUP.record_download", &e),
        }
    }

    fn store_failed(&self, run_id: &str, step_id: &str, err: &anyhow::Error) {
        trace::event(
            self.data_dir(),
            Some(run_id),
            "Supervisor",
            step_id,
            "err",
            Some(serde_json::json!({"code": "E_STORE", "message": format!("{err:#}")})),
        );
        self.emit(AppEvent::LogUpdate(format!("ERROR: {err:#}")));
    }
}

fn run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Total size of the regular files under `dir` in MiB (two decimals), or
/// `None` when it is not a directory. Symlinks are not followed.
fn dir_size_mb(dir: &Path) -> Option<f64> {
    if !dir.is_dir() {
        return None;
    }
    let bytes: u64 = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    Some((bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0)
}

#[cfg(all(test, unix))]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use spark_storage::DeviceRole;
    use tempfile::TempDir;

    use super::*;
    use crate::events::test_support::RecordingSink;

    struct Harness {
        supervisor: Supervisor,
        store: Arc<Store>,
        sink: Arc<RecordingSink>,
        bridge: PathBuf,
        _td: TempDir,
    }

    /// Helpers are `/bin/sh` scripts written under the script names the
    /// supervisor expects.
    fn harness(python: &str) -> Harness {
        let td = tempfile::tempdir().expect("tempdir");
        let bridge = td.path().join("bridge");
        std::fs::create_dir_all(&bridge).unwrap();
        let store = Arc::new(Store::open(&td.path().join("data")).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let mut config = RuntimeConfig::new(
            PathBuf::from(python),
            bridge.clone(),
            td.path().join("models"),
        );
        config.python_args.clear();
        let supervisor = Supervisor::new(config, store.clone(), sink.clone());
        Harness {
            supervisor,
            store,
            sink,
            bridge,
            _td: td,
        }
    }

    impl Harness {
        fn script(&self, slot: TaskSlot, body: &str) {
            std::fs::write(self.bridge.join(slot.script()), body).unwrap();
        }

        async fn wait_until(&self, what: &str, cond: impl Fn(&RecordingSink) -> bool) {
            for _ in 0..500 {
                if cond(&self.sink) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {what}: {:?}", self.sink.snapshot());
        }

        async fn wait_idle(&self, slot: TaskSlot) {
            for _ in 0..500 {
                if !self.supervisor.is_running(slot) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{} still running", slot.as_str());
        }
    }

    #[tokio::test]
    async fn voice_lines_follow_the_tag_protocol() {
        let h = harness("/bin/sh");
        h.script(
            TaskSlot::Voice,
            "echo 'STATE:LISTENING'\necho 'LOG:heard you'\necho 'just text'\n",
        );
        assert_eq!(h.supervisor.start_voice().unwrap(), ACK_VOICE_STARTED);
        h.wait_until("voice close", |s| {
            s.strings("log-update").contains(&"Voice Assistant terminated.".to_string())
        })
        .await;

        assert_eq!(h.sink.strings("state-update"), vec!["LISTENING", "IDLE"]);
        assert_eq!(
            h.sink.strings("log-update"),
            vec!["heard you", "just text", "Voice Assistant terminated."]
        );
        h.wait_idle(TaskSlot::Voice).await;
    }

    #[tokio::test]
    async fn discovery_found_and_lost_update_the_registry() {
        let h = harness("/bin/sh");
        h.script(
            TaskSlot::NetworkDiscovery,
            r#"echo "LOG: discovering as $1 ($2)"
echo 'FOUND:{"name":"nodeA","address":"10.0.0.5","port":9000,"role":"client"}'
echo 'FOUND: {broken'
echo 'LOST: {"name":"nodeA"}'
"#,
        );
        h.supervisor
            .start_network_discovery("desk", "host", Some("Ada"), None);
        h.wait_until("two device pushes", |s| s.on_channel("devices-updated").len() == 2)
            .await;

        let pushes = h.sink.on_channel("devices-updated");
        let AppEvent::DevicesUpdated(first) = &pushes[0] else {
            unreachable!()
        };
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].device_id, "nodeA");
        assert_eq!(first[0].status, DeviceStatus::Online);
        assert_eq!(first[0].role, DeviceRole::Client);
        assert_eq!(first[0].port, Some(9000));

        let d = h.store.get_device("nodeA").unwrap().unwrap();
        assert_eq!(d.status, DeviceStatus::Offline);

        let raw = h.sink.strings("network-discovery-update");
        assert_eq!(raw.len(), 4);
        assert_eq!(raw[0], "LOG: discovering as desk (host)");
        assert_eq!(raw[2], "FOUND: {broken");
        // Discovery chatter stays off the main log.
        assert!(h.sink.strings("log-update").is_empty());
    }

    #[tokio::test]
    async fn repeated_found_keeps_one_row() {
        let h = harness("/bin/sh");
        let found = r#"echo 'FOUND: {"name":"nodeB","role":"host"}'"#;
        h.script(TaskSlot::NetworkDiscovery, &format!("{found}\n{found}\n"));
        h.supervisor.start_network_discovery("desk", "client", None, None);
        h.wait_until("two device pushes", |s| s.on_channel("devices-updated").len() == 2)
            .await;
        assert_eq!(h.store.get_all_devices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_replaces_instance_and_drops_stale_output() {
        let h = harness("/bin/sh");
        h.script(TaskSlot::Voice, "echo 'STATE:READY'\nexec sleep 30\n");

        h.supervisor.start_voice().unwrap();
        let first = h.supervisor.current_instance(TaskSlot::Voice).unwrap();
        h.wait_until("first ready", |s| s.strings("state-update").len() == 1)
            .await;

        h.supervisor.start_voice().unwrap();
        let second = h.supervisor.current_instance(TaskSlot::Voice).unwrap();
        assert!(second > first);
        h.wait_until("second ready", |s| s.strings("state-update").len() == 2)
            .await;

        assert_eq!(h.supervisor.stop_voice(), ACK_VOICE_STOPPED);
        h.wait_until("voice close", |s| {
            s.strings("state-update").last().map(String::as_str) == Some(IDLE_STATE)
        })
        .await;
        h.wait_idle(TaskSlot::Voice).await;

        // Only the surviving instance announces its termination.
        let terminated = h
            .sink
            .strings("log-update")
            .into_iter()
            .filter(|l| l == "Voice Assistant terminated.")
            .count();
        assert_eq!(terminated, 1);
        assert!(!h
            .sink
            .strings("log-update")
            .iter()
            .any(|l| l.starts_with("ERROR:")));
    }

    #[tokio::test]
    async fn stop_on_empty_slot_is_an_acknowledged_no_op() {
        let h = harness("/bin/sh");
        assert_eq!(h.supervisor.stop_voice(), ACK_VOICE_STOPPED);
        assert_eq!(h.supervisor.stop_network_discovery(), ACK_DISCOVERY_STOPPED);
        assert!(h.sink.snapshot().is_empty());
    }

    #[tokio::test]
    async fn browse_parses_the_concatenated_output() {
        let h = harness("/bin/sh");
        h.script(
            TaskSlot::ModelBrowse,
            r#"[ "$1" = browse ] || exit 9
echo '[{"id":"org/a","downloads":10,"tags":["x"]},'
echo '{"id":"org/b","name":"b","pipeline":"text-generation"},'
echo '{"id":"org/c"}]'
"#,
        );
        let models = h.supervisor.browse_models("text-generation", 3).await.unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0].downloads, Some(10));
        assert_eq!(models[1].extra.get("pipeline"), Some(&Value::from("text-generation")));
        assert!(!h.supervisor.is_running(TaskSlot::ModelBrowse));
    }

    #[tokio::test]
    async fn browse_with_garbage_output_is_a_parse_error() {
        let h = harness("/bin/sh");
        h.script(TaskSlot::ModelBrowse, "echo 'Error fetching popular models'\n");
        let err = h.supervisor.browse_models("text-generation", 3).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ParseModelList(_)), "{err:?}");
        assert!(err.to_string().starts_with("failed to parse model list"));
    }

    #[tokio::test]
    async fn browse_failure_is_a_process_error() {
        let h = harness("/bin/sh");
        h.script(TaskSlot::ModelBrowse, "echo '[]'\necho 'hub unreachable' >&2\nexit 1\n");
        let err = h.supervisor.browse_models("text-generation", 3).await.unwrap_err();
        match err {
            SupervisorError::Process(e) => assert_eq!(e.to_string(), "hub unreachable"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(h
            .sink
            .strings("log-update")
            .contains(&"ERROR: hub unreachable".to_string()));
    }

    #[tokio::test]
    async fn successful_download_records_the_model() {
        let h = harness("/bin/sh");
        h.script(
            TaskSlot::ModelDownload,
            "echo \"LOG: Starting download of model: $2\"\necho 'LOG: done'\n",
        );
        assert_eq!(h.supervisor.download_model("org/tiny-model"), ACK_DOWNLOAD_STARTED);
        h.wait_until("download complete", |s| {
            !s.on_channel("model-download-complete").is_empty()
        })
        .await;

        assert_eq!(
            h.sink.strings("model-download-progress"),
            vec!["LOG: Starting download of model: org/tiny-model", "LOG: done"]
        );
        assert_eq!(h.sink.strings("model-download-complete"), vec!["org/tiny-model"]);
        let models = h.store.get_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "tiny-model");
        assert!(models[0]
            .local_path
            .as_deref()
            .unwrap()
            .ends_with("org_tiny-model"));
    }

    #[tokio::test]
    async fn downloaded_directory_size_is_recorded() {
        let h = harness("/bin/sh");
        let model_dir = h.supervisor.config().model_dir("org/sized");
        h.script(
            TaskSlot::ModelDownload,
            &format!(
                "mkdir -p '{dir}/sub'\n\
                 head -c 1048576 /dev/zero > '{dir}/weights.bin'\n\
                 head -c 524288 /dev/zero > '{dir}/sub/extra.bin'\n\
                 echo 'LOG: done'\n",
                dir = model_dir.display()
            ),
        );
        h.supervisor.download_model("org/sized");
        h.wait_until("download complete", |s| {
            !s.on_channel("model-download-complete").is_empty()
        })
        .await;

        let models = h.store.get_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].size_mb, Some(1.5));
    }

    #[test]
    fn dir_size_is_none_for_a_missing_directory() {
        let td = tempfile::tempdir().expect("tempdir");
        assert_eq!(dir_size_mb(&td.path().join("absent")), None);
        std::fs::write(td.path().join("f"), vec![0u8; 10_486]).unwrap();
        assert_eq!(dir_size_mb(td.path()), Some(0.01));
    }

    #[tokio::test]
    async fn killed_download_records_nothing() {
        let h = harness("/bin/sh");
        h.script(
            TaskSlot::ModelDownload,
            "echo \"pid:$$\"\nexec sleep 30\n",
        );
        h.supervisor.download_model("org/interrupted");
        h.wait_until("pid line", |s| !s.strings("model-download-progress").is_empty())
            .await;
        let line = h.sink.strings("model-download-progress")[0].clone();
        let pid = line.trim_start_matches("pid:");
        let status = std::process::Command::new("kill")
            .args(["-TERM", pid])
            .status()
            .unwrap();
        assert!(status.success());

        h.wait_idle(TaskSlot::ModelDownload).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.store.get_models().unwrap().is_empty());
        assert!(h.sink.on_channel("model-download-complete").is_empty());
    }

    #[tokio::test]
    async fn failed_download_records_nothing() {
        let h = harness("/bin/sh");
        h.script(TaskSlot::ModelDownload, "echo 'LOG: start'\necho 'boom' >&2\nexit 3\n");
        h.supervisor.download_model("org/broken");
        h.wait_until("error", |s| {
            s.strings("log-update").contains(&"ERROR: boom".to_string())
        })
        .await;
        h.wait_idle(TaskSlot::ModelDownload).await;
        assert!(h.store.get_models().unwrap().is_empty());
        assert!(h.sink.on_channel("model-download-complete").is_empty());
    }

    #[tokio::test]
    async fn host_uses_active_model_and_reports_termination() {
        let h = harness("/bin/sh");
        h.script(TaskSlot::Host, "echo \"serving $2\"\n");
        h.store
            .save_model(&NewModel {
                model_id: "org/picked".to_string(),
                name: "picked".to_string(),
                ..Default::default()
            })
            .unwrap();
        h.store.set_active_model("org/picked").unwrap();

        assert_eq!(h.supervisor.start_host().unwrap(), ACK_HOST_STARTED);
        h.wait_until("host close", |s| {
            s.strings("log-update").contains(&"Host process terminated.".to_string())
        })
        .await;
        assert_eq!(
            h.sink.strings("log-update"),
            vec!["serving org/picked", "Host process terminated."]
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_logged_then_terminated() {
        let h = harness("/definitely/not/python");
        h.supervisor.start_client().unwrap();
        h.wait_until("client close", |s| {
            s.strings("log-update").contains(&"Client process terminated.".to_string())
        })
        .await;
        let log = h.sink.strings("log-update");
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("ERROR: failed to start /definitely/not/python"));
    }

    #[tokio::test]
    async fn shutdown_signals_live_helpers() {
        let h = harness("/bin/sh");
        h.script(TaskSlot::Client, "exec sleep 30\n");
        h.supervisor.start_client().unwrap();
        assert_eq!(h.supervisor.shutdown(), 1);
        h.wait_idle(TaskSlot::Client).await;
    }
}
