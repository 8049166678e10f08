mod data_dir;
mod panic_log;
mod startup_trace;

use std::{path::PathBuf, sync::Arc};

use spark_engine::{
    runtime, AppEvent, BrowsedModel, EventSink, RuntimeConfig, RuntimeStatus, Supervisor,
};
use spark_observability::{trace, Span};
use spark_storage::{
    ConversationMessage, ConversationRole, Device, Model, NetworkStat, NewPersonality,
    Personality, PersonalityUpdate, Setting, Store,
};
use tauri::{webview::PageLoadEvent, Emitter, Manager, State};

const DEFAULT_BROWSE_TASK: &str = "text-generation";
const DEFAULT_BROWSE_LIMIT: u32 = 20;

struct AppState {
    data_dir: PathBuf,
    store: Arc<Store>,
    supervisor: Supervisor,
    runtime: RuntimeStatus,
}

/// Forwards supervisor notifications to every webview.
struct TauriSink {
    app: tauri::AppHandle,
}

impl EventSink for TauriSink {
    fn emit(&self, event: AppEvent) {
        let _ = self.app.emit(event.channel(), event.payload());
    }
}

fn init_state(app: tauri::AppHandle) -> anyhow::Result<AppState> {
    let data_dir = data_dir::data_dir()?;
    let repo_root = data_dir::repo_root()?;
    let store = Arc::new(Store::open(&data_dir)?);
    let (python, runtime) = runtime::initialize_and_verify(&data_dir, &repo_root);
    let config = RuntimeConfig::from_env(&repo_root, python);
    let sink: Arc<dyn EventSink> = Arc::new(TauriSink { app });
    let supervisor = Supervisor::new(config, store.clone(), sink);
    Ok(AppState {
        data_dir,
        store,
        supervisor,
        runtime,
    })
}

fn cmd_span(
    data_dir: &std::path::Path,
    task_id: Option<&str>,
    step_id: &str,
    ctx: Option<serde_json::Value>,
) -> Span {
    Span::start(data_dir, task_id, "Cmd", step_id, ctx)
}

/// Closes `span` according to `res` and stringifies the error for the UI.
fn finish<T>(span: Span, code: &str, res: anyhow::Result<T>) -> Result<T, String> {
    match res {
        Ok(v) => {
            span.ok(None);
            Ok(v)
        }
        Err(e) => {
            span.err_anyhow("cmd", code, &e, None);
            Err(e.to_string())
        }
    }
}

fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[tauri::command]
fn runtime_status(state: State<'_, AppState>) -> Result<RuntimeStatus, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.runtime_status", None);
    span.ok(Some(serde_json::json!({"ready": state.runtime.ready})));
    Ok(state.runtime.clone())
}

// Launch commands are async so the child is spawned on the tauri runtime.

#[tauri::command]
async fn start_host(state: State<'_, AppState>) -> Result<String, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.start_host", None);
    finish(span, "E_CMD_START_HOST", state.supervisor.start_host().map(str::to_string))
}

#[tauri::command]
async fn start_client(state: State<'_, AppState>) -> Result<String, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.start_client", None);
    finish(span, "E_CMD_START_CLIENT", state.supervisor.start_client().map(str::to_string))
}

#[tauri::command]
async fn start_voice(state: State<'_, AppState>) -> Result<String, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.start_voice", None);
    finish(span, "E_CMD_START_VOICE", state.supervisor.start_voice().map(str::to_string))
}

#[tauri::command]
fn stop_voice(state: State<'_, AppState>) -> Result<String, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.stop_voice", None);
    let ack = state.supervisor.stop_voice();
    span.ok(None);
    Ok(ack.to_string())
}

#[tauri::command]
async fn start_network_discovery(
    state: State<'_, AppState>,
    device_name: String,
    role: String,
    personality: Option<String>,
    model: Option<String>,
) -> Result<String, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.start_network_discovery",
        Some(serde_json::json!({"device_name": device_name, "role": role})),
    );
    let ack = state.supervisor.start_network_discovery(
        &device_name,
        &role,
        personality.as_deref(),
        model.as_deref(),
    );
    span.ok(None);
    Ok(ack.to_string())
}

#[tauri::command]
fn stop_network_discovery(state: State<'_, AppState>) -> Result<String, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.stop_network_discovery", None);
    let ack = state.supervisor.stop_network_discovery();
    span.ok(None);
    Ok(ack.to_string())
}

#[tauri::command]
async fn browse_models(
    state: State<'_, AppState>,
    task: Option<String>,
    limit: Option<u32>,
) -> Result<Vec<BrowsedModel>, String> {
    let task = task
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BROWSE_TASK.to_string());
    let limit = limit.unwrap_or(DEFAULT_BROWSE_LIMIT);
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.browse_models",
        Some(serde_json::json!({"task": task, "limit": limit})),
    );
    match state.supervisor.browse_models(&task, limit).await {
        Ok(models) => {
            span.ok(Some(serde_json::json!({"models": models.len()})));
            Ok(models)
        }
        Err(e) => {
            span.err("cmd", e.code(), &e.to_string(), None);
            Err(e.to_string())
        }
    }
}

#[tauri::command]
async fn download_model(state: State<'_, AppState>, model_id: String) -> Result<String, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.download_model",
        Some(serde_json::json!({"model_id": model_id})),
    );
    let ack = state.supervisor.download_model(&model_id);
    span.ok(None);
    Ok(ack.to_string())
}

#[tauri::command]
fn get_local_models(state: State<'_, AppState>) -> Result<Vec<Model>, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.get_local_models", None);
    finish(span, "E_CMD_GET_LOCAL_MODELS", state.store.get_models())
}

/// Returns the model that is active afterwards; `None` when `model_id` is
/// not in the registry.
#[tauri::command]
fn set_active_model(state: State<'_, AppState>, model_id: String) -> Result<Option<Model>, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.set_active_model",
        Some(serde_json::json!({"model_id": model_id})),
    );
    let res = state
        .store
        .set_active_model(&model_id)
        .and_then(|_| state.store.get_active_model());
    finish(span, "E_CMD_SET_ACTIVE_MODEL", res)
}

#[tauri::command]
fn get_active_model(state: State<'_, AppState>) -> Result<Option<Model>, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.get_active_model", None);
    finish(span, "E_CMD_GET_ACTIVE_MODEL", state.store.get_active_model())
}

#[tauri::command]
fn get_setting(state: State<'_, AppState>, key: String) -> Result<Option<String>, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.get_setting",
        Some(serde_json::json!({"key": key})),
    );
    finish(span, "E_CMD_GET_SETTING", state.store.get_setting(&key))
}

#[tauri::command]
fn save_setting(state: State<'_, AppState>, key: String, value: String) -> Result<bool, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.save_setting",
        Some(serde_json::json!({"key": key})),
    );
    finish(
        span,
        "E_CMD_SAVE_SETTING",
        state.store.save_setting(&key, &value).map(|()| true),
    )
}

#[tauri::command]
fn get_all_settings(state: State<'_, AppState>) -> Result<Vec<Setting>, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.get_all_settings", None);
    finish(span, "E_CMD_GET_ALL_SETTINGS", state.store.get_all_settings())
}

#[tauri::command]
fn get_all_devices(state: State<'_, AppState>) -> Result<Vec<Device>, String> {
    let span = cmd_span(&state.data_dir, None, "CMD.get_all_devices", None);
    finish(span, "E_CMD_GET_ALL_DEVICES", state.store.get_all_devices())
}

#[tauri::command]
fn get_device(state: State<'_, AppState>, device_id: String) -> Result<Option<Device>, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.get_device",
        Some(serde_json::json!({"device_id": device_id})),
    );
    finish(span, "E_CMD_GET_DEVICE", state.store.get_device(&device_id))
}

#[tauri::command]
fn save_personality(
    state: State<'_, AppState>,
    personality: NewPersonality,
) -> Result<i64, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.save_personality",
        Some(serde_json::json!({"device_id": personality.device_id})),
    );
    finish(span, "E_CMD_SAVE_PERSONALITY", state.store.save_personality(&personality))
}

#[tauri::command]
fn get_personality(
    state: State<'_, AppState>,
    device_id: String,
) -> Result<Option<Personality>, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.get_personality",
        Some(serde_json::json!({"device_id": device_id})),
    );
    finish(span, "E_CMD_GET_PERSONALITY", state.store.get_personality(&device_id))
}

#[tauri::command]
fn update_personality(
    state: State<'_, AppState>,
    id: i64,
    updates: PersonalityUpdate,
) -> Result<bool, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.update_personality",
        Some(serde_json::json!({"id": id})),
    );
    finish(span, "E_CMD_UPDATE_PERSONALITY", state.store.update_personality(id, &updates))
}

#[tauri::command]
fn save_conversation(
    state: State<'_, AppState>,
    device_id: String,
    role: ConversationRole,
    content: String,
) -> Result<i64, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.save_conversation",
        Some(serde_json::json!({"device_id": device_id, "role": role.as_str()})),
    );
    finish(
        span,
        "E_CMD_SAVE_CONVERSATION",
        state.store.save_conversation(&device_id, role, &content),
    )
}

#[tauri::command]
fn get_conversations(
    state: State<'_, AppState>,
    device_id: String,
    limit: Option<i64>,
) -> Result<Vec<ConversationMessage>, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.get_conversations",
        Some(serde_json::json!({"device_id": device_id, "limit": limit})),
    );
    finish(
        span,
        "E_CMD_GET_CONVERSATIONS",
        state.store.get_conversations(&device_id, limit),
    )
}

#[tauri::command]
fn clear_conversations(state: State<'_, AppState>, device_id: String) -> Result<usize, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.clear_conversations",
        Some(serde_json::json!({"device_id": device_id})),
    );
    finish(span, "E_CMD_CLEAR_CONVERSATIONS", state.store.clear_conversations(&device_id))
}

#[tauri::command]
fn save_network_stat(
    state: State<'_, AppState>,
    device_id: String,
    metric_name: String,
    metric_value: f64,
) -> Result<i64, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.save_network_stat",
        Some(serde_json::json!({"device_id": device_id, "metric_name": metric_name})),
    );
    finish(
        span,
        "E_CMD_SAVE_NETWORK_STAT",
        state
            .store
            .save_network_stat(&device_id, &metric_name, metric_value),
    )
}

#[tauri::command]
fn get_network_stats(
    state: State<'_, AppState>,
    device_id: String,
    metric_name: String,
    limit: Option<i64>,
) -> Result<Vec<NetworkStat>, String> {
    let span = cmd_span(
        &state.data_dir,
        None,
        "CMD.get_network_stats",
        Some(serde_json::json!({"device_id": device_id, "metric_name": metric_name})),
    );
    finish(
        span,
        "E_CMD_GET_NETWORK_STATS",
        state.store.get_network_stats(&device_id, &metric_name, limit),
    )
}

/// Teardown runs from the exit event, not here.
#[tauri::command]
fn close_app(app: tauri::AppHandle, state: State<'_, AppState>) -> Result<(), String> {
    let span = cmd_span(&state.data_dir, None, "CMD.close_app", None);
    span.ok(None);
    app.exit(0);
    Ok(())
}

fn shutdown(app: &tauri::AppHandle) {
    let Some(state) = app.try_state::<AppState>() else {
        return;
    };
    let signalled = state.supervisor.shutdown();
    let closed = state.store.close();
    trace::event(
        &state.data_dir,
        None,
        "App",
        "APP.exit",
        if closed.is_ok() { "ok" } else { "err" },
        Some(serde_json::json!({
            "signalled": signalled,
            "store_close_error": closed.err().map(|e| format!("{e:#}")),
        })),
    );
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    startup_trace::mark_best_effort("run_enter");
    panic_log::install_best_effort();
    startup_trace::mark_best_effort("panic_hook_installed");
    let ctx = tauri::generate_context!();
    startup_trace::mark_best_effort("context_generated");
    let app = tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _argv, _cwd| {
            if let Some(w) = app.get_webview_window("main") {
                let _ = w.unminimize();
                let _ = w.set_focus();
            }
        }))
        .setup(|app| {
            startup_trace::mark_best_effort("setup_enter");
            let state = init_state(app.handle().clone())?;
            app.manage(state);
            startup_trace::mark_best_effort("setup_exit");
            Ok(())
        })
        .on_page_load(|webview, payload| {
            if webview.label() == "main" && matches!(payload.event(), PageLoadEvent::Finished) {
                let msg = AppEvent::MainProcessMessage(local_timestamp());
                let _ = webview.emit(msg.channel(), msg.payload());
            }
        })
        .invoke_handler(tauri::generate_handler![
            runtime_status,
            start_host,
            start_client,
            start_voice,
            stop_voice,
            start_network_discovery,
            stop_network_discovery,
            browse_models,
            download_model,
            get_local_models,
            set_active_model,
            get_active_model,
            get_setting,
            save_setting,
            get_all_settings,
            get_all_devices,
            get_device,
            save_personality,
            get_personality,
            update_personality,
            save_conversation,
            get_conversations,
            clear_conversations,
            save_network_stat,
            get_network_stats,
            close_app
        ])
        .build(ctx)
        .expect("error while building tauri application");

    app.run(|handle, event| {
        if let tauri::RunEvent::Exit = event {
            shutdown(handle);
        }
    });
}
