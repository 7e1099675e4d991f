use std::sync::{Arc, RwLock};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};

use harvest_common::config::AgentConfig;

use crate::plugins::{self, Plugin};
use crate::queue::JobQueue;
use crate::registry::TemplateRegistry;

/// Shared state threaded into every handler. Handlers stay thin: they read
/// or poke the queue and registry and answer in the JSON envelope; internal
/// types never leak.
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<RwLock<TemplateRegistry>>,
    pub plugins: Vec<Box<dyn Plugin>>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics))
        .route("/queue/start", get(queue_start))
        .route("/queue/stop", get(queue_stop))
        .route("/queue/status", get(queue_status))
        .route("/queue/inject", post(not_implemented))
        .route("/agent/reload", get(not_implemented))
        .route("/agent/shutdown", get(agent_shutdown))
        .route("/agent/install_plugin", get(not_implemented))
        .route("/agent/list_plugins", get(agent_list_plugins))
        .route("/tasks/status/{task_id}", get(task_status))
        .route("/tasks/shutdown/{task_id}", get(task_shutdown))
        .route("/templates/list_templates", get(templates_list_all))
        .route("/templates/list_templates/{category}", get(templates_list))
        .route("/templates/describe_templates", get(templates_describe_all))
        .route(
            "/templates/describe_templates/{category}",
            get(templates_describe),
        )
        .route(
            "/templates/get_template/{category}/{name}",
            get(template_get),
        )
        .route("/templates/reload_templates", get(templates_reload))
        .with_state(state)
}

fn envelope(success: bool, message: impl Into<String>, result: Value) -> Json<Value> {
    Json(json!({
        "success": success,
        "message": message.into(),
        "result": result,
    }))
}

async fn home() -> Json<Value> {
    Json(json!("Successfully reached a Harvest agent instance."))
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

async fn not_implemented() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        envelope(false, "Not implemented.", Value::Null),
    )
}

async fn queue_start(State(state): State<Arc<AppState>>) -> Json<Value> {
    let outcome = state.queue.start();
    envelope(
        outcome.success,
        outcome.message,
        json!(outcome.result.as_str()),
    )
}

async fn queue_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    let outcome = state.queue.stop(true, 60).await;
    envelope(
        outcome.success,
        outcome.message,
        json!(outcome.result.as_str()),
    )
}

async fn queue_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.queue.detailed_status();
    let result = serde_json::to_value(&status).unwrap_or(Value::Null);
    envelope(true, "OK", result)
}

#[derive(Debug, Deserialize)]
struct ShutdownParams {
    finish_running_jobs: Option<bool>,
    timeout: Option<u64>,
}

/// Gracefully stop the queue, then exit the process once the response is on
/// the wire. A failed drain leaves the agent up and reports the failure.
async fn agent_shutdown(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ShutdownParams>,
) -> Json<Value> {
    tracing::warn!("Received shutdown request");

    let outcome = state
        .queue
        .stop(
            params.finish_running_jobs.unwrap_or(true),
            params.timeout.unwrap_or(60),
        )
        .await;

    if outcome.success {
        tracing::info!("Shutdown request completed, exiting");
        tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            std::process::exit(0);
        });
    } else {
        tracing::error!(message = %outcome.message, "Shutdown request failed");
    }

    envelope(
        outcome.success,
        outcome.message,
        json!(outcome.result.as_str()),
    )
}

async fn agent_list_plugins(State(state): State<Arc<AppState>>) -> Json<Value> {
    let names: Vec<&str> = state.plugins.iter().map(|p| p.name()).collect();
    envelope(true, "OK", json!(names))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Json<Value> {
    match state.queue.chain_status(&task_id) {
        Some(record) => Json(Value::Object(record)),
        None => Json(json!({"error": "Task not found."})),
    }
}

async fn task_shutdown(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Json<Value> {
    if state.queue.terminate_chain(&task_id) {
        envelope(true, "Chain termination requested.", json!(task_id))
    } else {
        Json(json!({"error": "Task not found."}))
    }
}

/// Accept a category as registered or with its `template_` prefix elided.
fn resolve_category(registry: &TemplateRegistry, category: &str) -> String {
    if registry.names_in_category(category).is_empty() {
        let prefixed = format!("template_{}", category);
        if !registry.names_in_category(&prefixed).is_empty() {
            return prefixed;
        }
    }
    category.to_string()
}

async fn templates_list_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.registry.read().unwrap_or_else(|e| e.into_inner());
    let keys: Vec<String> = registry.templates().iter().map(|d| d.key()).collect();
    envelope(true, "OK", json!(keys))
}

async fn templates_list(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
) -> Json<Value> {
    let registry = state.registry.read().unwrap_or_else(|e| e.into_inner());
    let category = resolve_category(&registry, &category);
    envelope(true, "OK", json!(registry.names_in_category(&category)))
}

async fn templates_describe_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.registry.read().unwrap_or_else(|e| e.into_inner());
    let records: serde_json::Map<String, Value> = registry
        .templates()
        .iter()
        .map(|d| (d.key(), Value::Object(d.to_record())))
        .collect();
    envelope(true, "OK", Value::Object(records))
}

async fn templates_describe(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
) -> Json<Value> {
    let registry = state.registry.read().unwrap_or_else(|e| e.into_inner());
    let category = resolve_category(&registry, &category);
    let records: serde_json::Map<String, Value> = registry
        .in_category(&category)
        .iter()
        .map(|d| (d.name.clone(), Value::Object(d.to_record())))
        .collect();
    envelope(true, "OK", Value::Object(records))
}

async fn template_get(
    State(state): State<Arc<AppState>>,
    Path((category, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let registry = state.registry.read().unwrap_or_else(|e| e.into_inner());
    let resolved = resolve_category(&registry, &category);

    match registry.find(&resolved, &name) {
        Some(descriptor) => (StatusCode::OK, Json(Value::Object(descriptor.to_record()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Template `{}` of type `{}` not found.", name, category),
            })),
        ),
    }
}

async fn templates_reload(State(state): State<Arc<AppState>>) -> Json<Value> {
    let rebuilt = plugins::populate(&state.plugins);
    let count = rebuilt.len();
    *state.registry.write().unwrap_or_else(|e| e.into_inner()) = rebuilt;

    tracing::info!(entries = count, "Template registry reloaded");
    envelope(true, "Templates reloaded.", json!(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_category_accepts_short_form() {
        let registry = plugins::populate(&plugins::install(&[]));

        assert_eq!(
            resolve_category(&registry, "diagnostics"),
            "template_diagnostics"
        );
        assert_eq!(
            resolve_category(&registry, "template_diagnostics"),
            "template_diagnostics"
        );
        // Unknown categories pass through untouched.
        assert_eq!(resolve_category(&registry, "unknown"), "unknown");
    }

    #[test]
    fn test_envelope_shape() {
        let Json(value) = envelope(true, "OK", json!([1, 2]));
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["message"], json!("OK"));
        assert_eq!(value["result"], json!([1, 2]));
    }
}
