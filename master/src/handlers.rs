use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use common::{
    CancelResponse, LibraryInstallResponse, LibraryRequest, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse, TaskId, TaskRecord,
    TaskRequest, TaskStartedRequest, TaskSubmitResponse, WaitRequest, WaitResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::MasterError;
use crate::scheduler;
use crate::state::{lock, AppState, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // cliente
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/tasks/wait", post(wait_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/libraries", post(install_library))
        .route("/api/v1/workers", get(list_workers))
        // workers
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/started", post(task_started))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<TaskSubmitResponse>, MasterError> {
    let task_id = scheduler::submit(&state, req)?;
    Ok(Json(TaskSubmitResponse { task_id }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<TaskRecord>, MasterError> {
    Ok(Json(scheduler::task_record(&state, TaskId(id))?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<CancelResponse>, MasterError> {
    let task_id = TaskId(id);
    let disposition = scheduler::cancel(&state, task_id)?;
    Ok(Json(CancelResponse {
        task_id,
        disposition,
    }))
}

// Bloquea hasta que haya una tarea terminada o venza el timeout
async fn wait_task(
    State(state): State<AppState>,
    Json(req): Json<WaitRequest>,
) -> Result<Json<WaitResponse>, MasterError> {
    let task = scheduler::wait(&state, &req).await?;
    Ok(Json(WaitResponse { task }))
}

async fn install_library(
    State(state): State<AppState>,
    Json(req): Json<LibraryRequest>,
) -> Result<Json<LibraryInstallResponse>, MasterError> {
    let name = req.name.clone();
    let template_id = scheduler::install_library(&state, req)?;
    Ok(Json(LibraryInstallResponse { template_id, name }))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    info!(
        worker_id = %worker_id,
        hostname = %req.hostname,
        addrport = %req.addrport,
        resources = ?req.resources,
        "worker registrado"
    );

    lock(&state.workers).insert(
        worker_id.clone(),
        WorkerMeta {
            hostname: req.hostname,
            addrport: req.addrport,
            resources: req.resources,
            features: req.features.into_iter().collect(),
            cached_files: req.cached_files.into_iter().collect(),
            last_heartbeat: SystemTime::now(),
            dead: false,

            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,

            last_cpu_percent: None,
            last_mem_bytes: None,
        },
    );

    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker; de vuelta van las cancelaciones pendientes
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, MasterError> {
    {
        let mut workers = lock(&state.workers);
        let meta = match workers.get_mut(&req.worker_id) {
            Some(meta) if !meta.dead => meta,
            _ => return Err(MasterError::UnknownWorker(req.worker_id)),
        };
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = req.cpu_percent;
        meta.last_mem_bytes = req.mem_bytes;
        meta.cached_files.extend(req.cached_files);
    }

    let cancelled = scheduler::take_cancelled(&state, &req.worker_id);
    if !cancelled.is_empty() {
        debug!(worker_id = %req.worker_id, ?cancelled, "avisando cancelaciones");
    }
    Ok(Json(WorkerHeartbeatResponse {
        ok: true,
        cancelled,
    }))
}

// Asigna el siguiente intento que le sirva al worker (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, MasterError> {
    let task = scheduler::next_for_worker(&state, &req.worker_id)?;
    if task.is_none() {
        debug!(worker_id = %req.worker_id, "worker pidió tarea pero no hay nada que le sirva");
    }
    Ok(Json(TaskAssignmentResponse { task }))
}

async fn task_started(
    State(state): State<AppState>,
    Json(req): Json<TaskStartedRequest>,
) -> Result<Json<TaskCompleteResponse>, MasterError> {
    scheduler::mark_started(&state, &req)?;
    Ok(Json(TaskCompleteResponse {
        ok: true,
        disposition: None,
    }))
}

// Worker reporta que terminó un intento
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, MasterError> {
    let disposition = scheduler::complete(&state, &req)?;
    Ok(Json(TaskCompleteResponse {
        ok: true,
        disposition: Some(disposition),
    }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar tareas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for inf in lock(&state.in_flight).values() {
        *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
    }

    let instances: HashMap<WorkerId, Vec<common::TaskRef>> = lock(&state.instances).clone();
    let mut libraries_by_worker: HashMap<WorkerId, Vec<String>> = HashMap::new();
    for (wid, list) in instances {
        let names = list
            .iter()
            .filter_map(|i| i.lock().provides_library().map(str::to_string))
            .collect();
        libraries_by_worker.insert(wid, names);
    }

    let workers = lock(&state.workers);
    let mut out = Vec::new();

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let finished = meta.tasks_succeeded + meta.tasks_failed;
        let avg_ms = if finished > 0 {
            Some(meta.total_task_time_ms as f64 / finished as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            addrport: meta.addrport.clone(),
            dead: meta.dead,
            resources: meta.resources.clone(),
            features: meta.features.iter().cloned().collect(),
            last_heartbeat_secs_ago: age_secs,
            active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
            libraries: libraries_by_worker.get(wid).cloned().unwrap_or_default(),
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: avg_ms,
            last_cpu_percent: meta.last_cpu_percent,
            last_mem_bytes: meta.last_mem_bytes,
        });
    }

    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Json(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn parse<T: DeserializeOwned>(v: Value) -> T {
        serde_json::from_value(v).unwrap()
    }

    async fn register(app: &Router, cores: f64) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/api/v1/workers/register",
            Some(json!({
                "hostname": "nodo1",
                "addrport": "10.0.0.1:9123",
                "resources": {"cores": cores, "memory": 4096}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        parse::<WorkerRegisterResponse>(body).worker_id
    }

    #[tokio::test]
    async fn health_ok() {
        let app = build_router(AppState::new(MasterConfig::default()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn flujo_completo_por_http() {
        let app = build_router(AppState::new(MasterConfig::default()));
        let worker_id = register(&app, 2.0).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/tasks",
            Some(json!({"command_line": "echo hola", "tag": "demo"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let task_id = parse::<TaskSubmitResponse>(body).task_id;

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/tasks/next",
            Some(json!({ "worker_id": worker_id })),
        )
        .await;
        let dispatch = parse::<TaskAssignmentResponse>(body).task.expect("tarea asignada");
        assert_eq!(dispatch.task_id, task_id);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/tasks/started",
            Some(json!({
                "worker_id": worker_id,
                "task_id": task_id,
                "started_at": "2026-01-01T00:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/tasks/complete",
            Some(json!({
                "worker_id": worker_id,
                "task_id": task_id,
                "started": true,
                "exit_code": 0,
                "output": "hola\n"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp = parse::<TaskCompleteResponse>(body);
        assert_eq!(
            resp.disposition,
            Some(common::Disposition::Final(common::TaskResult::Success))
        );

        let (_, body) = call(&app, "GET", &format!("/api/v1/tasks/{}", task_id), None).await;
        assert_eq!(body["state"], "RETRIEVED");

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/tasks/wait",
            Some(json!({"tag": "demo", "timeout_secs": 1})),
        )
        .await;
        let record = parse::<WaitResponse>(body).task.expect("tarea entregada");
        assert_eq!(record.output.as_deref(), Some("hola\n"));

        let (status, _) = call(&app, "GET", &format!("/api/v1/tasks/{}", task_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, "GET", "/api/v1/workers", None).await;
        let workers = parse::<Vec<WorkerMetrics>>(body);
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn mounts_duplicados_son_422() {
        let app = build_router(AppState::new(MasterConfig::default()));
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/tasks",
            Some(json!({
                "command_line": "cat a",
                "inputs": [
                    {"file": {"kind": "url", "url": "http://x/a"}, "remote_name": "a"},
                    {"file": {"kind": "url", "url": "http://x/b"}, "remote_name": "a"}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn libreria_duplicada_es_conflict() {
        let app = build_router(AppState::new(MasterConfig::default()));
        let lib = json!({"name": "L", "command_line": "python lib.py"});
        let (status, _) = call(&app, "POST", "/api/v1/libraries", Some(lib.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "POST", "/api/v1/libraries", Some(lib)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn heartbeat_devuelve_cancelaciones() {
        let app = build_router(AppState::new(MasterConfig::default()));
        let worker_id = register(&app, 1.0).await;

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/tasks",
            Some(json!({"command_line": "sleep 100"})),
        )
        .await;
        let task_id = parse::<TaskSubmitResponse>(body).task_id;
        call(
            &app,
            "POST",
            "/api/v1/tasks/next",
            Some(json!({ "worker_id": worker_id })),
        )
        .await;

        let (status, body) = call(&app, "POST", &format!("/api/v1/tasks/{}/cancel", task_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"]["result"], "CANCELLED");

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/workers/heartbeat",
            Some(json!({ "worker_id": worker_id })),
        )
        .await;
        let hb = parse::<WorkerHeartbeatResponse>(body);
        assert_eq!(hb.cancelled, vec![task_id]);
    }

    #[tokio::test]
    async fn worker_desconocido_es_404() {
        let app = build_router(AppState::new(MasterConfig::default()));
        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/tasks/next",
            Some(json!({"worker_id": "fantasma"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
