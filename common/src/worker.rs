use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::library::LibrarySpec;
use crate::mount::Mount;
use crate::policy::Disposition;
use crate::resources::ResourceSummary;
use crate::task::{TaskId, TaskType};

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    /// host:puerto con el que el worker se identifica
    pub addrport: String,
    /// Capacidad total del worker (cores, memoria MB, disco MB)
    pub resources: ResourceSummary,
    #[serde(default)]
    pub features: Vec<String>,
    /// `cache_name` de los archivos que el worker ya tiene
    #[serde(default)]
    pub cached_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
    /// Archivos que entraron al cache desde el último heartbeat
    #[serde(default)]
    pub cached_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
    /// Tareas en vuelo en este worker que el manager canceló
    #[serde(default)]
    pub cancelled: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentResponse {
    pub task: Option<TaskDispatch>,
}

/// Un intento listo para ejecutar en el worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub command_line: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub input_mounts: Vec<Mount>,
    #[serde(default)]
    pub output_mounts: Vec<Mount>,
    pub allocated: ResourceSummary,
    /// Funciones: librería que debe estar corriendo en el worker
    #[serde(default)]
    pub needs_library: Option<String>,
    /// Funciones: instancia con la que quedó emparejada
    #[serde(default)]
    pub library_task: Option<TaskId>,
    /// Instancias: qué librería levantar
    #[serde(default)]
    pub library: Option<LibrarySpec>,
    #[serde(default)]
    pub function_slots: Option<u32>,
}

/// El proceso arrancó en el worker. Desde acá un fallo cuenta como intento
/// y no como `Forsaken`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartedRequest {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    /// false si el worker no llegó a lanzar el proceso
    pub started: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<i32>,
    /// Se cortó por superar su wall_time asignado
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub missing_inputs: Vec<String>,
    #[serde(default)]
    pub missing_outputs: Vec<String>,
    #[serde(default)]
    pub measured: Option<ResourceSummary>,
    #[serde(default)]
    pub sandbox_mb: Option<f64>,
    #[serde(default)]
    pub execution_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    pub ok: bool,
    #[serde(default)]
    pub disposition: Option<Disposition>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub addrport: String,
    pub dead: bool,
    pub resources: ResourceSummary,
    pub features: Vec<String>,
    pub last_heartbeat_secs_ago: u64,
    pub active_tasks: u32,
    /// Instancias de librería vivas en el worker (nombre de la librería)
    pub libraries: Vec<String>,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub avg_task_ms: Option<f64>,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}
