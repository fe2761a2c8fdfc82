// master/src/state.rs

use common::{ResourceSummary, TaskId, TaskIdAllocator, TaskRef, WorkerId};
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use tokio::sync::Notify;

use crate::categories::CategoryStats;
use crate::config::MasterConfig;

/// Nunca se toma un lock de mapa con una tarea bloqueada. Entre tareas el
/// orden es template, instancia, función.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub ids: Arc<TaskIdAllocator>,

    // índice de todas las tareas vivas en el manager (una referencia cada una)
    pub tasks: Arc<Mutex<HashMap<TaskId, TaskRef>>>,
    // tareas en READY esperando worker
    pub ready: Arc<Mutex<VecDeque<TaskRef>>>,
    // tareas despachadas (RUNNING) por id
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    // tareas estándar en RETRIEVED, listas para entregar con wait
    pub retrieved: Arc<Mutex<VecDeque<TaskRef>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // templates de librería por nombre
    pub templates: Arc<Mutex<HashMap<String, TaskRef>>>,
    // instancias de librería vivas por worker
    pub instances: Arc<Mutex<HashMap<WorkerId, Vec<TaskRef>>>>,
    // cancelaciones pendientes de avisar al worker en el próximo heartbeat
    pub cancelled: Arc<Mutex<HashMap<WorkerId, Vec<TaskId>>>>,
    pub categories: Arc<Mutex<CategoryStats>>,

    pub retrieved_notify: Arc<Notify>,
}

impl AppState {
    pub fn new(config: MasterConfig) -> Self {
        let categories = CategoryStats::new(config.category_resources.clone());
        Self {
            config: Arc::new(config),
            ids: Arc::new(TaskIdAllocator::new()),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            retrieved: Arc::new(Mutex::new(VecDeque::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            templates: Arc::new(Mutex::new(HashMap::new())),
            instances: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(HashMap::new())),
            categories: Arc::new(Mutex::new(categories)),
            retrieved_notify: Arc::new(Notify::new()),
        }
    }
}

/// Lock que sobrevive a un panic de otro handler.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub addrport: String,
    pub resources: ResourceSummary,
    pub features: BTreeSet<String>,
    pub cached_files: HashSet<String>,
    pub last_heartbeat: SystemTime,
    pub dead: bool,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn cores(&self) -> u32 {
        self.resources.cores.map(|c| c.max(0.0) as u32).unwrap_or(1)
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: TaskRef,
    pub worker_id: WorkerId,
    pub dispatched_at: SystemTime,
    /// El worker avisó que el proceso arrancó
    pub started: bool,
}
