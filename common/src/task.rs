use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

use crate::error::TaskError;
use crate::library::{LibraryRole, LibrarySpec, ExecMode};
use crate::metrics::TaskMetrics;
use crate::mount::{find_duplicate, FileObject, Mount, MountFlags, MountSide};
use crate::resources::ResourceSummary;
use crate::results::TaskResult;
use crate::state::TaskState;

/// Id entero de una tarea. Se asigna una vez y no cambia.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contador monótono de ids. Lo posee el manager, no es global al proceso.
#[derive(Debug)]
pub struct TaskIdAllocator {
    next: AtomicU64,
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Tarea del usuario, se le devuelve al terminar
    Standard,
    /// Interna: regenera un archivo intermedio perdido
    Recovery,
    /// Plano de librería, nunca se ejecuta
    LibraryTemplate,
    /// Copia de la librería corriendo en un worker
    LibraryInstance,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Standard => "STANDARD",
            TaskType::Recovery => "RECOVERY",
            TaskType::LibraryTemplate => "LIBRARY_TEMPLATE",
            TaskType::LibraryInstance => "LIBRARY_INSTANCE",
        }
    }

    /// Sólo las tareas estándar salen por la interfaz de espera.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, TaskType::Standard)
    }
}

/// Estrategia para elegir worker. El manager sólo la transporta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerSelection {
    #[default]
    Unset,
    Files,
    Time,
    Rand,
    Worst,
    Disk,
}

/// Registro de una unidad de trabajo y de su resultado.
///
/// Campos por tipo:
/// - atributos de envío: sólo modificables en `Initial`;
/// - `library`: `Needs` sólo en funciones (`Standard`), `Template`/`Instance`
///   sólo en los tipos de librería, `None` en el resto;
/// - estado de trabajo y resultado: los cambia el manager a través de
///   `transition`, `set_result`, `clean` y `reset`.
///
/// No es `Clone`: duplicar una tarea es `copy`, con id nuevo.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) task_type: TaskType,

    /* --------- atributos de envío --------- */
    pub(crate) command_line: String,
    pub(crate) tag: Option<String>,
    pub(crate) category: String,
    pub(crate) priority: f64,
    pub(crate) max_retries: i32,
    pub(crate) max_forsaken: i32,
    /// segundos
    pub(crate) min_running_time: u64,
    pub(crate) worker_selection: WorkerSelection,
    pub(crate) resources_requested: ResourceSummary,
    pub(crate) input_mounts: Vec<Mount>,
    pub(crate) output_mounts: Vec<Mount>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) features: BTreeSet<String>,
    pub(crate) library: LibraryRole,

    /* --------- estado de trabajo --------- */
    pub(crate) state: TaskState,
    pub(crate) worker: Option<String>,
    pub(crate) try_count: u32,
    pub(crate) forsaken_count: u32,
    pub(crate) exhausted_attempts: u32,
    pub(crate) forsaken_attempts: u32,
    pub(crate) workers_slow: u32,
    /// El intento actual ya sumó en try_count / forsaken_count
    pub(crate) attempt_counted: bool,
    pub(crate) has_fixed_locations: bool,
    pub(crate) resources_allocated: Option<ResourceSummary>,
    pub(crate) resources_measured: Option<ResourceSummary>,
    /// MB, máximo observado en el intento actual
    pub(crate) sandbox_measured: Option<f64>,
    pub(crate) metrics: TaskMetrics,

    /* --------- resultado --------- */
    pub(crate) result: TaskResult,
    pub(crate) exit_code: Option<i32>,
    pub(crate) output: Option<String>,
    pub(crate) output_received: bool,
    pub(crate) addrport: Option<String>,
    pub(crate) hostname: Option<String>,
}

pub const DEFAULT_CATEGORY: &str = "default";

impl Task {
    /// Tarea estándar con valores por defecto.
    pub fn new(id: TaskId, command_line: impl Into<String>) -> Self {
        Self::with_type(id, TaskType::Standard, command_line.into(), LibraryRole::None)
    }

    /// Tarea interna de recuperación; nunca se le devuelve al usuario.
    pub fn recovery(id: TaskId, command_line: impl Into<String>) -> Self {
        Self::with_type(id, TaskType::Recovery, command_line.into(), LibraryRole::None)
    }

    pub fn library_template(
        id: TaskId,
        command_line: impl Into<String>,
        name: impl Into<String>,
        function_slots_requested: i32,
        exec_mode: ExecMode,
    ) -> Self {
        let spec = LibrarySpec {
            name: name.into(),
            function_slots_requested,
            exec_mode,
        };
        Self::with_type(
            id,
            TaskType::LibraryTemplate,
            command_line.into(),
            LibraryRole::Template {
                spec,
                failed_count: 0,
            },
        )
    }

    fn with_type(id: TaskId, task_type: TaskType, command_line: String, library: LibraryRole) -> Self {
        Self {
            id,
            task_type,
            command_line,
            tag: None,
            category: DEFAULT_CATEGORY.to_string(),
            priority: 0.0,
            max_retries: 0,
            max_forsaken: 0,
            min_running_time: 0,
            worker_selection: WorkerSelection::Unset,
            resources_requested: ResourceSummary::default(),
            input_mounts: Vec::new(),
            output_mounts: Vec::new(),
            env: Vec::new(),
            features: BTreeSet::new(),
            library,

            state: TaskState::Initial,
            worker: None,
            try_count: 0,
            forsaken_count: 0,
            exhausted_attempts: 0,
            forsaken_attempts: 0,
            workers_slow: 0,
            attempt_counted: false,
            has_fixed_locations: false,
            resources_allocated: None,
            resources_measured: None,
            sandbox_measured: None,
            metrics: TaskMetrics::default(),

            result: TaskResult::Unknown,
            exit_code: None,
            output: None,
            output_received: false,
            addrport: None,
            hostname: None,
        }
    }

    /// Tarea nueva con los mismos atributos de envío y mounts, id nuevo y
    /// estado de trabajo como recién creada.
    pub fn copy(&self, new_id: TaskId) -> Task {
        self.copy_as(new_id, self.task_type)
    }

    pub(crate) fn copy_as(&self, new_id: TaskId, task_type: TaskType) -> Task {
        let mut t = Self::with_type(
            new_id,
            task_type,
            self.command_line.clone(),
            self.library.fresh_copy(),
        );
        t.tag = self.tag.clone();
        t.category = self.category.clone();
        t.priority = self.priority;
        t.max_retries = self.max_retries;
        t.max_forsaken = self.max_forsaken;
        t.min_running_time = self.min_running_time;
        t.worker_selection = self.worker_selection;
        t.resources_requested = self.resources_requested.clone();
        t.input_mounts = self.input_mounts.clone();
        t.output_mounts = self.output_mounts.clone();
        t.env = self.env.clone();
        t.features = self.features.clone();
        t
    }

    /* ---------------- consultas ---------------- */

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn state_str(&self) -> &'static str {
        self.state.as_str()
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn max_forsaken(&self) -> i32 {
        self.max_forsaken
    }

    pub fn min_running_time(&self) -> u64 {
        self.min_running_time
    }

    pub fn worker_selection(&self) -> WorkerSelection {
        self.worker_selection
    }

    pub fn resources_requested(&self) -> &ResourceSummary {
        &self.resources_requested
    }

    pub fn resources_allocated(&self) -> Option<&ResourceSummary> {
        self.resources_allocated.as_ref()
    }

    pub fn resources_measured(&self) -> Option<&ResourceSummary> {
        self.resources_measured.as_ref()
    }

    pub fn sandbox_measured(&self) -> Option<f64> {
        self.sandbox_measured
    }

    pub fn input_mounts(&self) -> &[Mount] {
        &self.input_mounts
    }

    pub fn output_mounts(&self) -> &[Mount] {
        &self.output_mounts
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn library(&self) -> &LibraryRole {
        &self.library
    }

    pub fn needs_library(&self) -> Option<&str> {
        self.library.needs_library()
    }

    pub fn provides_library(&self) -> Option<&str> {
        self.library.provides_library()
    }

    pub fn is_function(&self) -> bool {
        self.needs_library().is_some()
    }

    /// Instancia con la que está emparejada una tarea de función.
    pub fn library_task(&self) -> Option<TaskId> {
        match &self.library {
            LibraryRole::Needs {
                lease: Some(lease), ..
            } => Some(lease.instance()),
            _ => None,
        }
    }

    /// Template del que salió una instancia.
    pub fn library_template_id(&self) -> Option<TaskId> {
        match &self.library {
            LibraryRole::Instance { template, .. } => Some(*template),
            _ => None,
        }
    }

    /// Worker al que quedó atada una instancia.
    pub fn bound_worker(&self) -> Option<&str> {
        match &self.library {
            LibraryRole::Instance { worker, .. } => Some(worker),
            _ => None,
        }
    }

    pub fn function_slots_total(&self) -> Option<u32> {
        match &self.library {
            LibraryRole::Instance { slots, .. } => Some(slots.total()),
            _ => None,
        }
    }

    pub fn function_slots_inuse(&self) -> Option<u32> {
        match &self.library {
            LibraryRole::Instance { slots, .. } => Some(slots.inuse()),
            _ => None,
        }
    }

    pub fn library_failed_count(&self) -> Option<u32> {
        match &self.library {
            LibraryRole::Template { failed_count, .. } => Some(*failed_count),
            _ => None,
        }
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn forsaken_count(&self) -> u32 {
        self.forsaken_count
    }

    pub fn exhausted_attempts(&self) -> u32 {
        self.exhausted_attempts
    }

    pub fn forsaken_attempts(&self) -> u32 {
        self.forsaken_attempts
    }

    pub fn workers_slow(&self) -> u32 {
        self.workers_slow
    }

    pub fn has_fixed_locations(&self) -> bool {
        self.has_fixed_locations
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    pub fn result(&self) -> TaskResult {
        self.result
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn output_received(&self) -> bool {
        self.output_received
    }

    pub fn addrport(&self) -> Option<&str> {
        self.addrport.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Suma de los tamaños de entrada; `None` si alguno no se conoce.
    pub fn input_files_size(&self) -> Option<u64> {
        self.input_mounts.iter().map(|m| m.file.size()).sum()
    }

    /// Salidas marcadas `watch` (ruta local), para truncarlas antes de despachar.
    pub fn watched_outputs(&self) -> Vec<&str> {
        self.output_mounts
            .iter()
            .filter(|m| m.flags.watch)
            .filter_map(|m| match &m.file {
                FileObject::LocalFile { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Nombres de las cantidades medidas que superaron lo asignado.
    pub fn exhausted_resources(&self) -> Vec<String> {
        match (&self.resources_allocated, &self.resources_measured) {
            (Some(alloc), Some(measured)) => alloc.exceeded_by(measured),
            _ => Vec::new(),
        }
    }

    pub(crate) fn invalid_state(&self, op: &'static str) -> TaskError {
        TaskError::InvalidState {
            task_id: self.id,
            op,
            state: self.state,
        }
    }

    fn ensure_initial(&self, op: &'static str) -> Result<(), TaskError> {
        if self.state == TaskState::Initial {
            Ok(())
        } else {
            Err(self.invalid_state(op))
        }
    }

    /* ---------------- atributos de envío ---------------- */

    pub fn set_command_line(&mut self, command_line: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_initial("set_command_line")?;
        self.command_line = command_line.into();
        Ok(())
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_initial("set_tag")?;
        self.tag = Some(tag.into());
        Ok(())
    }

    pub fn set_category(&mut self, category: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_initial("set_category")?;
        let category = category.into();
        self.category = if category.is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            category
        };
        Ok(())
    }

    pub fn set_priority(&mut self, priority: f64) -> Result<(), TaskError> {
        self.ensure_initial("set_priority")?;
        self.priority = priority;
        Ok(())
    }

    /// < 1: reintentos ilimitados.
    pub fn set_max_retries(&mut self, max_retries: i32) -> Result<(), TaskError> {
        self.ensure_initial("set_max_retries")?;
        self.max_retries = max_retries;
        Ok(())
    }

    /// < 1: ilimitado.
    pub fn set_max_forsaken(&mut self, max_forsaken: i32) -> Result<(), TaskError> {
        self.ensure_initial("set_max_forsaken")?;
        self.max_forsaken = max_forsaken;
        Ok(())
    }

    pub fn set_min_running_time(&mut self, seconds: u64) -> Result<(), TaskError> {
        self.ensure_initial("set_min_running_time")?;
        self.min_running_time = seconds;
        Ok(())
    }

    pub fn set_worker_selection(&mut self, selection: WorkerSelection) -> Result<(), TaskError> {
        self.ensure_initial("set_worker_selection")?;
        self.worker_selection = selection;
        Ok(())
    }

    pub fn set_resources_requested(&mut self, resources: ResourceSummary) -> Result<(), TaskError> {
        self.ensure_initial("set_resources_requested")?;
        self.resources_requested = resources;
        Ok(())
    }

    /// Define o reemplaza una variable de entorno.
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_initial("set_env")?;
        let name = name.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.env.push((name, value)),
        }
        Ok(())
    }

    pub fn add_feature(&mut self, feature: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_initial("add_feature")?;
        self.features.insert(feature.into());
        Ok(())
    }

    /// Convierte una tarea estándar en tarea de función de `name`.
    pub fn set_library_required(&mut self, name: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_initial("set_library_required")?;
        if self.task_type != TaskType::Standard {
            return Err(TaskError::LibraryMismatch(format!(
                "sólo una tarea estándar puede necesitar una librería (tarea {} es {})",
                self.id,
                self.task_type.as_str()
            )));
        }
        let name = name.into();
        if name.is_empty() {
            return Err(TaskError::LibraryMismatch(
                "nombre de librería vacío".to_string(),
            ));
        }
        self.library = LibraryRole::Needs { name, lease: None };
        Ok(())
    }

    /* ---------------- mounts ---------------- */

    fn add_mount(&mut self, mount: Mount) -> Result<(), TaskError> {
        self.ensure_initial("add_mount")?;
        let list = match mount.side {
            MountSide::Input => &mut self.input_mounts,
            MountSide::Output => &mut self.output_mounts,
        };
        if list.iter().any(|m| m.remote_name == mount.remote_name) {
            return Err(TaskError::DuplicateMount {
                side: mount.side,
                remote_name: mount.remote_name,
            });
        }
        if mount.flags.fixed_location {
            self.has_fixed_locations = true;
        }
        list.push(mount);
        Ok(())
    }

    pub fn add_input(&mut self, file: FileObject, remote_name: &str, flags: MountFlags) -> Result<(), TaskError> {
        self.add_mount(Mount::new(MountSide::Input, file, remote_name, flags)?)
    }

    pub fn add_input_file(&mut self, local_name: &str, remote_name: &str, flags: MountFlags) -> Result<(), TaskError> {
        self.add_input(FileObject::local(local_name), remote_name, flags)
    }

    pub fn add_input_url(&mut self, url: &str, remote_name: &str, flags: MountFlags) -> Result<(), TaskError> {
        self.add_input(
            FileObject::Url {
                url: url.to_string(),
            },
            remote_name,
            flags,
        )
    }

    pub fn add_input_buffer(&mut self, data: &[u8], remote_name: &str, flags: MountFlags) -> Result<(), TaskError> {
        self.add_input(
            FileObject::Buffer {
                data: data.to_vec(),
            },
            remote_name,
            flags,
        )
    }

    /// La entrada es el archivo `output_name` que produce `mini_task` en el worker.
    pub fn add_input_mini_task(
        &mut self,
        mini_task: &Task,
        output_name: &str,
        remote_name: &str,
        flags: MountFlags,
    ) -> Result<(), TaskError> {
        if !mini_task.output_mounts.iter().any(|m| m.remote_name == output_name) {
            return Err(TaskError::InvalidMount {
                remote_name: remote_name.to_string(),
                reason: format!(
                    "la mini-tarea {} no declara la salida '{}'",
                    mini_task.id, output_name
                ),
            });
        }
        self.add_input(
            FileObject::MiniTask {
                command_line: mini_task.command_line.clone(),
                output_name: output_name.to_string(),
            },
            remote_name,
            flags,
        )
    }

    pub fn add_output_file(&mut self, local_name: &str, remote_name: &str, flags: MountFlags) -> Result<(), TaskError> {
        self.add_mount(Mount::new(
            MountSide::Output,
            FileObject::local(local_name),
            remote_name,
            flags,
        )?)
    }

    /// Valida los mounts antes de encolar: sin rutas remotas repetidas dentro
    /// de las entradas ni dentro de las salidas (entre ambos lados sí se puede).
    /// Marca la tarea si algún mount tiene ubicación fija.
    pub fn check_consistency(&mut self) -> Result<(), TaskError> {
        for (side, mounts) in [
            (MountSide::Input, &self.input_mounts),
            (MountSide::Output, &self.output_mounts),
        ] {
            if let Some(dup) = find_duplicate(mounts) {
                return Err(TaskError::DuplicateMount {
                    side,
                    remote_name: dup.to_string(),
                });
            }
        }

        self.has_fixed_locations = self
            .input_mounts
            .iter()
            .chain(self.output_mounts.iter())
            .any(|m| m.flags.fixed_location);
        Ok(())
    }

    /// Falla rápido si el worker no tiene alguno de los archivos de ubicación fija.
    /// `worker_files` son los `cache_name` que el worker ya posee.
    pub fn check_fixed_locations(&self, worker_files: &HashSet<String>) -> Result<(), TaskError> {
        if !self.has_fixed_locations {
            return Ok(());
        }
        match self
            .input_mounts
            .iter()
            .filter(|m| m.flags.fixed_location)
            .find(|m| !worker_files.contains(&m.file.cache_name()))
        {
            Some(m) => Err(TaskError::UnsatisfiableLocation {
                remote_name: m.remote_name.clone(),
            }),
            None => Ok(()),
        }
    }

    /* ---------------- ciclo de vida ---------------- */

    /// Avanza al estado siguiente. Cualquier otro destino es `InvalidTransition`
    /// y el estado no cambia.
    pub fn transition(&mut self, to: TaskState) -> Result<(), TaskError> {
        if !self.state.can_advance_to(to) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id,
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        match to {
            TaskState::Ready => {
                self.check_consistency()?;
                self.metrics.time_when_submitted = Some(now);
            }
            TaskState::Running => {
                if self.task_type == TaskType::LibraryTemplate {
                    return Err(self.invalid_state("dispatch_template"));
                }
                if self.worker.is_none() {
                    return Err(self.invalid_state("dispatch_without_worker"));
                }
                if self.is_function() && self.library_task().is_none() {
                    return Err(TaskError::LibraryMismatch(format!(
                        "la función {} no está emparejada con ninguna instancia de '{}'",
                        self.id,
                        self.needs_library().unwrap_or_default()
                    )));
                }
            }
            TaskState::Retrieved => {
                self.metrics.time_when_done = Some(now);
            }
            TaskState::Initial | TaskState::WaitingRetrieval | TaskState::Done => {}
        }

        debug!(task_id = %self.id, from = %self.state, to = %to, "transición");
        self.state = to;
        Ok(())
    }

    /* ---------------- mutadores por intento ---------------- */

    pub fn assign_worker(
        &mut self,
        worker: impl Into<String>,
        addrport: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Result<(), TaskError> {
        if self.state != TaskState::Ready {
            return Err(self.invalid_state("assign_worker"));
        }
        let worker = worker.into();
        if let Some(bound) = self.bound_worker() {
            if bound != worker {
                return Err(TaskError::LibraryMismatch(format!(
                    "la instancia {} está atada al worker {}, no a {}",
                    self.id, bound, worker
                )));
            }
        }
        self.worker = Some(worker);
        self.addrport = Some(addrport.into());
        self.hostname = Some(hostname.into());
        Ok(())
    }

    /// Lo que el worker reservó para este intento. Reemplaza, no suma.
    pub fn set_allocated(&mut self, resources: ResourceSummary) -> Result<(), TaskError> {
        if !matches!(self.state, TaskState::Ready | TaskState::Running) {
            return Err(self.invalid_state("set_allocated"));
        }
        self.resources_allocated = Some(resources);
        Ok(())
    }

    /// Medición del monitor para el intento actual. No cambia el estado.
    pub fn set_resources(&mut self, measured: ResourceSummary) {
        self.resources_measured = Some(measured);
    }

    /// Máximo de disco (MB) observado en el sandbox durante el intento.
    pub fn set_sandbox_measured(&mut self, megabytes: f64) {
        self.sandbox_measured = Some(match self.sandbox_measured {
            Some(prev) if prev >= megabytes => prev,
            _ => megabytes,
        });
    }

    pub fn record_commit(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), TaskError> {
        if !matches!(self.state, TaskState::Ready | TaskState::Running) {
            return Err(self.invalid_state("record_commit"));
        }
        self.metrics.time_when_commit_start = Some(start);
        self.metrics.time_when_commit_end = Some(end);
        Ok(())
    }

    pub fn record_execution(
        &mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), TaskError> {
        if !self.state.is_attempt_active() {
            return Err(self.invalid_state("record_execution"));
        }
        if start.is_some() {
            self.metrics.time_workers_execute_last_start = start;
        }
        if end.is_some() {
            self.metrics.time_workers_execute_last_end = end;
        }
        Ok(())
    }

    pub fn record_retrieval(&mut self, when: DateTime<Utc>) -> Result<(), TaskError> {
        if self.state != TaskState::WaitingRetrieval {
            return Err(self.invalid_state("record_retrieval"));
        }
        self.metrics.time_when_retrieval = Some(when);
        Ok(())
    }

    pub fn record_transfer(&mut self, sent: u64, received: u64) {
        self.metrics.bytes_sent += sent;
        self.metrics.bytes_received += received;
        self.metrics.bytes_transferred += sent + received;
    }

    pub fn set_exit_code(&mut self, exit_code: i32) -> Result<(), TaskError> {
        if !self.state.is_attempt_active() {
            return Err(self.invalid_state("set_exit_code"));
        }
        self.exit_code = Some(exit_code);
        Ok(())
    }

    pub fn set_output(&mut self, output: impl Into<String>) -> Result<(), TaskError> {
        if !self.state.is_attempt_active() {
            return Err(self.invalid_state("set_output"));
        }
        self.output = Some(output.into());
        self.output_received = true;
        Ok(())
    }

    /* ---------------- reset / clean ---------------- */

    /// Todo el estado de trabajo y resultado a valores de recién creada.
    fn clear_working_state(&mut self) {
        self.state = TaskState::Initial;
        self.worker = None;
        self.try_count = 0;
        self.forsaken_count = 0;
        self.exhausted_attempts = 0;
        self.forsaken_attempts = 0;
        self.workers_slow = 0;
        self.attempt_counted = false;
        self.resources_allocated = None;
        self.resources_measured = None;
        self.sandbox_measured = None;
        self.metrics = TaskMetrics::default();
        self.library.clear_working_state();

        self.result = TaskResult::Unknown;
        self.exit_code = None;
        self.output = None;
        self.output_received = false;
        self.addrport = None;
        self.hostname = None;
    }

    /// Reset duro: una tarea terminada vuelve a `Initial` con su mismo id,
    /// sin resultados, métricas ni contadores, para enviarla de nuevo.
    pub fn reset(&mut self) -> Result<(), TaskError> {
        if !self.state.is_terminal() {
            return Err(self.invalid_state("reset"));
        }
        self.clear_working_state();
        debug!(task_id = %self.id, "reset");
        Ok(())
    }

    /// Reset suave entre intentos de un mismo envío: suelta worker, salida,
    /// recursos del intento y la librería emparejada; conserva contadores y
    /// acumulados. Deja la tarea en `Ready`.
    pub fn clean(&mut self) -> Result<(), TaskError> {
        if !matches!(
            self.state,
            TaskState::Ready | TaskState::Running | TaskState::WaitingRetrieval
        ) {
            return Err(self.invalid_state("clean"));
        }

        self.worker = None;
        self.addrport = None;
        self.hostname = None;
        self.resources_allocated = None;
        self.resources_measured = None;
        self.sandbox_measured = None;
        self.metrics.clear_attempt();
        self.library.take_lease();
        self.attempt_counted = false;

        self.result = TaskResult::Unknown;
        self.exit_code = None;
        self.output = None;
        self.output_received = false;

        debug!(task_id = %self.id, from = %self.state, "clean -> READY");
        self.state = TaskState::Ready;
        Ok(())
    }

    /// Cancelación. Con un intento vivo sigue el camino normal de `set_result`;
    /// una tarea todavía en cola pasa directo a `Retrieved` como `Cancelled`.
    pub fn cancel(&mut self) -> Result<crate::policy::Disposition, TaskError> {
        match self.state {
            TaskState::Running | TaskState::WaitingRetrieval => {
                self.set_result(TaskResult::Cancelled)
            }
            TaskState::Ready => {
                self.library.take_lease();
                self.worker = None;
                self.result = TaskResult::Cancelled;
                self.metrics.time_when_done = Some(Utc::now());
                debug!(task_id = %self.id, "cancelada en cola -> RETRIEVED");
                self.state = TaskState::Retrieved;
                Ok(crate::policy::Disposition::Final(TaskResult::Cancelled))
            }
            _ => Err(self.invalid_state("cancel")),
        }
    }
}
