use serde::{Deserialize, Serialize};

use crate::library::LibrarySpec;
use crate::metrics::TaskMetrics;
use crate::mount::{Mount, MountFlags};
use crate::resources::ResourceSummary;
use crate::results::TaskResult;
use crate::state::TaskState;
use crate::task::{Task, TaskId, TaskType, WorkerSelection};
use crate::worker::TaskDispatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRecord {
    pub remote_name: String,
    pub kind: String,
    pub source: String,
    pub flags: MountFlags,
}

impl From<&Mount> for MountRecord {
    fn from(m: &Mount) -> Self {
        Self {
            remote_name: m.remote_name.clone(),
            kind: m.file.kind().to_string(),
            source: m.file.source(),
            flags: m.flags,
        }
    }
}

/// Foto de una tarea para exportar (API de estado, logs de transacciones).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub command_line: String,
    pub tag: Option<String>,
    pub category: String,
    pub priority: f64,
    pub max_retries: i32,
    pub max_forsaken: i32,
    pub min_running_time: u64,
    pub worker_selection: WorkerSelection,

    pub needs_library: Option<String>,
    pub provides_library: Option<String>,
    pub library_task: Option<TaskId>,
    pub function_slots_total: Option<u32>,
    pub function_slots_inuse: Option<u32>,

    pub inputs: Vec<MountRecord>,
    pub outputs: Vec<MountRecord>,

    pub worker: Option<String>,
    pub addrport: Option<String>,
    pub hostname: Option<String>,

    pub try_count: u32,
    pub forsaken_count: u32,
    pub exhausted_attempts: u32,
    pub forsaken_attempts: u32,
    pub workers_slow: u32,

    pub resources_requested: ResourceSummary,
    pub resources_allocated: Option<ResourceSummary>,
    pub resources_measured: Option<ResourceSummary>,
    pub sandbox_measured: Option<f64>,

    pub result: TaskResult,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub metrics: TaskMetrics,
}

impl Task {
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.id,
            task_type: self.task_type,
            state: self.state,
            command_line: self.command_line.clone(),
            tag: self.tag.clone(),
            category: self.category.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            max_forsaken: self.max_forsaken,
            min_running_time: self.min_running_time,
            worker_selection: self.worker_selection,

            needs_library: self.needs_library().map(str::to_string),
            provides_library: self.provides_library().map(str::to_string),
            library_task: self.library_task(),
            function_slots_total: self.function_slots_total(),
            function_slots_inuse: self.function_slots_inuse(),

            inputs: self.input_mounts.iter().map(MountRecord::from).collect(),
            outputs: self.output_mounts.iter().map(MountRecord::from).collect(),

            worker: self.worker.clone(),
            addrport: self.addrport.clone(),
            hostname: self.hostname.clone(),

            try_count: self.try_count,
            forsaken_count: self.forsaken_count,
            exhausted_attempts: self.exhausted_attempts,
            forsaken_attempts: self.forsaken_attempts,
            workers_slow: self.workers_slow,

            resources_requested: self.resources_requested.clone(),
            resources_allocated: self.resources_allocated.clone(),
            resources_measured: self.resources_measured.clone(),
            sandbox_measured: self.sandbox_measured,

            result: self.result,
            exit_code: self.exit_code,
            output: self.output.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_record())
    }

    /// Lo que necesita el worker para ejecutar el intento actual.
    pub fn to_dispatch(&self) -> TaskDispatch {
        let library: Option<LibrarySpec> = match self.task_type {
            TaskType::LibraryInstance => self.library.spec().cloned(),
            _ => None,
        };
        TaskDispatch {
            task_id: self.id,
            task_type: self.task_type,
            command_line: self.command_line.clone(),
            env: self.env.clone(),
            input_mounts: self.input_mounts.clone(),
            output_mounts: self.output_mounts.clone(),
            allocated: self.resources_allocated.clone().unwrap_or_default(),
            needs_library: self.needs_library().map(str::to_string),
            library_task: self.library_task(),
            library,
            function_slots: self.function_slots_total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{instantiate, ExecMode};

    #[test]
    fn record_refleja_la_tarea() {
        let mut t = Task::new(TaskId(3), "wc -l in.txt");
        t.set_tag("conteo").unwrap();
        t.add_input_buffer(b"a\nb\n", "in.txt", MountFlags::cached())
            .unwrap();
        t.add_output_file("/out/n", "n", MountFlags::default())
            .unwrap();

        let r = t.to_record();
        assert_eq!(r.task_id, TaskId(3));
        assert_eq!(r.state, TaskState::Initial);
        assert_eq!(r.tag.as_deref(), Some("conteo"));
        assert_eq!(r.inputs[0].kind, "buffer");
        assert_eq!(r.inputs[0].source, "<4 bytes>");
        assert_eq!(r.outputs[0].source, "/out/n");
    }

    #[test]
    fn json_usa_nombres_estables() {
        let t = Task::new(TaskId(1), "true");
        let v: serde_json::Value = serde_json::from_str(&t.to_json().unwrap()).unwrap();
        assert_eq!(v["state"], "INITIAL");
        assert_eq!(v["task_type"], "STANDARD");
        assert_eq!(v["result"], "UNKNOWN");
        assert_eq!(v["task_id"], 1);
    }

    #[test]
    fn dispatch_de_instancia_lleva_la_libreria() {
        let tpl = Task::library_template(TaskId(1), "serve", "L", -1, ExecMode::Fork);
        let inst = instantiate(&tpl, TaskId(2), "w1", 6).unwrap();
        let d = inst.to_dispatch();
        assert_eq!(d.task_type, TaskType::LibraryInstance);
        assert_eq!(d.library.as_ref().map(|l| l.exec_mode), Some(ExecMode::Fork));
        assert_eq!(d.function_slots, Some(6));

        let f = Task::new(TaskId(3), "f()").to_dispatch();
        assert!(f.library.is_none());
        assert_eq!(f.allocated, ResourceSummary::default());
    }
}
