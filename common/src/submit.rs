use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TaskError;
use crate::library::ExecMode;
use crate::mount::{FileObject, MountFlags};
use crate::policy::Disposition;
use crate::record::TaskRecord;
use crate::resources::ResourceSummary;
use crate::task::{Task, TaskId, WorkerSelection};

/// Límites que se aplican si el pedido no trae los suyos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitDefaults {
    pub max_retries: i32,
    pub max_forsaken: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub file: FileObject,
    pub remote_name: String,
    #[serde(default)]
    pub flags: MountFlags,
}

/// Pedido de envío de una tarea.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Comando de shell, ej: "python sim.py --seed 4"
    pub command_line: String,

    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: f64,

    /// Sin valor: el default del manager. < 1: ilimitado.
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub max_forsaken: Option<i32>,
    /// segundos
    #[serde(default)]
    pub min_running_time: u64,
    #[serde(default)]
    pub worker_selection: WorkerSelection,

    #[serde(default)]
    pub resources: ResourceSummary,
    #[serde(default)]
    pub inputs: Vec<MountRequest>,
    #[serde(default)]
    pub outputs: Vec<MountRequest>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub features: Vec<String>,

    /// Si viene, es una tarea de función de esa librería
    #[serde(default)]
    pub needs_library: Option<String>,
}

impl TaskRequest {
    /// Arma la tarea en `Initial`. Los mounts se validan acá.
    pub fn build(self, id: TaskId, defaults: SubmitDefaults) -> Result<Task, TaskError> {
        let mut task = Task::new(id, self.command_line);
        apply_common(
            &mut task,
            self.tag,
            self.category,
            self.resources,
            self.env,
            self.features,
        )?;
        task.set_priority(self.priority)?;
        task.set_max_retries(self.max_retries.unwrap_or(defaults.max_retries))?;
        task.set_max_forsaken(self.max_forsaken.unwrap_or(defaults.max_forsaken))?;
        task.set_min_running_time(self.min_running_time)?;
        task.set_worker_selection(self.worker_selection)?;

        for m in self.inputs {
            task.add_input(m.file, &m.remote_name, m.flags)?;
        }
        for m in self.outputs {
            match m.file {
                FileObject::LocalFile { path, .. } => {
                    task.add_output_file(&path, &m.remote_name, m.flags)?
                }
                _ => {
                    return Err(TaskError::InvalidMount {
                        remote_name: m.remote_name,
                        reason: "las salidas sólo pueden ser archivos locales".to_string(),
                    })
                }
            }
        }

        if let Some(lib) = self.needs_library {
            task.set_library_required(lib)?;
        }
        Ok(task)
    }
}

/// Instalación de una librería: crea el template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryRequest {
    pub name: String,
    /// Comando que levanta el proceso de la librería
    pub command_line: String,
    /// < 1: tantos slots como cores tenga el worker
    #[serde(default = "default_function_slots")]
    pub function_slots: i32,
    /// "direct" o "fork"
    #[serde(default)]
    pub exec_mode: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub resources: ResourceSummary,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_function_slots() -> i32 {
    -1
}

impl LibraryRequest {
    pub fn build(self, id: TaskId) -> Result<Task, TaskError> {
        let exec_mode = match self.exec_mode.as_deref() {
            Some(s) => s.parse::<ExecMode>()?,
            None => ExecMode::default(),
        };
        let mut task = Task::library_template(
            id,
            self.command_line,
            self.name,
            self.function_slots,
            exec_mode,
        );
        apply_common(
            &mut task,
            None,
            self.category,
            self.resources,
            self.env,
            self.features,
        )?;
        Ok(task)
    }
}

fn apply_common(
    task: &mut Task,
    tag: Option<String>,
    category: Option<String>,
    resources: ResourceSummary,
    env: BTreeMap<String, String>,
    features: Vec<String>,
) -> Result<(), TaskError> {
    if let Some(tag) = tag {
        task.set_tag(tag)?;
    }
    if let Some(category) = category {
        task.set_category(category)?;
    }
    task.set_resources_requested(resources)?;
    for (k, v) in env {
        task.set_env(k, v)?;
    }
    for f in features {
        task.add_feature(f)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmitResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryInstallResponse {
    pub template_id: TaskId,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitRequest {
    /// Sólo tareas con este tag
    #[serde(default)]
    pub tag: Option<String>,
    /// Cuánto esperar si no hay nada listo
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    /// Tarea entregada (ya en DONE)
    pub task: Option<TaskRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    pub disposition: Disposition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskState;

    const DEFAULTS: SubmitDefaults = SubmitDefaults {
        max_retries: 5,
        max_forsaken: 3,
    };

    #[test]
    fn build_aplica_defaults_y_mounts() {
        let req: TaskRequest = serde_json::from_value(serde_json::json!({
            "command_line": "cat in.txt > out.txt",
            "tag": "t1",
            "inputs": [
                {"file": {"kind": "buffer", "data": [104, 105]}, "remote_name": "in.txt"}
            ],
            "outputs": [
                {"file": {"kind": "local_file", "path": "/data/out.txt"}, "remote_name": "out.txt",
                 "flags": {"watch": true}}
            ],
            "env": {"A": "1"}
        }))
        .unwrap();

        let t = req.build(TaskId(4), DEFAULTS).unwrap();
        assert_eq!(t.state(), TaskState::Initial);
        assert_eq!(t.max_retries(), 5);
        assert_eq!(t.max_forsaken(), 3);
        assert_eq!(t.category(), "default");
        assert_eq!(t.input_mounts().len(), 1);
        assert_eq!(t.watched_outputs(), vec!["/data/out.txt"]);
        assert_eq!(t.env(), &[("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn limites_explicitos_ganan() {
        let req = TaskRequest {
            command_line: "x".into(),
            max_retries: Some(-1),
            ..TaskRequest::default()
        };
        let t = req.build(TaskId(1), DEFAULTS).unwrap();
        assert_eq!(t.max_retries(), -1);
    }

    #[test]
    fn mount_duplicado_rechaza_el_envio() {
        let m = MountRequest {
            file: FileObject::local("/a"),
            remote_name: "a".into(),
            flags: MountFlags::default(),
        };
        let req = TaskRequest {
            command_line: "x".into(),
            inputs: vec![m.clone(), m],
            ..TaskRequest::default()
        };
        let err = req.build(TaskId(1), DEFAULTS).unwrap_err();
        assert!(err.is_submission_error());
    }

    #[test]
    fn libreria_con_exec_mode_invalido() {
        let req = LibraryRequest {
            name: "L".into(),
            command_line: "serve".into(),
            function_slots: 2,
            exec_mode: Some("thread".into()),
            category: None,
            resources: ResourceSummary::default(),
            env: BTreeMap::new(),
            features: vec![],
        };
        assert!(matches!(
            req.build(TaskId(1)),
            Err(TaskError::InvalidExecMode(_))
        ));
    }

    #[test]
    fn libreria_sin_slots_usa_cores() {
        let req: LibraryRequest = serde_json::from_value(serde_json::json!({
            "name": "L",
            "command_line": "serve"
        }))
        .unwrap();
        assert_eq!(req.function_slots, -1);
        let t = req.build(TaskId(9)).unwrap();
        assert_eq!(t.provides_library(), Some("L"));
        assert_eq!(t.library_failed_count(), Some(0));
    }
}
