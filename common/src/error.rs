use thiserror::Error;

use crate::mount::MountSide;
use crate::state::TaskState;
use crate::task::TaskId;

/// Errores de integración o de validación sobre una tarea.
///
/// Los resultados de ejecución (exit code, señal, recursos agotados...) NO son
/// errores: se guardan como [`crate::TaskResult`] dentro de la tarea.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("transición inválida en tarea {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("operación '{op}' no permitida en tarea {task_id} en estado {state}")]
    InvalidState {
        task_id: TaskId,
        op: &'static str,
        state: TaskState,
    },

    #[error("mount duplicado en {side}: {remote_name}")]
    DuplicateMount {
        side: MountSide,
        remote_name: String,
    },

    #[error("mount inválido '{remote_name}': {reason}")]
    InvalidMount { remote_name: String, reason: String },

    #[error("ningún worker puede satisfacer la ubicación fija de '{remote_name}'")]
    UnsatisfiableLocation { remote_name: String },

    #[error("la librería {instance} no tiene slots libres ({total} en uso)")]
    NoFreeSlot { instance: TaskId, total: u32 },

    #[error("librería incompatible: {0}")]
    LibraryMismatch(String),

    #[error("modo de ejecución inválido: {0}")]
    InvalidExecMode(String),
}

impl TaskError {
    /// true para errores de validación al enviar la tarea (nunca llega a la cola).
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            TaskError::DuplicateMount { .. }
                | TaskError::InvalidMount { .. }
                | TaskError::UnsatisfiableLocation { .. }
                | TaskError::InvalidExecMode(_)
        )
    }
}
