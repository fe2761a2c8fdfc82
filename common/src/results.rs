use serde::{Deserialize, Serialize};
use std::fmt;

/// Clasificación del resultado de un intento.
///
/// Es un dato, no un error: la política de reintentos decide qué hacer con él.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    /// Todavía sin resultado
    #[default]
    Unknown,
    Success,
    /// El comando terminó con exit code distinto de cero
    NonzeroExit,
    /// El comando murió por una señal
    Signal,
    InputMissing,
    OutputMissing,
    /// Los recursos asignados no alcanzaron
    ResourceExhaustion,
    /// La tarea superó su tiempo máximo de pared
    MaxWallTime,
    /// Cortada por tardar demasiado en un worker lento; se reintenta en otro
    SlowWorker,
    /// Despachada pero nunca empezó a ejecutar
    Forsaken,
    MaxRetries,
    Cancelled,
    /// El worker se cayó o desconectó durante la ejecución
    WorkerFailure,
    /// El proceso de la librería terminó
    LibraryExit,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::Unknown => "UNKNOWN",
            TaskResult::Success => "SUCCESS",
            TaskResult::NonzeroExit => "NONZERO_EXIT",
            TaskResult::Signal => "SIGNAL",
            TaskResult::InputMissing => "INPUT_MISSING",
            TaskResult::OutputMissing => "OUTPUT_MISSING",
            TaskResult::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            TaskResult::MaxWallTime => "MAX_WALL_TIME",
            TaskResult::SlowWorker => "SLOW_WORKER",
            TaskResult::Forsaken => "FORSAKEN",
            TaskResult::MaxRetries => "MAX_RETRIES",
            TaskResult::Cancelled => "CANCELLED",
            TaskResult::WorkerFailure => "WORKER_FAILURE",
            TaskResult::LibraryExit => "LIBRARY_EXIT",
        }
    }

    /// Fallos transitorios: si hay margen en los límites, la tarea vuelve a Ready.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskResult::WorkerFailure
                | TaskResult::ResourceExhaustion
                | TaskResult::SlowWorker
                | TaskResult::Forsaken
        )
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, TaskResult::Unknown | TaskResult::Success)
    }

    /// Resultados "de archivo faltante", que no pisan un fallo más específico.
    pub fn is_missing_file(&self) -> bool {
        matches!(self, TaskResult::InputMissing | TaskResult::OutputMissing)
    }

    /// Resultado con el que se cierra un fallo transitorio cuando se agotan
    /// los reintentos. Un worker caído o lento no deja un resultado útil.
    pub fn when_retries_exhausted(self) -> TaskResult {
        match self {
            TaskResult::WorkerFailure | TaskResult::SlowWorker => TaskResult::MaxRetries,
            other => other,
        }
    }

    /// Clasifica lo que reporta el worker para un proceso que sí arrancó.
    pub fn from_exit(exit_code: Option<i32>, signal: Option<i32>) -> TaskResult {
        match (exit_code, signal) {
            (_, Some(_)) => TaskResult::Signal,
            (Some(0), None) => TaskResult::Success,
            (Some(_), None) => TaskResult::NonzeroExit,
            (None, None) => TaskResult::WorkerFailure,
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_results() {
        assert!(TaskResult::WorkerFailure.is_retryable());
        assert!(TaskResult::Forsaken.is_retryable());
        assert!(!TaskResult::Signal.is_retryable());
        assert!(!TaskResult::Cancelled.is_retryable());
        assert!(!TaskResult::MaxRetries.is_retryable());
    }

    #[test]
    fn exhausted_worker_failure_becomes_max_retries() {
        assert_eq!(
            TaskResult::WorkerFailure.when_retries_exhausted(),
            TaskResult::MaxRetries
        );
        assert_eq!(
            TaskResult::ResourceExhaustion.when_retries_exhausted(),
            TaskResult::ResourceExhaustion
        );
    }

    #[test]
    fn from_exit_clasifica() {
        assert_eq!(TaskResult::from_exit(Some(0), None), TaskResult::Success);
        assert_eq!(TaskResult::from_exit(Some(2), None), TaskResult::NonzeroExit);
        assert_eq!(TaskResult::from_exit(None, Some(9)), TaskResult::Signal);
        assert_eq!(TaskResult::from_exit(None, None), TaskResult::WorkerFailure);
    }
}
