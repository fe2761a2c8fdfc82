use serde::{Deserialize, Serialize};
use std::fmt;

/// Ciclo de vida de una tarea dentro del manager.
///
/// Orden estricto: Initial -> Ready -> Running -> WaitingRetrieval -> Retrieved -> Done.
/// Sólo `clean` (vuelta a Ready) y `reset` (vuelta a Initial) retroceden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Creada, todavía no enviada al manager
    Initial,
    /// En la cola del manager esperando worker
    Ready,
    /// Despachada a un worker
    Running,
    /// El worker terminó, falta traer la salida
    WaitingRetrieval,
    /// Salida disponible en el manager
    Retrieved,
    /// Entregada por la interfaz de espera (o lista para descartar si es interna)
    Done,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Initial,
        TaskState::Ready,
        TaskState::Running,
        TaskState::WaitingRetrieval,
        TaskState::Retrieved,
        TaskState::Done,
    ];

    /// Nombre estable para logs y serialización.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Initial => "INITIAL",
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::WaitingRetrieval => "WAITING_RETRIEVAL",
            TaskState::Retrieved => "RETRIEVED",
            TaskState::Done => "DONE",
        }
    }

    /// Siguiente estado permitido en avance normal.
    pub fn next(&self) -> Option<TaskState> {
        match self {
            TaskState::Initial => Some(TaskState::Ready),
            TaskState::Ready => Some(TaskState::Running),
            TaskState::Running => Some(TaskState::WaitingRetrieval),
            TaskState::WaitingRetrieval => Some(TaskState::Retrieved),
            TaskState::Retrieved => Some(TaskState::Done),
            TaskState::Done => None,
        }
    }

    pub fn can_advance_to(&self, to: TaskState) -> bool {
        self.next() == Some(to)
    }

    /// Retrieved y Done: el resultado ya es definitivo.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Retrieved | TaskState::Done)
    }

    /// Estados en los que un intento está vivo en un worker.
    pub fn is_attempt_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::WaitingRetrieval)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_se_avanza_al_estado_siguiente() {
        for (i, from) in TaskState::ALL.iter().enumerate() {
            for (j, to) in TaskState::ALL.iter().enumerate() {
                assert_eq!(from.can_advance_to(*to), j == i + 1, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn done_no_tiene_siguiente() {
        assert_eq!(TaskState::Done.next(), None);
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Retrieved.is_terminal());
        assert!(!TaskState::WaitingRetrieval.is_terminal());
    }

    #[test]
    fn nombres_estables() {
        assert_eq!(TaskState::WaitingRetrieval.to_string(), "WAITING_RETRIEVAL");
        let json = serde_json::to_string(&TaskState::WaitingRetrieval).unwrap();
        assert_eq!(json, "\"WAITING_RETRIEVAL\"");
    }
}
