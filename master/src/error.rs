use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::{TaskError, TaskId, WorkerId};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("tarea {0} no encontrada")]
    TaskNotFound(TaskId),

    #[error("worker {0} no registrado o marcado como muerto")]
    UnknownWorker(WorkerId),

    #[error("la librería '{0}' ya está instalada")]
    LibraryExists(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl MasterError {
    pub fn status(&self) -> StatusCode {
        match self {
            MasterError::TaskNotFound(_) | MasterError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            MasterError::LibraryExists(_) => StatusCode::CONFLICT,
            MasterError::Task(e) if e.is_submission_error() => StatusCode::UNPROCESSABLE_ENTITY,
            MasterError::Task(TaskError::LibraryMismatch(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            MasterError::Task(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for MasterError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MountSide, TaskState};

    #[test]
    fn errores_de_estado_son_conflict() {
        let e = MasterError::from(TaskError::InvalidTransition {
            task_id: TaskId(1),
            from: TaskState::Done,
            to: TaskState::Ready,
        });
        assert_eq!(e.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn errores_de_envio_son_422() {
        let e = MasterError::from(TaskError::DuplicateMount {
            side: MountSide::Input,
            remote_name: "a".into(),
        });
        assert_eq!(e.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            MasterError::TaskNotFound(TaskId(3)).status(),
            StatusCode::NOT_FOUND
        );
    }
}
