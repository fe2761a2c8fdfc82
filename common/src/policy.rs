//! Decisión de reintento al registrar el resultado de un intento.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::results::TaskResult;
use crate::state::TaskState;
use crate::task::{Task, TaskType};

/// Qué pasó con la tarea después de `set_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "disposition", content = "result")]
pub enum Disposition {
    /// Volvió a Ready para otro intento
    Retry,
    /// Queda en WaitingRetrieval (o Retrieved) con este resultado
    Final(TaskResult),
}

/// `limit` < 1 es ilimitado.
fn exceeds(count: u32, limit: i32) -> bool {
    limit >= 1 && count > limit as u32
}

impl Task {
    /// Registra el resultado del intento actual y decide si se reintenta.
    ///
    /// Reglas:
    /// - sólo con un intento vivo (`Running` o `WaitingRetrieval`); `Forsaken`
    ///   sólo desde `Running`, antes de que la tarea haya arrancado en el worker;
    /// - un archivo faltante no pisa un fallo anterior del mismo intento;
    /// - cada intento suma una vez: `Forsaken` en `forsaken_count`, cualquier
    ///   otro resultado en `try_count`;
    /// - `WorkerFailure`, `ResourceExhaustion`, `SlowWorker` y `Forsaken` se
    ///   reintentan mientras no se pase el límite correspondiente;
    /// - las instancias de librería nunca se reintentan.
    pub fn set_result(&mut self, result: TaskResult) -> Result<Disposition, TaskError> {
        if !self.state.is_attempt_active() {
            return Err(self.invalid_state("set_result"));
        }
        if result == TaskResult::Unknown {
            return Err(self.invalid_state("set_result(UNKNOWN)"));
        }
        if result == TaskResult::Forsaken && self.state != TaskState::Running {
            return Err(self.invalid_state("set_result(FORSAKEN)"));
        }

        if self.state == TaskState::WaitingRetrieval
            && result.is_missing_file()
            && self.result.is_failure()
            && !self.result.is_missing_file()
        {
            debug!(
                task_id = %self.id,
                kept = %self.result,
                ignored = %result,
                "archivo faltante no reemplaza el fallo anterior"
            );
            return Ok(Disposition::Final(self.result));
        }

        let now = Utc::now();
        let elapsed = self.metrics.close_execution(now);

        if !self.attempt_counted {
            self.attempt_counted = true;
            // un intento forsaken nunca ejecutó: su tiempo de ejecución es cero
            if result == TaskResult::Forsaken {
                self.forsaken_count += 1;
                self.forsaken_attempts += 1;
            } else {
                self.try_count += 1;
                self.metrics.time_workers_execute_all += elapsed;
            }
        }

        match result {
            TaskResult::ResourceExhaustion => {
                self.exhausted_attempts += 1;
                self.metrics.time_workers_execute_exhaustion += elapsed;
            }
            TaskResult::WorkerFailure => {
                self.metrics.time_workers_execute_failure += elapsed;
            }
            TaskResult::SlowWorker => {
                self.workers_slow += 1;
            }
            _ => {}
        }
        if result.is_failure() {
            self.metrics.time_when_last_failure = Some(now);
        }

        let retryable = result.is_retryable() && self.task_type != TaskType::LibraryInstance;
        let over_limit = if result == TaskResult::Forsaken {
            exceeds(self.forsaken_count, self.max_forsaken)
        } else {
            exceeds(self.try_count, self.max_retries)
        };

        if retryable && !over_limit {
            info!(
                task_id = %self.id,
                result = %result,
                try_count = self.try_count,
                forsaken_count = self.forsaken_count,
                "reintentando tarea"
            );
            self.clean()?;
            return Ok(Disposition::Retry);
        }

        let final_result = if retryable && result != TaskResult::Forsaken {
            result.when_retries_exhausted()
        } else {
            result
        };

        if retryable {
            warn!(
                task_id = %self.id,
                result = %result,
                final_result = %final_result,
                try_count = self.try_count,
                max_retries = self.max_retries,
                forsaken_count = self.forsaken_count,
                max_forsaken = self.max_forsaken,
                "límite de reintentos alcanzado"
            );
        }

        self.result = final_result;
        self.library.take_lease();
        if self.state == TaskState::Running {
            self.state = TaskState::WaitingRetrieval;
        }
        debug!(task_id = %self.id, result = %final_result, "resultado final");
        Ok(Disposition::Final(final_result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use chrono::Duration;

    fn running(max_retries: i32, max_forsaken: i32) -> Task {
        let mut t = Task::new(TaskId(1), "simular");
        t.set_max_retries(max_retries).unwrap();
        t.set_max_forsaken(max_forsaken).unwrap();
        t.transition(TaskState::Ready).unwrap();
        redispatch(&mut t);
        t
    }

    fn redispatch(t: &mut Task) {
        t.assign_worker("w1", "10.0.0.1:9123", "nodo1").unwrap();
        t.transition(TaskState::Running).unwrap();
    }

    #[test]
    fn exito_es_final() {
        let mut t = running(0, 0);
        t.set_exit_code(0).unwrap();
        assert_eq!(
            t.set_result(TaskResult::Success).unwrap(),
            Disposition::Final(TaskResult::Success)
        );
        assert_eq!(t.state(), TaskState::WaitingRetrieval);
        assert_eq!(t.try_count(), 1);
        assert!(t.metrics().time_when_last_failure.is_none());
    }

    #[test]
    fn unknown_es_rechazado() {
        let mut t = running(0, 0);
        assert!(matches!(
            t.set_result(TaskResult::Unknown),
            Err(TaskError::InvalidState { .. })
        ));
        assert_eq!(t.state(), TaskState::Running);
    }

    #[test]
    fn sin_intento_vivo_es_error() {
        let mut t = Task::new(TaskId(1), "x");
        assert!(t.set_result(TaskResult::Success).is_err());
        t.transition(TaskState::Ready).unwrap();
        assert!(t.set_result(TaskResult::Success).is_err());
    }

    #[test]
    fn worker_failure_reintenta_hasta_max_retries() {
        let mut t = running(2, 0);

        assert_eq!(t.set_result(TaskResult::WorkerFailure).unwrap(), Disposition::Retry);
        assert_eq!(t.state(), TaskState::Ready);
        assert_eq!(t.try_count(), 1);

        redispatch(&mut t);
        assert_eq!(t.set_result(TaskResult::WorkerFailure).unwrap(), Disposition::Retry);
        assert_eq!(t.try_count(), 2);

        redispatch(&mut t);
        assert_eq!(
            t.set_result(TaskResult::WorkerFailure).unwrap(),
            Disposition::Final(TaskResult::MaxRetries)
        );
        assert_eq!(t.try_count(), 3);
        assert_eq!(t.state(), TaskState::WaitingRetrieval);
        assert_eq!(t.result(), TaskResult::MaxRetries);
    }

    #[test]
    fn resource_exhaustion_conserva_su_resultado_al_agotar() {
        let mut t = running(1, 0);
        assert_eq!(t.set_result(TaskResult::ResourceExhaustion).unwrap(), Disposition::Retry);
        redispatch(&mut t);
        assert_eq!(
            t.set_result(TaskResult::ResourceExhaustion).unwrap(),
            Disposition::Final(TaskResult::ResourceExhaustion)
        );
        assert_eq!(t.exhausted_attempts(), 2);
    }

    #[test]
    fn reintentos_ilimitados_con_limite_menor_a_uno() {
        let mut t = running(-1, 0);
        for n in 1..=20 {
            assert_eq!(t.set_result(TaskResult::SlowWorker).unwrap(), Disposition::Retry);
            assert_eq!(t.try_count(), n);
            redispatch(&mut t);
        }
        assert_eq!(t.workers_slow(), 20);
    }

    #[test]
    fn fallos_no_reintentables_son_finales() {
        for r in [
            TaskResult::NonzeroExit,
            TaskResult::Signal,
            TaskResult::InputMissing,
            TaskResult::OutputMissing,
            TaskResult::MaxWallTime,
            TaskResult::Cancelled,
            TaskResult::LibraryExit,
        ] {
            let mut t = running(5, 5);
            assert_eq!(t.set_result(r).unwrap(), Disposition::Final(r), "{r}");
            assert_eq!(t.try_count(), 1);
            assert!(t.metrics().time_when_last_failure.is_some());
        }
    }

    #[test]
    fn forsaken_cuenta_aparte_de_try_count() {
        let mut t = running(1, 2);

        assert_eq!(t.set_result(TaskResult::Forsaken).unwrap(), Disposition::Retry);
        redispatch(&mut t);
        assert_eq!(t.set_result(TaskResult::Forsaken).unwrap(), Disposition::Retry);
        assert_eq!(t.try_count(), 0);
        assert_eq!(t.forsaken_count(), 2);

        redispatch(&mut t);
        assert_eq!(
            t.set_result(TaskResult::Forsaken).unwrap(),
            Disposition::Final(TaskResult::Forsaken)
        );
        assert_eq!(t.forsaken_count(), 3);
        assert_eq!(t.forsaken_attempts(), 3);
        assert_eq!(t.result(), TaskResult::Forsaken);
        assert_eq!(t.metrics().time_workers_execute_all, 0);
    }

    #[test]
    fn forsaken_solo_desde_running() {
        let mut t = running(0, 0);
        t.set_result(TaskResult::NonzeroExit).unwrap();
        assert_eq!(t.state(), TaskState::WaitingRetrieval);
        assert!(t.set_result(TaskResult::Forsaken).is_err());
        assert_eq!(t.result(), TaskResult::NonzeroExit);
    }

    #[test]
    fn archivo_faltante_no_pisa_fallo_anterior() {
        let mut t = running(0, 0);
        t.set_exit_code(3).unwrap();
        t.set_result(TaskResult::NonzeroExit).unwrap();

        assert_eq!(
            t.set_result(TaskResult::OutputMissing).unwrap(),
            Disposition::Final(TaskResult::NonzeroExit)
        );
        assert_eq!(t.result(), TaskResult::NonzeroExit);
        assert_eq!(t.try_count(), 1);
    }

    #[test]
    fn archivo_faltante_si_reemplaza_un_exito() {
        let mut t = running(0, 0);
        t.set_exit_code(0).unwrap();
        t.set_result(TaskResult::Success).unwrap();

        assert_eq!(
            t.set_result(TaskResult::OutputMissing).unwrap(),
            Disposition::Final(TaskResult::OutputMissing)
        );
        assert_eq!(t.result(), TaskResult::OutputMissing);
        // el mismo intento no suma dos veces
        assert_eq!(t.try_count(), 1);
    }

    #[test]
    fn instancia_de_libreria_nunca_reintenta() {
        use crate::library::{instantiate, ExecMode};

        let tpl = Task::library_template(TaskId(1), "serve", "L", 2, ExecMode::Direct);
        let mut inst = instantiate(&tpl, TaskId(2), "w1", 4).unwrap();
        inst.transition(TaskState::Ready).unwrap();
        inst.assign_worker("w1", "a:1", "h").unwrap();
        inst.transition(TaskState::Running).unwrap();

        assert_eq!(
            inst.set_result(TaskResult::WorkerFailure).unwrap(),
            Disposition::Final(TaskResult::WorkerFailure)
        );
        assert_eq!(inst.state(), TaskState::WaitingRetrieval);
    }

    #[test]
    fn acumula_tiempo_de_ejecucion_entre_intentos() {
        let mut t = running(0, 0);
        let start = Utc::now();
        t.record_execution(Some(start), Some(start + Duration::seconds(2)))
            .unwrap();
        t.set_result(TaskResult::WorkerFailure).unwrap();
        assert_eq!(t.metrics().time_workers_execute_all, 2_000_000);
        assert_eq!(t.metrics().time_workers_execute_failure, 2_000_000);
        // el intento se cerró, lo del intento se borra
        assert_eq!(t.metrics().time_workers_execute_last_start, None);

        redispatch(&mut t);
        t.record_execution(Some(start), Some(start + Duration::seconds(3)))
            .unwrap();
        t.set_result(TaskResult::Success).unwrap();
        assert_eq!(t.metrics().time_workers_execute_all, 5_000_000);
        assert_eq!(t.metrics().time_workers_execute_last, 3_000_000);
    }
}
