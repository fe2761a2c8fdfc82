use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Métricas de una tarea. `time_when_*` son instantes; el resto son
/// duraciones en microsegundos.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub time_when_submitted: Option<DateTime<Utc>>,
    /// Marcada como Retrieved (salidas traídas)
    pub time_when_done: Option<DateTime<Utc>>,
    pub time_when_commit_start: Option<DateTime<Utc>>,
    pub time_when_commit_end: Option<DateTime<Utc>>,
    pub time_when_retrieval: Option<DateTime<Utc>>,
    pub time_when_last_failure: Option<DateTime<Utc>>,

    pub time_workers_execute_last_start: Option<DateTime<Utc>>,
    pub time_workers_execute_last_end: Option<DateTime<Utc>>,

    pub time_workers_execute_last: u64,
    /// Todo lo ejecutado en cualquier worker, haya terminado o no
    pub time_workers_execute_all: u64,
    pub time_workers_execute_exhaustion: u64,
    pub time_workers_execute_failure: u64,

    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bytes_transferred: u64,
}

impl TaskMetrics {
    /// Cierra la medición del intento actual y devuelve su duración.
    /// Si el worker no informó el fin, se usa `now`.
    pub(crate) fn close_execution(&mut self, now: DateTime<Utc>) -> u64 {
        if let Some(start) = self.time_workers_execute_last_start {
            let end = *self.time_workers_execute_last_end.get_or_insert(now);
            self.time_workers_execute_last = micros_between(start, end);
        }
        self.time_workers_execute_last
    }

    /// Borra lo que pertenece a un solo intento. Los acumulados quedan.
    pub(crate) fn clear_attempt(&mut self) {
        self.time_when_commit_start = None;
        self.time_when_commit_end = None;
        self.time_when_retrieval = None;
        self.time_workers_execute_last_start = None;
        self.time_workers_execute_last_end = None;
        self.time_workers_execute_last = 0;
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.bytes_transferred = 0;
    }

    /// Tiempo total de commit (envío al worker) del intento actual.
    pub fn commit_time(&self) -> Option<u64> {
        match (self.time_when_commit_start, self.time_when_commit_end) {
            (Some(start), Some(end)) => Some(micros_between(start, end)),
            _ => None,
        }
    }
}

pub fn micros_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_microseconds().unwrap_or(0).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn close_execution_usa_el_fin_reportado() {
        let start = Utc::now();
        let mut m = TaskMetrics {
            time_workers_execute_last_start: Some(start),
            time_workers_execute_last_end: Some(start + Duration::milliseconds(1500)),
            ..TaskMetrics::default()
        };

        let elapsed = m.close_execution(start + Duration::seconds(60));
        assert_eq!(elapsed, 1_500_000);
        assert_eq!(m.time_workers_execute_last, 1_500_000);
    }

    #[test]
    fn close_execution_sin_inicio_es_cero() {
        let mut m = TaskMetrics::default();
        assert_eq!(m.close_execution(Utc::now()), 0);
        assert_eq!(m.time_workers_execute_last_end, None);
    }

    #[test]
    fn clear_attempt_conserva_acumulados() {
        let now = Utc::now();
        let mut m = TaskMetrics {
            time_when_submitted: Some(now),
            time_when_commit_start: Some(now),
            time_workers_execute_all: 42,
            bytes_sent: 10,
            ..TaskMetrics::default()
        };
        m.clear_attempt();
        assert_eq!(m.time_when_submitted, Some(now));
        assert_eq!(m.time_workers_execute_all, 42);
        assert_eq!(m.time_when_commit_start, None);
        assert_eq!(m.bytes_sent, 0);
    }

    #[test]
    fn tiempos_negativos_son_cero() {
        let now = Utc::now();
        assert_eq!(micros_between(now, now - Duration::seconds(1)), 0);
    }
}
