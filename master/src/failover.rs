use std::time::SystemTime;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::scheduler;
use crate::state::{lock, AppState};

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - devuelve sus intentos a la política de reintentos
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(state.config.sweep_interval).await;
        sweep_once(&state, SystemTime::now());
    }
}

/// Una pasada de chequeo. Devuelve los workers marcados como muertos.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Vec<String> {
    let timeout = state.config.heartbeat_timeout;
    let mut newly_dead: Vec<String> = Vec::new();

    {
        let mut workers = lock(&state.workers);
        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
                if elapsed > timeout {
                    meta.dead = true;
                    newly_dead.push(worker_id.clone());
                    warn!(
                        worker_id = %worker_id,
                        ?elapsed,
                        "marcando worker como DEAD (sin heartbeat)"
                    );
                }
            }
        }
    }

    for worker_id in &newly_dead {
        let affected = scheduler::fail_worker(state, worker_id);
        info!(worker_id = %worker_id, affected, "intentos del worker caído procesados");
    }
    newly_dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::state::WorkerMeta;
    use common::{ResourceSummary, TaskRequest, TaskState};
    use std::time::Duration;

    fn worker(last_heartbeat: SystemTime) -> WorkerMeta {
        WorkerMeta {
            hostname: "nodo".into(),
            addrport: "10.0.0.2:9123".into(),
            resources: ResourceSummary::new().with("cores", 1.0),
            features: Default::default(),
            cached_files: Default::default(),
            last_heartbeat,
            dead: false,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }

    #[test]
    fn worker_sin_heartbeat_se_marca_muerto_y_su_tarea_vuelve() {
        let state = AppState::new(MasterConfig::default());
        let now = SystemTime::now();
        lock(&state.workers).insert("viejo".into(), worker(now - Duration::from_secs(60)));
        lock(&state.workers).insert("vivo".into(), worker(now));

        let id = scheduler::submit(
            &state,
            TaskRequest {
                command_line: "sleep 1".into(),
                ..TaskRequest::default()
            },
        )
        .unwrap();
        scheduler::next_for_worker(&state, "viejo").unwrap().unwrap();

        let dead = sweep_once(&state, now);
        assert_eq!(dead, vec!["viejo".to_string()]);
        assert!(lock(&state.workers)["viejo"].dead);

        let rec = scheduler::task_record(&state, id).unwrap();
        assert_eq!(rec.state, TaskState::Ready);
        assert_eq!(rec.forsaken_count, 1);

        // una segunda pasada no lo vuelve a procesar
        assert!(sweep_once(&state, now).is_empty());
    }
}
