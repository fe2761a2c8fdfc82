//! Lógica del manager sobre las tareas: envío, despacho a workers, reportes
//! de los workers, cancelación, entrega (wait) y caída de workers.
//!
//! Nada de esto hace I/O de red; los handlers HTTP y el loop de failover sólo
//! traducen hacia estas funciones.

use std::{
    cmp::Ordering,
    collections::HashSet,
    fs::File,
    sync::MutexGuard,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use common::{
    allocate, fail_library_instance, instantiate, match_function, Disposition, LibraryRequest,
    ResourceEstimator, ResourceSummary, Task, TaskCompleteRequest, TaskDispatch, TaskError,
    TaskId, TaskRecord, TaskRef, TaskRequest, TaskResult, TaskStartedRequest, TaskState,
    TaskType, WaitRequest,
};
use tracing::{debug, info, warn};

use crate::error::MasterError;
use crate::state::{lock, AppState, InFlight, WorkerMeta};

/* ---------------- envío ---------------- */

pub fn submit(state: &AppState, req: TaskRequest) -> Result<TaskId, MasterError> {
    let id = state.ids.next_id();
    let mut task = req.build(id, state.config.submit_defaults)?;
    if task.has_fixed_locations() {
        check_fixed_locations_anywhere(state, &task)?;
    }
    task.transition(TaskState::Ready)?;

    info!(
        task_id = %id,
        category = task.category(),
        needs_library = ?task.needs_library(),
        "tarea encolada"
    );

    let task = TaskRef::new(task);
    lock(&state.tasks).insert(id, task.add_ref());
    lock(&state.ready).push_back(task);
    Ok(id)
}

/// Instala el template de una librería. Queda en READY para siempre: nunca
/// se despacha, sólo se instancia.
pub fn install_library(state: &AppState, req: LibraryRequest) -> Result<TaskId, MasterError> {
    if lock(&state.templates).contains_key(&req.name) {
        return Err(MasterError::LibraryExists(req.name));
    }

    let id = state.ids.next_id();
    let name = req.name.clone();
    let mut template = req.build(id)?;
    template.transition(TaskState::Ready)?;

    let template = TaskRef::new(template);
    lock(&state.tasks).insert(id, template.add_ref());
    lock(&state.templates).insert(name.clone(), template);

    info!(template_id = %id, library = %name, "librería instalada");
    Ok(id)
}

/// Algún worker vivo tiene que tener ya todos los archivos de ubicación fija;
/// si no, la tarea no entra a la cola.
fn check_fixed_locations_anywhere(state: &AppState, task: &Task) -> Result<(), MasterError> {
    let mut first_err = None;
    for meta in lock(&state.workers).values().filter(|m| !m.dead) {
        match task.check_fixed_locations(&meta.cached_files) {
            Ok(()) => return Ok(()),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    // sin workers vivos: falla si hay alguna entrada fija
    let res = match first_err {
        Some(e) => Err(e),
        None => task.check_fixed_locations(&HashSet::new()),
    };
    if let Err(e) = &res {
        warn!(task_id = %task.id(), "{}", e);
    }
    Ok(res?)
}

pub fn task_record(state: &AppState, id: TaskId) -> Result<TaskRecord, MasterError> {
    let task = lock(&state.tasks)
        .get(&id)
        .cloned()
        .ok_or(MasterError::TaskNotFound(id))?;
    let record = task.lock().to_record();
    Ok(record)
}

/* ---------------- despacho ---------------- */

enum Outcome {
    Skip,
    /// Se despachó la candidata (sale de la cola de listos)
    Candidate(TaskDispatch),
    /// Se levantó una instancia de librería; la candidata sigue esperando
    Instance(TaskDispatch),
}

/// Próximo intento para `worker_id`, si hay alguno que le sirva.
///
/// Recorre la cola por prioridad (FIFO entre iguales). Una tarea sirve si el
/// worker tiene sus features, sus archivos de ubicación fija y lugar para su
/// asignación. Una función necesita además un slot libre en una instancia de
/// su librería en ese worker; si el worker no tiene ninguna, se despacha una
/// instancia nueva en su lugar.
pub fn next_for_worker(
    state: &AppState,
    worker_id: &str,
) -> Result<Option<TaskDispatch>, MasterError> {
    let worker = match lock(&state.workers).get(worker_id) {
        Some(meta) if !meta.dead => meta.clone(),
        _ => return Err(MasterError::UnknownWorker(worker_id.to_string())),
    };

    let candidates = ready_by_priority(state);
    for candidate in candidates {
        let available = available_resources(state, worker_id, &worker.resources);
        match try_dispatch(state, worker_id, &worker, &available, &candidate)? {
            Outcome::Skip => continue,
            Outcome::Candidate(dispatch) => {
                lock(&state.ready).retain(|t| !t.ptr_eq(&candidate));
                return Ok(Some(dispatch));
            }
            Outcome::Instance(dispatch) => return Ok(Some(dispatch)),
        }
    }
    Ok(None)
}

fn ready_by_priority(state: &AppState) -> Vec<TaskRef> {
    let mut ready = lock(&state.ready);
    // limpia lo que salió de READY por otro camino (cancelación)
    ready.retain(|t| t.lock().state() == TaskState::Ready);

    let mut keyed: Vec<(f64, TaskRef)> = ready
        .iter()
        .map(|t| (t.lock().priority(), t.clone()))
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    keyed.into_iter().map(|(_, t)| t).collect()
}

/// Capacidad del worker menos lo asignado a sus intentos en vuelo. Las
/// funciones no cuentan: corren dentro de la asignación de su instancia.
fn available_resources(state: &AppState, worker_id: &str, total: &ResourceSummary) -> ResourceSummary {
    let running: Vec<TaskRef> = lock(&state.in_flight)
        .values()
        .filter(|e| e.worker_id == worker_id)
        .map(|e| e.task.clone())
        .collect();

    let mut used = ResourceSummary::new();
    for task in running {
        let t = task.lock();
        if t.is_function() {
            continue;
        }
        if let Some(alloc) = t.resources_allocated() {
            used.add(alloc);
        }
    }
    total.saturating_sub(&used)
}

/// Sin cores libres no entra nada que pida el worker entero.
fn has_room(alloc: &ResourceSummary, available: &ResourceSummary) -> bool {
    alloc.fits_within(available) && alloc.cores.map_or(true, |c| c > 0.0)
}

fn try_dispatch(
    state: &AppState,
    worker_id: &str,
    worker: &WorkerMeta,
    available: &ResourceSummary,
    candidate: &TaskRef,
) -> Result<Outcome, MasterError> {
    let (needs, requested, category) = {
        let t = candidate.lock();
        if t.state() != TaskState::Ready || t.task_type() == TaskType::LibraryTemplate {
            return Ok(Outcome::Skip);
        }
        if let Some(missing) = t.features().iter().find(|f| !worker.features.contains(*f)) {
            debug!(task_id = %t.id(), worker_id, feature = %missing, "worker sin feature");
            return Ok(Outcome::Skip);
        }
        if let Err(e) = t.check_fixed_locations(&worker.cached_files) {
            debug!(task_id = %t.id(), worker_id, "{}", e);
            return Ok(Outcome::Skip);
        }
        (
            t.needs_library().map(str::to_string),
            t.resources_requested().clone(),
            t.category().to_string(),
        )
    };

    let defaults = lock(&state.categories).defaults_for(&category);

    let Some(library) = needs else {
        let alloc = allocate(&requested, &defaults, available);
        if !has_room(&alloc, available) {
            return Ok(Outcome::Skip);
        }
        let dispatch = {
            let mut t = candidate.lock();
            start_attempt(&mut t, worker_id, worker, alloc)?
        };
        register_in_flight(state, candidate, worker_id);
        return Ok(Outcome::Candidate(dispatch));
    };

    let instances: Vec<TaskRef> = lock(&state.instances)
        .get(worker_id)
        .map(|v| {
            v.iter()
                .filter(|i| i.lock().provides_library() == Some(library.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    for inst in &instances {
        // instancia antes que función
        let inst_guard = inst.lock();
        let mut f = candidate.lock();
        match match_function(&mut f, &inst_guard) {
            Ok(()) => {
                drop(inst_guard);
                let alloc = requested.fill_from(&defaults);
                let dispatch = start_attempt(&mut f, worker_id, worker, alloc)?;
                drop(f);
                register_in_flight(state, candidate, worker_id);
                return Ok(Outcome::Candidate(dispatch));
            }
            Err(TaskError::NoFreeSlot { instance, total }) => {
                debug!(function = %f.id(), %instance, total, "instancia sin slots libres");
            }
            Err(e) => {
                debug!(function = %f.id(), instance = %inst.id(), "{}", e);
            }
        }
    }

    if !instances.is_empty() {
        return Ok(Outcome::Skip);
    }

    let template = lock(&state.templates).get(&library).cloned();
    match template {
        Some(template) => Ok(dispatch_instance(state, worker_id, worker, available, &template)?
            .map_or(Outcome::Skip, Outcome::Instance)),
        None => Ok(Outcome::Skip),
    }
}

fn dispatch_instance(
    state: &AppState,
    worker_id: &str,
    worker: &WorkerMeta,
    available: &ResourceSummary,
    template: &TaskRef,
) -> Result<Option<TaskDispatch>, MasterError> {
    let (requested, category) = {
        let t = template.lock();
        (t.resources_requested().clone(), t.category().to_string())
    };
    let defaults = lock(&state.categories).defaults_for(&category);
    let alloc = allocate(&requested, &defaults, available);
    if !has_room(&alloc, available) {
        return Ok(None);
    }

    let id = state.ids.next_id();
    let mut instance = {
        let t = template.lock();
        instantiate(&t, id, worker_id, worker.cores())?
    };
    instance.transition(TaskState::Ready)?;
    let dispatch = start_attempt(&mut instance, worker_id, worker, alloc)?;

    let instance = TaskRef::new(instance);
    lock(&state.tasks).insert(id, instance.add_ref());
    lock(&state.instances)
        .entry(worker_id.to_string())
        .or_default()
        .push(instance.add_ref());
    register_in_flight(state, &instance, worker_id);
    Ok(Some(dispatch))
}

/// READY -> RUNNING en `worker`. Si algo falla la tarea vuelve a quedar
/// libre en READY.
fn start_attempt(
    task: &mut Task,
    worker_id: &str,
    worker: &WorkerMeta,
    alloc: ResourceSummary,
) -> Result<TaskDispatch, TaskError> {
    let commit_start = Utc::now();
    let res = (|| {
        task.assign_worker(worker_id, worker.addrport.as_str(), worker.hostname.as_str())?;
        task.set_allocated(alloc)?;
        truncate_watched_outputs(task);
        task.transition(TaskState::Running)?;
        task.record_commit(commit_start, Utc::now())
    })();

    if let Err(e) = res {
        warn!(task_id = %task.id(), worker_id, "no se pudo despachar: {}", e);
        task.clean()?;
        return Err(e);
    }

    info!(
        task_id = %task.id(),
        task_type = task.task_type().as_str(),
        worker_id,
        library_task = ?task.library_task(),
        "tarea despachada"
    );
    Ok(task.to_dispatch())
}

/// Las salidas observadas se vacían antes de cada despacho para que lo que
/// se vea sea sólo de este intento.
pub fn truncate_watched_outputs(task: &Task) {
    for path in task.watched_outputs() {
        if let Err(e) = File::create(path) {
            warn!(task_id = %task.id(), path, "no se pudo truncar salida observada: {}", e);
        }
    }
}

fn register_in_flight(state: &AppState, task: &TaskRef, worker_id: &str) {
    lock(&state.in_flight).insert(
        task.id(),
        InFlight {
            task: task.add_ref(),
            worker_id: worker_id.to_string(),
            dispatched_at: SystemTime::now(),
            started: false,
        },
    );
    if let Some(meta) = lock(&state.workers).get_mut(worker_id) {
        meta.tasks_started += 1;
    }
}

/* ---------------- reportes del worker ---------------- */

pub fn mark_started(state: &AppState, req: &TaskStartedRequest) -> Result<(), MasterError> {
    let task = {
        let mut in_flight = lock(&state.in_flight);
        match in_flight.get_mut(&req.task_id) {
            Some(entry) if entry.worker_id == req.worker_id => {
                entry.started = true;
                entry.task.clone()
            }
            _ => return Err(MasterError::TaskNotFound(req.task_id)),
        }
    };
    task.lock().record_execution(Some(req.started_at), None)?;
    debug!(task_id = %req.task_id, worker_id = %req.worker_id, "tarea arrancó");
    Ok(())
}

/// Resultado de un intento según lo que reportó el worker.
pub fn classify(task: &Task, req: &TaskCompleteRequest) -> TaskResult {
    if !req.started {
        if req.missing_inputs.is_empty() {
            TaskResult::Forsaken
        } else {
            TaskResult::InputMissing
        }
    } else if req.timed_out {
        TaskResult::MaxWallTime
    } else if !task.exhausted_resources().is_empty() {
        TaskResult::ResourceExhaustion
    } else {
        TaskResult::from_exit(req.exit_code, req.signal)
    }
}

fn apply_report(task: &mut Task, req: &TaskCompleteRequest) -> Result<(), TaskError> {
    if let Some(measured) = &req.measured {
        task.set_resources(measured.clone());
    }
    if let Some(mb) = req.sandbox_mb {
        task.set_sandbox_measured(mb);
    }
    task.record_execution(req.execution_start, req.execution_end)?;
    task.record_transfer(req.bytes_sent, req.bytes_received);
    if let Some(code) = req.exit_code {
        task.set_exit_code(code)?;
    }
    if let Some(output) = &req.output {
        task.set_output(output.as_str())?;
    }
    Ok(())
}

pub fn complete(state: &AppState, req: &TaskCompleteRequest) -> Result<Disposition, MasterError> {
    let entry = {
        let mut in_flight = lock(&state.in_flight);
        match in_flight.get(&req.task_id) {
            Some(e) if e.worker_id == req.worker_id => {}
            _ => return Err(MasterError::TaskNotFound(req.task_id)),
        }
        in_flight.remove(&req.task_id)
    }
    .ok_or(MasterError::TaskNotFound(req.task_id))?;

    let elapsed_ms = entry
        .dispatched_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let is_instance = entry.task.lock().task_type() == TaskType::LibraryInstance;
    let disposition = if is_instance {
        fail_instance(state, &entry.task)?;
        Disposition::Final(TaskResult::LibraryExit)
    } else {
        let (disposition, category, measured) = {
            let mut t = entry.task.lock();
            apply_report(&mut t, req)?;
            // clean() lo borra si hay reintento
            let measured = t.resources_measured().cloned();
            let result = classify(&t, req);
            let mut disposition = t.set_result(result)?;
            if let Disposition::Final(_) = disposition {
                if !req.missing_outputs.is_empty() {
                    disposition = t.set_result(TaskResult::OutputMissing)?;
                }
                t.record_retrieval(Utc::now())?;
                t.transition(TaskState::Retrieved)?;
            }
            (disposition, t.category().to_string(), measured)
        };

        if let Some(measured) = measured {
            let mut stats = lock(&state.categories);
            stats.observe(&category, &measured);
            debug!(category = %category, completed = stats.completed(&category), "medición registrada");
        }

        match disposition {
            Disposition::Retry => lock(&state.ready).push_back(entry.task.clone()),
            Disposition::Final(_) => finish(state, entry.task.clone())?,
        }
        disposition
    };

    if let Some(meta) = lock(&state.workers).get_mut(&req.worker_id) {
        meta.total_task_time_ms += elapsed_ms;
        if disposition == Disposition::Final(TaskResult::Success) {
            meta.tasks_succeeded += 1;
        } else {
            meta.tasks_failed += 1;
        }
    }

    info!(
        task_id = %req.task_id,
        worker_id = %req.worker_id,
        ?disposition,
        elapsed_ms,
        "worker reportó fin de intento"
    );
    Ok(disposition)
}

/// Una tarea llegó a RETRIEVED. Las estándar esperan a `wait`; las internas
/// pasan a DONE y salen del índice.
fn finish(state: &AppState, task: TaskRef) -> Result<(), MasterError> {
    let visible = task.lock().task_type().is_user_visible();
    if visible {
        lock(&state.retrieved).push_back(task);
        state.retrieved_notify.notify_waiters();
        return Ok(());
    }

    task.lock().transition(TaskState::Done)?;
    lock(&state.tasks).remove(&task.id());
    debug!(task_id = %task.id(), "tarea interna descartada");
    Ok(())
}

/// La instancia de librería murió: sus funciones vuelven a READY sin contar
/// intento y la instancia se descarta.
pub fn fail_instance(state: &AppState, instance: &TaskRef) -> Result<usize, MasterError> {
    let instance_id = instance.id();
    lock(&state.in_flight).remove(&instance_id);

    let (library, worker) = {
        let t = instance.lock();
        (
            t.provides_library().map(str::to_string),
            t.bound_worker().map(str::to_string),
        )
    };
    let template = library
        .as_ref()
        .and_then(|name| lock(&state.templates).get(name).cloned())
        .ok_or_else(|| {
            TaskError::LibraryMismatch(format!(
                "no hay template instalado para la instancia {}",
                instance_id
            ))
        })?;

    let in_flight: Vec<TaskRef> = lock(&state.in_flight)
        .values()
        .map(|e| e.task.clone())
        .collect();
    let bound: Vec<TaskRef> = in_flight
        .into_iter()
        .filter(|t| t.lock().library_task() == Some(instance_id))
        .collect();

    let returned = {
        // template, instancia, funciones
        let mut tpl = template.lock();
        let mut inst = instance.lock();
        let mut functions: Vec<MutexGuard<'_, Task>> = bound.iter().map(|f| f.lock()).collect();
        let returned =
            fail_library_instance(&mut inst, &mut tpl, functions.iter_mut().map(|g| &mut **g))?;
        if inst.state() == TaskState::WaitingRetrieval {
            inst.transition(TaskState::Retrieved)?;
            inst.transition(TaskState::Done)?;
        }
        returned
    };

    {
        let mut in_flight = lock(&state.in_flight);
        for f in &bound {
            in_flight.remove(&f.id());
        }
    }
    if let Some(worker) = &worker {
        let mut cancelled = lock(&state.cancelled);
        let pending = cancelled.entry(worker.clone()).or_default();
        pending.extend(bound.iter().map(|f| f.id()));
    }
    {
        let mut ready = lock(&state.ready);
        for f in bound {
            ready.push_back(f);
        }
    }

    if let Some(worker) = &worker {
        if let Some(list) = lock(&state.instances).get_mut(worker) {
            list.retain(|i| !i.ptr_eq(instance));
        }
    }
    lock(&state.tasks).remove(&instance_id);

    warn!(
        instance = %instance_id,
        library = ?library,
        functions_returned = returned,
        "instancia de librería descartada"
    );
    Ok(returned)
}

/* ---------------- cancelación y entrega ---------------- */

pub fn cancel(state: &AppState, id: TaskId) -> Result<Disposition, MasterError> {
    let task = lock(&state.tasks)
        .get(&id)
        .cloned()
        .ok_or(MasterError::TaskNotFound(id))?;

    let (disposition, worker) = {
        let mut t = task.lock();
        if !t.task_type().is_user_visible() {
            return Err(TaskError::InvalidState {
                task_id: id,
                op: "cancel",
                state: t.state(),
            }
            .into());
        }
        let worker = t.worker().map(str::to_string);
        let disposition = t.cancel()?;
        if t.state() == TaskState::WaitingRetrieval {
            t.record_retrieval(Utc::now())?;
            t.transition(TaskState::Retrieved)?;
        }
        (disposition, worker)
    };

    lock(&state.ready).retain(|t| !t.ptr_eq(&task));
    if lock(&state.in_flight).remove(&id).is_some() {
        if let Some(worker) = worker {
            lock(&state.cancelled).entry(worker).or_default().push(id);
        }
    }
    finish(state, task)?;

    info!(task_id = %id, "tarea cancelada");
    Ok(disposition)
}

/// Cancelaciones pendientes para el worker (se vacían al leerlas).
pub fn take_cancelled(state: &AppState, worker_id: &str) -> Vec<TaskId> {
    lock(&state.cancelled).remove(worker_id).unwrap_or_default()
}

/// Entrega una tarea terminada (RETRIEVED -> DONE) y suelta la referencia
/// del manager. Espera hasta `timeout_secs` si no hay ninguna.
pub async fn wait(state: &AppState, req: &WaitRequest) -> Result<Option<TaskRecord>, MasterError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(req.timeout_secs);
    loop {
        let notified = state.retrieved_notify.notified();
        if let Some(record) = take_retrieved(state, req.tag.as_deref())? {
            return Ok(Some(record));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let _ = tokio::time::timeout(deadline - now, notified).await;
    }
}

fn take_retrieved(state: &AppState, tag: Option<&str>) -> Result<Option<TaskRecord>, MasterError> {
    let task = {
        let mut retrieved = lock(&state.retrieved);
        let pos = retrieved
            .iter()
            .position(|t| tag.map_or(true, |tag| t.lock().tag() == Some(tag)));
        match pos {
            Some(pos) => retrieved.remove(pos),
            None => None,
        }
    };
    let Some(task) = task else {
        return Ok(None);
    };

    let record = {
        let mut t = task.lock();
        t.transition(TaskState::Done)?;
        t.to_record()
    };

    lock(&state.tasks).remove(&record.task_id);
    if task.release().is_some() {
        debug!(task_id = %record.task_id, "tarea entregada y liberada");
    }
    Ok(Some(record))
}

/* ---------------- caída de workers ---------------- */

/// Todo lo que el worker tenía en vuelo vuelve a la política de reintentos:
/// `WorkerFailure` si había arrancado, `Forsaken` si no. Primero se descartan
/// sus instancias de librería (eso devuelve sus funciones a READY).
pub fn fail_worker(state: &AppState, worker_id: &str) -> usize {
    let instances = lock(&state.instances).remove(worker_id).unwrap_or_default();
    for instance in &instances {
        // la instancia ya no está en el mapa del worker; fail_instance la busca igual
        if let Err(e) = fail_instance(state, instance) {
            warn!(instance = %instance.id(), "error descartando instancia: {}", e);
        }
    }

    let entries: Vec<InFlight> = {
        let mut in_flight = lock(&state.in_flight);
        let ids: Vec<TaskId> = in_flight
            .iter()
            .filter(|(_, e)| e.worker_id == worker_id)
            .map(|(id, _)| *id)
            .collect();
        ids.iter().filter_map(|id| in_flight.remove(id)).collect()
    };

    let mut affected = 0;
    for entry in entries {
        let result = if entry.started {
            TaskResult::WorkerFailure
        } else {
            TaskResult::Forsaken
        };

        let disposition = {
            let mut t = entry.task.lock();
            match t.set_result(result) {
                Ok(Disposition::Final(r)) => {
                    if let Err(e) = t
                        .record_retrieval(Utc::now())
                        .and_then(|_| t.transition(TaskState::Retrieved))
                    {
                        warn!(task_id = %t.id(), "{}", e);
                    }
                    Disposition::Final(r)
                }
                Ok(d) => d,
                Err(e) => {
                    warn!(task_id = %t.id(), worker_id, "no se pudo registrar la caída: {}", e);
                    continue;
                }
            }
        };

        info!(task_id = %entry.task.id(), worker_id, %result, ?disposition, "intento perdido con el worker");
        match disposition {
            Disposition::Retry => lock(&state.ready).push_back(entry.task),
            Disposition::Final(_) => {
                if let Err(e) = finish(state, entry.task) {
                    warn!(worker_id, "{}", e);
                }
            }
        }
        affected += 1;
    }

    lock(&state.cancelled).remove(worker_id);
    affected + instances.len()
}
