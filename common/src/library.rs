//! Librerías y funciones.
//!
//! Un `LibraryTemplate` es sólo el plano (comando + slots pedidos + modo). Al
//! despacharlo a un worker se crea un `LibraryInstance` atado a ese worker,
//! con un número fijo de slots. Una tarea de función (`Standard` con
//! `needs_library`) sólo se despacha después de reservar un slot en una
//! instancia viva que provea esa librería.
//!
//! La reserva es un [`SlotLease`] guardado en la tarea de función: el slot se
//! devuelve cuando la tarea suelta el lease (resultado final, `clean`, `reset`).

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::results::TaskResult;
use crate::state::TaskState;
use crate::task::{Task, TaskId, TaskType};

/// Cómo ejecuta la librería cada llamada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Dentro del propio proceso de la librería
    #[default]
    Direct,
    /// Un fork por llamada
    Fork,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Direct => "direct",
            ExecMode::Fork => "fork",
        }
    }
}

impl FromStr for ExecMode {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExecMode::Direct),
            "fork" => Ok(ExecMode::Fork),
            other => Err(TaskError::InvalidExecMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySpec {
    pub name: String,
    /// -1 (o cualquier valor < 1): tantos slots como cores tenga el worker
    pub function_slots_requested: i32,
    #[serde(default)]
    pub exec_mode: ExecMode,
}

impl LibrarySpec {
    pub fn resolve_slots(&self, worker_cores: u32) -> u32 {
        if self.function_slots_requested > 0 {
            self.function_slots_requested as u32
        } else {
            worker_cores.max(1)
        }
    }
}

/// Contador de slots de una instancia. `inuse` nunca supera `total`.
#[derive(Debug)]
pub struct FunctionSlots {
    total: u32,
    inuse: AtomicU32,
}

impl FunctionSlots {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            inuse: AtomicU32::new(0),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn inuse(&self) -> u32 {
        self.inuse.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u32 {
        self.total.saturating_sub(self.inuse())
    }

    /// Chequeo de capacidad + incremento en un solo paso atómico.
    fn try_acquire(&self) -> bool {
        let mut current = self.inuse.load(Ordering::Acquire);
        loop {
            if current >= self.total {
                return false;
            }
            match self.inuse.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        let res = self
            .inuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if res.is_err() {
            warn!("se intentó liberar un slot de función con el contador ya en cero");
        }
    }
}

/// Slot reservado por una tarea de función. Se libera al soltarlo (drop).
pub struct SlotLease {
    instance: TaskId,
    slots: Arc<FunctionSlots>,
}

impl SlotLease {
    pub fn instance(&self) -> TaskId {
        self.instance
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.slots.release();
        debug!(
            instance = %self.instance,
            inuse = self.slots.inuse(),
            total = self.slots.total(),
            "slot de función liberado"
        );
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease")
            .field("instance", &self.instance)
            .finish()
    }
}

/// Parte de la tarea que depende de su papel en el mecanismo de librerías.
///
/// - `None`: tarea normal o de recuperación.
/// - `Needs`: tarea de función (`Standard`); `lease` presente mientras esté
///   emparejada con una instancia.
/// - `Template`: plano de librería; sólo acá vive `library_failed_count`.
/// - `Instance`: copia despachada, atada a un worker, con sus slots.
#[derive(Debug)]
pub enum LibraryRole {
    None,
    Needs {
        name: String,
        lease: Option<SlotLease>,
    },
    Template {
        spec: LibrarySpec,
        failed_count: u32,
    },
    Instance {
        spec: LibrarySpec,
        template: TaskId,
        worker: String,
        slots: Arc<FunctionSlots>,
    },
}

impl LibraryRole {
    pub fn needs_library(&self) -> Option<&str> {
        match self {
            LibraryRole::Needs { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn provides_library(&self) -> Option<&str> {
        match self {
            LibraryRole::Template { spec, .. } | LibraryRole::Instance { spec, .. } => {
                Some(&spec.name)
            }
            _ => None,
        }
    }

    pub fn spec(&self) -> Option<&LibrarySpec> {
        match self {
            LibraryRole::Template { spec, .. } | LibraryRole::Instance { spec, .. } => Some(spec),
            _ => None,
        }
    }

    /// Copia de la parte fija (lo que se define al enviar), sin estado de trabajo.
    pub(crate) fn fresh_copy(&self) -> LibraryRole {
        match self {
            LibraryRole::None => LibraryRole::None,
            LibraryRole::Needs { name, .. } => LibraryRole::Needs {
                name: name.clone(),
                lease: None,
            },
            LibraryRole::Template { spec, .. } => LibraryRole::Template {
                spec: spec.clone(),
                failed_count: 0,
            },
            LibraryRole::Instance {
                spec,
                template,
                worker,
                slots,
            } => LibraryRole::Instance {
                spec: spec.clone(),
                template: *template,
                worker: worker.clone(),
                slots: Arc::new(FunctionSlots::new(slots.total())),
            },
        }
    }

    /// Suelta el estado de trabajo en el lugar (lease, contadores de falla).
    pub(crate) fn clear_working_state(&mut self) {
        let fresh = self.fresh_copy();
        *self = fresh;
    }

    pub(crate) fn take_lease(&mut self) -> Option<SlotLease> {
        match self {
            LibraryRole::Needs { lease, .. } => lease.take(),
            _ => None,
        }
    }
}

/// Crea la instancia de `template` para `worker`.
///
/// Slots: los pedidos por el template, o los cores del worker si pidió < 1.
pub fn instantiate(
    template: &Task,
    id: TaskId,
    worker: &str,
    worker_cores: u32,
) -> Result<Task, TaskError> {
    let spec = match &template.library {
        LibraryRole::Template { spec, .. } => spec.clone(),
        _ => {
            return Err(TaskError::LibraryMismatch(format!(
                "la tarea {} no es un template de librería",
                template.id
            )))
        }
    };

    let total = spec.resolve_slots(worker_cores);
    let mut instance = template.copy_as(id, TaskType::LibraryInstance);
    instance.library = LibraryRole::Instance {
        spec,
        template: template.id,
        worker: worker.to_string(),
        slots: Arc::new(FunctionSlots::new(total)),
    };

    info!(
        template = %template.id,
        instance = %id,
        worker,
        slots = total,
        "instancia de librería creada"
    );
    Ok(instance)
}

/// Empareja una tarea de función con una instancia viva de su librería.
///
/// Sólo necesita acceso compartido a la instancia: la reserva del slot es
/// atómica, así que dos emparejamientos concurrentes nunca pasan del total.
pub fn match_function(function: &mut Task, instance: &Task) -> Result<(), TaskError> {
    if function.state != TaskState::Ready {
        return Err(function.invalid_state("match_function"));
    }

    let needed = match &function.library {
        LibraryRole::Needs { name, lease: None } => name.clone(),
        LibraryRole::Needs { lease: Some(l), .. } => {
            return Err(TaskError::LibraryMismatch(format!(
                "la función {} ya está emparejada con {}",
                function.id,
                l.instance()
            )))
        }
        _ => {
            return Err(TaskError::LibraryMismatch(format!(
                "la tarea {} no es una función",
                function.id
            )))
        }
    };

    let slots = match &instance.library {
        LibraryRole::Instance { spec, slots, .. } if spec.name == needed => slots.clone(),
        LibraryRole::Instance { spec, .. } => {
            return Err(TaskError::LibraryMismatch(format!(
                "la función {} necesita '{}' y la instancia {} provee '{}'",
                function.id, needed, instance.id, spec.name
            )))
        }
        _ => {
            return Err(TaskError::LibraryMismatch(format!(
                "la tarea {} no es una instancia de librería",
                instance.id
            )))
        }
    };

    if instance.state != TaskState::Running {
        return Err(instance.invalid_state("match_function"));
    }

    if !slots.try_acquire() {
        return Err(TaskError::NoFreeSlot {
            instance: instance.id,
            total: slots.total(),
        });
    }

    debug!(
        function = %function.id,
        instance = %instance.id,
        inuse = slots.inuse(),
        total = slots.total(),
        "función emparejada"
    );

    function.library = LibraryRole::Needs {
        name: needed,
        lease: Some(SlotLease {
            instance: instance.id,
            slots,
        }),
    };
    Ok(())
}

/// La instancia terminó de forma anormal.
///
/// Cada función de `bound` emparejada con esta instancia se desempareja y
/// vuelve a Ready (sin contar intento). Si la instancia seguía Running queda
/// con resultado `LibraryExit`. El `library_failed_count` del template sube en
/// uno: es sólo una señal para el scheduler. Devuelve cuántas funciones volvieron.
pub fn fail_library_instance<'a>(
    instance: &mut Task,
    template: &mut Task,
    bound: impl IntoIterator<Item = &'a mut Task>,
) -> Result<usize, TaskError> {
    let template_id = match &instance.library {
        LibraryRole::Instance { template, .. } => *template,
        _ => {
            return Err(TaskError::LibraryMismatch(format!(
                "la tarea {} no es una instancia de librería",
                instance.id
            )))
        }
    };

    if template.id != template_id || !matches!(template.library, LibraryRole::Template { .. }) {
        return Err(TaskError::LibraryMismatch(format!(
            "la instancia {} viene del template {}, no de {}",
            instance.id, template_id, template.id
        )));
    }

    let mut returned = 0;
    for function in bound {
        let bound_here = matches!(
            &function.library,
            LibraryRole::Needs { lease: Some(l), .. } if l.instance() == instance.id
        );
        if !bound_here {
            continue;
        }

        if function.state == TaskState::Ready {
            function.library.take_lease();
        } else {
            function.clean()?;
        }
        returned += 1;
    }

    if instance.state == TaskState::Running {
        instance.set_result(TaskResult::LibraryExit)?;
    }

    if let LibraryRole::Template { failed_count, .. } = &mut template.library {
        *failed_count += 1;
    }

    warn!(
        instance = %instance.id,
        template = %template.id,
        functions_returned = returned,
        "instancia de librería falló"
    );
    Ok(returned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceSummary;
    use crate::task::Task;

    fn template(slots: i32) -> Task {
        Task::library_template(TaskId(1), "python lib.py", "L", slots, ExecMode::Fork)
    }

    fn running_instance(tpl: &Task, cores: u32) -> Task {
        let mut inst = instantiate(tpl, TaskId(2), "w1", cores).unwrap();
        inst.transition(TaskState::Ready).unwrap();
        inst.assign_worker("w1", "10.0.0.1:9123", "nodo1").unwrap();
        inst.set_allocated(ResourceSummary::new().with("cores", cores as f64))
            .unwrap();
        inst.transition(TaskState::Running).unwrap();
        inst
    }

    fn ready_function(id: u64, lib: &str) -> Task {
        let mut f = Task::new(TaskId(id), "f(1)");
        f.set_library_required(lib).unwrap();
        f.transition(TaskState::Ready).unwrap();
        f
    }

    fn dispatch(f: &mut Task) {
        f.assign_worker("w1", "10.0.0.1:9123", "nodo1").unwrap();
        f.transition(TaskState::Running).unwrap();
    }

    #[test]
    fn exec_mode_from_str() {
        assert_eq!("fork".parse::<ExecMode>().unwrap(), ExecMode::Fork);
        assert_eq!(" Direct ".parse::<ExecMode>().unwrap(), ExecMode::Direct);
        assert!(matches!(
            "thread".parse::<ExecMode>(),
            Err(TaskError::InvalidExecMode(_))
        ));
    }

    #[test]
    fn slots_se_resuelven_por_cores_si_no_se_piden() {
        let tpl = template(-1);
        let inst = instantiate(&tpl, TaskId(2), "w1", 8).unwrap();
        assert_eq!(inst.task_type(), TaskType::LibraryInstance);
        assert_eq!(inst.function_slots_total(), Some(8));
        assert_eq!(inst.function_slots_inuse(), Some(0));
        assert_eq!(inst.provides_library(), Some("L"));
        assert_eq!(inst.needs_library(), None);

        let fixed = instantiate(&template(3), TaskId(3), "w1", 8).unwrap();
        assert_eq!(fixed.function_slots_total(), Some(3));
    }

    #[test]
    fn solo_templates_se_instancian() {
        let normal = Task::new(TaskId(9), "echo");
        assert!(matches!(
            instantiate(&normal, TaskId(10), "w1", 4),
            Err(TaskError::LibraryMismatch(_))
        ));
    }

    #[test]
    fn funcion_sin_instancia_no_puede_correr() {
        let mut f = ready_function(10, "L");
        f.assign_worker("w1", "10.0.0.1:9123", "nodo1").unwrap();
        let err = f.transition(TaskState::Running).unwrap_err();
        assert!(matches!(err, TaskError::LibraryMismatch(_)));
        assert_eq!(f.state(), TaskState::Ready);
    }

    #[test]
    fn match_incrementa_y_resultado_final_decrementa() {
        let tpl = template(2);
        let inst = running_instance(&tpl, 4);
        let mut f = ready_function(10, "L");

        match_function(&mut f, &inst).unwrap();
        assert_eq!(inst.function_slots_inuse(), Some(1));
        assert_eq!(f.library_task(), Some(TaskId(2)));

        dispatch(&mut f);
        f.set_exit_code(0).unwrap();
        f.set_result(TaskResult::Success).unwrap();

        assert_eq!(inst.function_slots_inuse(), Some(0));
        assert_eq!(f.library_task(), None);
    }

    #[test]
    fn fallo_reintentable_tambien_libera_el_slot() {
        let tpl = template(1);
        let inst = running_instance(&tpl, 4);
        let mut f = ready_function(10, "L");

        match_function(&mut f, &inst).unwrap();
        dispatch(&mut f);
        f.set_result(TaskResult::WorkerFailure).unwrap();

        assert_eq!(f.state(), TaskState::Ready);
        assert_eq!(inst.function_slots_inuse(), Some(0));
        // y se puede volver a emparejar
        match_function(&mut f, &inst).unwrap();
        assert_eq!(inst.function_slots_inuse(), Some(1));
    }

    #[test]
    fn no_se_pasa_del_total_de_slots() {
        let tpl = template(2);
        let inst = running_instance(&tpl, 4);
        let mut a = ready_function(10, "L");
        let mut b = ready_function(11, "L");
        let mut c = ready_function(12, "L");

        match_function(&mut a, &inst).unwrap();
        match_function(&mut b, &inst).unwrap();
        let err = match_function(&mut c, &inst).unwrap_err();
        assert_eq!(
            err,
            TaskError::NoFreeSlot {
                instance: TaskId(2),
                total: 2
            }
        );
        assert_eq!(inst.function_slots_inuse(), Some(2));
        assert_eq!(c.library_task(), None);
    }

    #[test]
    fn emparejamientos_concurrentes_respetan_la_capacidad() {
        let tpl = template(3);
        let inst = running_instance(&tpl, 4);
        let inst_ref = &inst;

        let matched: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16u64)
                .map(|i| {
                    s.spawn(move || {
                        let mut f = ready_function(100 + i, "L");
                        let ok = match_function(&mut f, inst_ref).is_ok();
                        // mantener la reserva viva hasta contar
                        (ok, f)
                    })
                })
                .collect();
            let results: Vec<(bool, Task)> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(inst_ref.function_slots_inuse(), Some(3));
            results.iter().filter(|(ok, _)| *ok).count()
        });

        assert_eq!(matched, 3);
        assert_eq!(inst.function_slots_inuse(), Some(0));
    }

    #[test]
    fn nombre_distinto_no_empareja() {
        let tpl = template(2);
        let inst = running_instance(&tpl, 4);
        let mut f = ready_function(10, "OTRA");
        assert!(matches!(
            match_function(&mut f, &inst),
            Err(TaskError::LibraryMismatch(_))
        ));
        assert_eq!(inst.function_slots_inuse(), Some(0));
    }

    #[test]
    fn instancia_que_no_corre_no_empareja() {
        let tpl = template(2);
        let mut inst = instantiate(&tpl, TaskId(2), "w1", 4).unwrap();
        inst.transition(TaskState::Ready).unwrap();
        let mut f = ready_function(10, "L");
        assert!(matches!(
            match_function(&mut f, &inst),
            Err(TaskError::InvalidState { .. })
        ));
    }

    #[test]
    fn falla_de_instancia_devuelve_funciones_a_ready() {
        let mut tpl = template(4);
        let mut inst = running_instance(&tpl, 4);
        let mut a = ready_function(10, "L");
        let mut b = ready_function(11, "L");
        let mut other = ready_function(12, "L");

        match_function(&mut a, &inst).unwrap();
        match_function(&mut b, &inst).unwrap();
        dispatch(&mut a);

        let returned =
            fail_library_instance(&mut inst, &mut tpl, [&mut a, &mut b, &mut other]).unwrap();

        assert_eq!(returned, 2);
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Ready);
        assert_eq!(a.library_task(), None);
        assert_eq!(b.library_task(), None);
        assert_eq!(a.try_count(), 0);
        assert_eq!(inst.function_slots_inuse(), Some(0));
        assert_eq!(inst.result(), TaskResult::LibraryExit);
        assert_eq!(inst.state(), TaskState::WaitingRetrieval);
        assert_eq!(tpl.library_failed_count(), Some(1));
    }

    #[test]
    fn falla_con_template_equivocado() {
        let tpl = template(4);
        let mut inst = running_instance(&tpl, 4);
        let mut otro = Task::library_template(TaskId(50), "x", "L", 1, ExecMode::Direct);
        let err = fail_library_instance(&mut inst, &mut otro, std::iter::empty()).unwrap_err();
        assert!(matches!(err, TaskError::LibraryMismatch(_)));
        assert_eq!(tpl.library_failed_count(), Some(0));
        assert_eq!(otro.library_failed_count(), Some(0));
        // la instancia sigue intacta
        assert_eq!(inst.state(), TaskState::Running);
    }
}
