use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::task::{Task, TaskId};

/// Referencia compartida a una tarea.
///
/// Cada clon es una referencia más (el handle del usuario, la cola de listos,
/// la tabla de intentos en vuelo...). La tarea se libera cuando se suelta la
/// última. El id se guarda afuera del mutex para poder indexar sin bloquear.
#[derive(Debug, Clone)]
pub struct TaskRef {
    id: TaskId,
    inner: Arc<Mutex<Task>>,
}

impl TaskRef {
    pub fn new(task: Task) -> Self {
        Self {
            id: task.id(),
            inner: Arc::new(Mutex::new(task)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Una referencia más a la misma tarea.
    pub fn add_ref(&self) -> TaskRef {
        self.clone()
    }

    /// Suelta esta referencia. Devuelve la tarea si era la última; en ese caso
    /// quien llama es el único dueño y decide qué hacer con ella.
    pub fn release(self) -> Option<Task> {
        Arc::into_inner(self.inner).map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Bloquea la tarea para leerla o mutarla. Un panic de otro dueño no la
    /// deja inutilizable: los métodos de `Task` validan su propio estado.
    pub fn lock(&self) -> MutexGuard<'_, Task> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakTaskRef {
        WeakTaskRef {
            id: self.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &TaskRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Referencia que no mantiene viva la tarea.
#[derive(Debug, Clone)]
pub struct WeakTaskRef {
    id: TaskId,
    inner: Weak<Mutex<Task>>,
}

impl WeakTaskRef {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn upgrade(&self) -> Option<TaskRef> {
        self.inner.upgrade().map(|inner| TaskRef { id: self.id, inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskState;

    #[test]
    fn se_libera_una_sola_vez_con_la_ultima_referencia() {
        let a = TaskRef::new(Task::new(TaskId(1), "echo"));
        let b = a.add_ref();
        let c = b.clone();
        assert_eq!(a.ref_count(), 3);

        assert!(b.release().is_none());
        assert!(a.release().is_none());
        assert_eq!(c.ref_count(), 1);

        let task = c.release().expect("última referencia");
        assert_eq!(task.id(), TaskId(1));
    }

    #[test]
    fn releases_concurrentes_entregan_la_tarea_una_vez() {
        let root = TaskRef::new(Task::new(TaskId(7), "x"));
        let refs: Vec<TaskRef> = (0..32).map(|_| root.add_ref()).collect();
        drop(root);

        let freed: usize = std::thread::scope(|s| {
            let handles: Vec<_> = refs
                .into_iter()
                .map(|r| s.spawn(move || r.release().is_some()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|freed| *freed)
                .count()
        });
        assert_eq!(freed, 1);
    }

    #[test]
    fn las_mutaciones_se_ven_desde_todas_las_referencias() {
        let a = TaskRef::new(Task::new(TaskId(1), "echo"));
        let b = a.add_ref();
        a.lock().transition(TaskState::Ready).unwrap();
        assert_eq!(b.lock().state(), TaskState::Ready);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn weak_no_mantiene_viva_la_tarea() {
        let a = TaskRef::new(Task::new(TaskId(1), "echo"));
        let w = a.downgrade();
        assert!(w.upgrade().is_some());
        drop(a);
        assert!(w.upgrade().is_none());
        assert_eq!(w.id(), TaskId(1));
    }
}
