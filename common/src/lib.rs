//! Tipos compartidos entre master, worker y cliente: la entidad `Task` con su
//! ciclo de vida, la política de reintentos, librerías y el protocolo HTTP.

pub mod error;
pub mod handle;
pub mod library;
pub mod metrics;
pub mod mount;
pub mod policy;
pub mod record;
pub mod resources;
pub mod results;
pub mod state;
pub mod submit;
pub mod task;
pub mod worker;

pub use error::TaskError;
pub use handle::{TaskRef, WeakTaskRef};
pub use library::{
    fail_library_instance, instantiate, match_function, ExecMode, LibraryRole, LibrarySpec,
};
pub use metrics::TaskMetrics;
pub use mount::{FileObject, Mount, MountFlags, MountSide};
pub use policy::Disposition;
pub use record::{MountRecord, TaskRecord};
pub use resources::{allocate, ResourceEstimator, ResourceSummary};
pub use results::TaskResult;
pub use state::TaskState;
pub use submit::{
    CancelResponse, LibraryInstallResponse, LibraryRequest, MountRequest, SubmitDefaults,
    TaskRequest, TaskSubmitResponse, WaitRequest, WaitResponse,
};
pub use task::{Task, TaskId, TaskIdAllocator, TaskType, WorkerSelection};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    TaskDispatch, TaskStartedRequest, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerId, WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
