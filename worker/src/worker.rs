use anyhow::{Context, Result};
use chrono::Utc;
use common::{
    FileObject, Mount, ResourceSummary, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, TaskDispatch, TaskId, TaskStartedRequest,
    TaskType, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::Client;
use serde::Serialize;
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const LIBRARY_WAIT_ROUNDS: u32 = 10;

/// Configuración del worker, desde variables de entorno.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub base_url: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub sandbox_dir: PathBuf,
    pub features: Vec<String>,
}

impl WorkerConfig {
    pub fn from_env(sys: &System) -> Result<Self> {
        let cores = match env::var("WORKER_CORES") {
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("WORKER_CORES inválido: {:?}", raw))?,
            Err(_) => sys.cpus().len() as u32,
        }
        .max(1);
        let features = env::var("WORKER_FEATURES")
            .map(|raw| parse_features(&raw))
            .unwrap_or_default();

        Ok(Self {
            base_url: env::var("MASTER_BASE_URL")
                .unwrap_or_else(|_| "http://master:8080".to_string()),
            cores,
            // sysinfo 0.29 reporta bytes
            memory_mb: sys.total_memory() / (1024 * 1024),
            sandbox_dir: env::var("WORKER_SANDBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data/tmp")),
            features,
        })
    }

    fn resources(&self) -> ResourceSummary {
        ResourceSummary::new()
            .with("cores", self.cores as f64)
            .with("memory", self.memory_mb as f64)
    }
}

fn parse_features(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Proceso de librería vivo en este worker.
#[derive(Debug, Clone)]
struct LibraryProcess {
    name: String,
    sandbox: PathBuf,
}

/// Lo que comparten el loop principal y las tareas en ejecución.
#[derive(Clone)]
struct Ctx {
    client: Client,
    base_url: String,
    worker_id: WorkerId,
    sandbox_dir: PathBuf,
    running: Arc<Mutex<HashMap<TaskId, AbortHandle>>>,
    libraries: Arc<Mutex<HashMap<TaskId, LibraryProcess>>>,
    // cache_name de archivos cacheados desde el último heartbeat
    new_cached: Arc<Mutex<Vec<String>>>,
}

impl Ctx {
    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;
        Ok(resp.error_for_status()?)
    }

    fn cache_dir(&self) -> PathBuf {
        self.sandbox_dir.join("cache")
    }

    fn task_sandbox(&self, id: TaskId) -> PathBuf {
        self.sandbox_dir.join(format!("t{}", id))
    }
}

/// Loop principal del worker.
/// - Se registra en el master con sus recursos.
/// - Hace heartbeats periódicos (y recibe cancelaciones).
/// - Pide tareas mientras tenga cores libres o librerías corriendo.
/// - Ejecuta cada intento en su propio sandbox.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker=debug,reqwest=info".into()),
        )
        .init();

    let mut sys = System::new_all();
    let config = WorkerConfig::from_env(&sys)?;
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    tokio::fs::create_dir_all(config.sandbox_dir.join("cache"))
        .await
        .with_context(|| format!("no se pudo crear {}", config.sandbox_dir.display()))?;

    // Registro de worker con su capacidad
    let register_url = format!("{}/api/v1/workers/register", config.base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            addrport: format!("{}:0", hostname),
            hostname,
            resources: config.resources(),
            features: config.features.clone(),
            cached_files: Vec::new(),
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado con cores={} memory={}MB contra {}",
        worker_id, config.cores, config.memory_mb, config.base_url
    );

    let ctx = Ctx {
        client,
        base_url: config.base_url.clone(),
        worker_id,
        sandbox_dir: config.sandbox_dir.clone(),
        running: Arc::new(Mutex::new(HashMap::new())),
        libraries: Arc::new(Mutex::new(HashMap::new())),
        new_cached: Arc::new(Mutex::new(Vec::new())),
    };

    // un permiso por core
    let sem = Arc::new(Semaphore::new(config.cores as usize));
    let mut last_heartbeat: Option<Instant> = None;

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        if last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL) {
            sys.refresh_cpu();
            sys.refresh_memory();
            heartbeat(
                &ctx,
                sys.global_cpu_info().cpu_usage(),
                sys.used_memory(),
            )
            .await;
            last_heartbeat = Some(Instant::now());
        }

        // --------- Control de concurrencia local ---------
        let has_libraries = !lock(&ctx.libraries).is_empty();
        if sem.available_permits() == 0 && !has_libraries {
            sleep(Duration::from_millis(500)).await;
            continue;
        }

        // Pedimos tarea al master
        let assignment: TaskAssignmentResponse = match ctx
            .post(
                "/api/v1/tasks/next",
                &TaskAssignmentRequest {
                    worker_id: ctx.worker_id.clone(),
                },
            )
            .await
        {
            Ok(res) => res.json().await?,
            Err(e) => {
                warn!("error pidiendo tarea al master: {:?}", e);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let Some(task) = assignment.task else {
            debug!("worker {} pidió tarea pero no hay", ctx.worker_id);
            sleep(Duration::from_secs(1)).await;
            continue;
        };

        info!(
            task_id = %task.task_id,
            task_type = task.task_type.as_str(),
            library_task = ?task.library_task,
            "tengo tarea: {}",
            task.command_line
        );

        // las funciones corren dentro de la asignación de su instancia
        let permit = if task.needs_library.is_some() {
            None
        } else {
            let n = permits_for(&task.allocated).min(config.cores);
            Some(sem.clone().acquire_many_owned(n).await?)
        };

        let task_id = task.task_id;
        let ctx_cloned = ctx.clone();
        // con el lock tomado la tarea no puede sacarse del mapa antes de entrar
        let mut running = lock(&ctx.running);
        let handle = tokio::spawn(async move {
            execute(ctx_cloned, task, permit).await;
        });
        running.insert(task_id, handle.abort_handle());
    }
}

fn permits_for(allocated: &ResourceSummary) -> u32 {
    allocated.cores.map(|c| c.ceil().max(1.0) as u32).unwrap_or(1)
}

async fn heartbeat(ctx: &Ctx, cpu_percent: f32, mem_bytes: u64) {
    let cached_files = std::mem::take(&mut *lock(&ctx.new_cached));
    let res = ctx
        .post(
            "/api/v1/workers/heartbeat",
            &WorkerHeartbeatRequest {
                worker_id: ctx.worker_id.clone(),
                cpu_percent: Some(cpu_percent),
                mem_bytes: Some(mem_bytes),
                cached_files: cached_files.clone(),
            },
        )
        .await;

    let resp: WorkerHeartbeatResponse = match res {
        Ok(r) => match r.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("respuesta de heartbeat inválida: {:?}", e);
                return;
            }
        },
        Err(e) => {
            warn!("error enviando heartbeat: {:?}", e);
            // se reintentan en el próximo heartbeat
            lock(&ctx.new_cached).extend(cached_files);
            return;
        }
    };

    for id in resp.cancelled {
        if let Some(handle) = lock(&ctx.running).remove(&id) {
            handle.abort();
            info!(task_id = %id, "tarea cancelada por el master");
        }
    }
}

/* ---------------- ejecución ---------------- */

async fn execute(ctx: Ctx, task: TaskDispatch, permit: Option<OwnedSemaphorePermit>) {
    let task_id = task.task_id;
    let mut report = TaskCompleteRequest {
        worker_id: ctx.worker_id.clone(),
        task_id,
        ..TaskCompleteRequest::default()
    };
    let res = match task.task_type {
        TaskType::LibraryInstance => run_library(&ctx, &task, &mut report).await,
        _ if task.needs_library.is_some() => run_function(&ctx, &task, &mut report).await,
        _ => run_command(&ctx, &task, &[], &mut report).await,
    };

    lock(&ctx.running).remove(&task_id);
    // el slot se libera antes de reportar para que el próximo pedido lo vea
    drop(permit);

    // report.started queda como estaba al fallar: si el proceso ya había
    // arrancado el master lo toma como falla del worker
    if let Err(e) = res {
        warn!(task_id = %task_id, started = report.started, "error ejecutando tarea: {:?}", e);
    }

    match ctx.post("/api/v1/tasks/complete", &report).await {
        Ok(res) => match res.json::<TaskCompleteResponse>().await {
            Ok(resp) => info!(task_id = %task_id, disposition = ?resp.disposition, "reporte enviado"),
            Err(e) => warn!(task_id = %task_id, "respuesta de complete inválida: {:?}", e),
        },
        Err(e) => warn!(task_id = %task_id, "error reportando tarea: {:?}", e),
    }
}

async fn report_started(ctx: &Ctx, task_id: TaskId) -> Result<()> {
    ctx.post(
        "/api/v1/tasks/started",
        &TaskStartedRequest {
            worker_id: ctx.worker_id.clone(),
            task_id,
            started_at: Utc::now(),
        },
    )
    .await?;
    Ok(())
}

/// Directorio de un intento. Se borra al soltarlo, también cuando la tarea
/// se aborta por una cancelación.
struct Sandbox {
    path: PathBuf,
}

impl Sandbox {
    async fn create(path: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("no se pudo crear {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!("no se pudo borrar {}: {:?}", self.path.display(), e);
        }
    }
}

/// Prepara el sandbox, corre `sh -c` y completa el reporte del intento.
async fn run_command(
    ctx: &Ctx,
    task: &TaskDispatch,
    extra_env: &[(String, String)],
    report: &mut TaskCompleteRequest,
) -> Result<()> {
    let sandbox = Sandbox::create(ctx.task_sandbox(task.task_id)).await?;

    let staged = stage_inputs(&ctx.client, &ctx.cache_dir(), sandbox.path(), &task.input_mounts).await;
    report.bytes_received = staged.bytes;
    lock(&ctx.new_cached).extend(staged.cached);
    if !staged.missing.is_empty() {
        warn!(task_id = %task.task_id, missing = ?staged.missing, "faltan entradas");
        report.missing_inputs = staged.missing;
        return Ok(());
    }

    report_started(ctx, task.task_id).await?;
    report.started = true;

    run_process(task, sandbox.path(), extra_env, report).await?;

    let collected = collect_outputs(sandbox.path(), &task.output_mounts).await;
    report.bytes_sent = collected.bytes;
    report.missing_outputs = collected.missing;
    Ok(())
}

/// Corre el comando de un intento ya arrancado y anota salida, código y
/// mediciones.
async fn run_process(
    task: &TaskDispatch,
    sandbox: &Path,
    extra_env: &[(String, String)],
    report: &mut TaskCompleteRequest,
) -> Result<()> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&task.command_line)
        .current_dir(sandbox)
        .envs(task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true);

    let start = Utc::now();
    let clock = Instant::now();
    let wall_time = task
        .allocated
        .wall_time
        .filter(|s| *s > 0.0)
        .map(Duration::from_secs_f64);

    report.execution_start = Some(start);
    let output = match wall_time {
        Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
            Ok(out) => Some(out?),
            Err(_) => None,
        },
        None => Some(cmd.output().await?),
    };
    let elapsed = clock.elapsed();
    report.execution_end = Some(Utc::now());

    match output {
        Some(out) => {
            let (code, signal) = exit_parts(out.status);
            report.exit_code = code;
            report.signal = signal;
            report.output = Some(String::from_utf8_lossy(&out.stdout).into_owned());
            if !out.stderr.is_empty() {
                debug!(task_id = %task.task_id, stderr = %String::from_utf8_lossy(&out.stderr), "stderr");
            }
        }
        None => {
            warn!(task_id = %task.task_id, ?wall_time, "tarea cortada por wall_time");
            report.timed_out = true;
        }
    }

    let sandbox_mb = dir_size(sandbox) as f64 / (1024.0 * 1024.0);
    report.sandbox_mb = Some(sandbox_mb);
    report.measured = Some(
        ResourceSummary::new()
            .with("wall_time", elapsed.as_secs_f64())
            .with("disk", sandbox_mb),
    );
    Ok(())
}

/// Las funciones corren con el sandbox de su instancia a mano.
async fn run_function(ctx: &Ctx, task: &TaskDispatch, report: &mut TaskCompleteRequest) -> Result<()> {
    // la instancia puede estar arrancando todavía
    let mut library = None;
    for _ in 0..LIBRARY_WAIT_ROUNDS {
        library = task
            .library_task
            .and_then(|id| lock(&ctx.libraries).get(&id).cloned());
        if library.is_some() {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    let Some(library) = library else {
        warn!(task_id = %task.task_id, library_task = ?task.library_task, "la instancia no corre en este worker");
        return Ok(());
    };

    let env = vec![
        ("LIBRARY_NAME".to_string(), library.name),
        (
            "LIBRARY_SANDBOX".to_string(),
            library.sandbox.to_string_lossy().into_owned(),
        ),
    ];
    run_command(ctx, task, &env, report).await
}

/// Levanta el proceso de la librería y lo mantiene vivo. Cuando termina se
/// reporta como cualquier intento; para el master eso es la caída de la
/// instancia.
async fn run_library(ctx: &Ctx, task: &TaskDispatch, report: &mut TaskCompleteRequest) -> Result<()> {
    let spec = task
        .library
        .clone()
        .context("instancia de librería sin especificación")?;
    let sandbox = Sandbox::create(ctx.task_sandbox(task.task_id)).await?;

    let staged = stage_inputs(&ctx.client, &ctx.cache_dir(), sandbox.path(), &task.input_mounts).await;
    lock(&ctx.new_cached).extend(staged.cached);
    if !staged.missing.is_empty() {
        report.missing_inputs = staged.missing;
        return Ok(());
    }

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&task.command_line)
        .current_dir(sandbox.path())
        .envs(task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("LIBRARY_NAME", &spec.name)
        .env("LIBRARY_EXEC_MODE", spec.exec_mode.as_str())
        .env(
            "LIBRARY_FUNCTION_SLOTS",
            task.function_slots.unwrap_or(1).to_string(),
        )
        .kill_on_drop(true)
        .spawn()?;

    lock(&ctx.libraries).insert(
        task.task_id,
        LibraryProcess {
            name: spec.name.clone(),
            sandbox: sandbox.path().to_path_buf(),
        },
    );
    info!(
        instance = %task.task_id,
        library = %spec.name,
        slots = ?task.function_slots,
        "librería levantada"
    );

    let started = report_started(ctx, task.task_id).await;
    report.started = true;
    report.execution_start = Some(Utc::now());

    let status = match started {
        Ok(()) => child.wait().await,
        Err(e) => {
            warn!(instance = %task.task_id, "no se pudo avisar el arranque: {:?}", e);
            let _ = child.kill().await;
            child.wait().await
        }
    };

    lock(&ctx.libraries).remove(&task.task_id);
    report.execution_end = Some(Utc::now());
    match status {
        Ok(status) => {
            let (code, signal) = exit_parts(status);
            report.exit_code = code;
            report.signal = signal;
        }
        Err(e) => warn!(instance = %task.task_id, "error esperando la librería: {:?}", e),
    }
    warn!(instance = %task.task_id, library = %spec.name, exit_code = ?report.exit_code, "librería terminó");
    Ok(())
}

#[cfg(unix)]
fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

/* ---------------- archivos ---------------- */

#[derive(Debug, Default)]
struct Staged {
    missing: Vec<String>,
    cached: Vec<String>,
    bytes: u64,
}

/// Nombre de archivo para el cache local del worker.
fn cache_file_name(cache_name: &str) -> String {
    cache_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Trae cada entrada a `sandbox/remote_name`. Lo que no se pudo traer va en
/// `missing` (por nombre remoto).
async fn stage_inputs(client: &Client, cache_dir: &Path, sandbox: &Path, mounts: &[Mount]) -> Staged {
    let mut staged = Staged::default();

    for m in mounts {
        let dest = sandbox.join(&m.remote_name);
        if let Some(parent) = dest.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let cached = cache_dir.join(cache_file_name(&m.file.cache_name()));
        if m.flags.cache && tokio::fs::metadata(&cached).await.is_ok() {
            match tokio::fs::copy(&cached, &dest).await {
                Ok(n) => {
                    debug!(remote_name = %m.remote_name, "entrada desde cache");
                    staged.bytes += n;
                    continue;
                }
                Err(e) => warn!("cache inválido para {}: {:?}", m.remote_name, e),
            }
        }

        let res = match &m.file {
            FileObject::LocalFile { path, .. } => tokio::fs::copy(path, &dest).await.map_err(anyhow::Error::from),
            FileObject::Buffer { data } => tokio::fs::write(&dest, data)
                .await
                .map(|_| data.len() as u64)
                .map_err(anyhow::Error::from),
            FileObject::Url { url } => fetch_url(client, url, &dest).await,
            FileObject::MiniTask {
                command_line,
                output_name,
            } => run_mini_task(sandbox, command_line, output_name, &dest).await,
        };

        match res {
            Ok(n) => {
                staged.bytes += n;
                if m.flags.cache && tokio::fs::copy(&dest, &cached).await.is_ok() {
                    staged.cached.push(m.file.cache_name());
                }
            }
            Err(e) => {
                warn!(remote_name = %m.remote_name, source = %m.file.source(), "no se pudo montar la entrada: {:?}", e);
                staged.missing.push(m.remote_name.clone());
            }
        }
    }
    staged
}

async fn fetch_url(client: &Client, url: &str, dest: &Path) -> Result<u64> {
    let bytes = client.get(url).send().await?.error_for_status()?.bytes().await?;
    tokio::fs::write(dest, &bytes).await?;
    Ok(bytes.len() as u64)
}

async fn run_mini_task(sandbox: &Path, command_line: &str, output_name: &str, dest: &Path) -> Result<u64> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(sandbox)
        .kill_on_drop(true)
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("mini-tarea terminó con {}", status);
    }
    let produced = sandbox.join(output_name);
    if produced != dest {
        tokio::fs::rename(&produced, dest).await?;
    }
    Ok(tokio::fs::metadata(dest).await?.len())
}

#[derive(Debug, Default)]
struct Collected {
    missing: Vec<String>,
    bytes: u64,
}

/// Copia cada salida del sandbox a su ruta local.
async fn collect_outputs(sandbox: &Path, mounts: &[Mount]) -> Collected {
    let mut collected = Collected::default();
    for m in mounts {
        let FileObject::LocalFile { path, .. } = &m.file else {
            collected.missing.push(m.remote_name.clone());
            continue;
        };
        let produced = sandbox.join(&m.remote_name);
        if let Some(parent) = Path::new(path).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match tokio::fs::copy(&produced, path).await {
            Ok(n) => collected.bytes += n,
            Err(e) => {
                debug!(remote_name = %m.remote_name, "salida faltante: {:?}", e);
                collected.missing.push(m.remote_name.clone());
            }
        }
    }
    collected
}

/// Tamaño en bytes de todo lo que hay bajo `dir`.
fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}
