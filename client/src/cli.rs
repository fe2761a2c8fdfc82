use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    CancelResponse, FileObject, LibraryInstallResponse, LibraryRequest, MountFlags, MountRequest,
    ResourceSummary, TaskRecord, TaskRequest, TaskSubmitResponse, WaitRequest, WaitResponse,
    WorkerMetrics,
};
use glob::glob;
use reqwest::Client;
use std::env;
use std::path::Path;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Envía una tarea (comando de shell)
    Submit {
        #[arg(value_name = "COMANDO")]
        command_line: String,

        /// Archivos de entrada (patrón glob); se montan con su nombre de archivo
        #[arg(long = "input", value_name = "PATRON")]
        inputs: Vec<String>,

        /// Entrada cacheada en el worker
        #[arg(long)]
        cache: bool,

        /// Salida: REMOTO=RUTA_LOCAL
        #[arg(long = "output", value_name = "REMOTO=LOCAL")]
        outputs: Vec<String>,

        /// Variable de entorno: NOMBRE=VALOR
        #[arg(long = "env", value_name = "NOMBRE=VALOR")]
        env: Vec<String>,

        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value_t = 0.0)]
        priority: f64,

        #[arg(long)]
        cores: Option<f64>,

        /// MB
        #[arg(long)]
        memory: Option<f64>,

        /// Segundos
        #[arg(long)]
        wall_time: Option<f64>,

        /// < 1: sin límite
        #[arg(long)]
        max_retries: Option<i32>,

        #[arg(long = "feature")]
        features: Vec<String>,

        /// Tarea de función de esta librería
        #[arg(long)]
        library: Option<String>,
    },
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: u64,
    },
    /// Espera la próxima tarea terminada y la retira del master
    Wait {
        #[arg(long)]
        tag: Option<String>,

        /// Segundos
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Cancela una tarea
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: u64,
    },
    /// Instala una librería de funciones
    Library {
        #[arg(value_name = "NOMBRE")]
        name: String,

        #[arg(value_name = "COMANDO")]
        command_line: String,

        /// < 1: tantos slots como cores del worker
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        slots: i32,

        /// direct | fork
        #[arg(long)]
        exec_mode: Option<String>,

        #[arg(long)]
        cores: Option<f64>,
    },
    /// Lista los workers registrados
    Workers,
}

/// NOMBRE=VALOR
fn parse_pair(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => bail!("se esperaba NOMBRE=VALOR y llegó {:?}", raw),
    }
}

fn resources(cores: Option<f64>, memory: Option<f64>, wall_time: Option<f64>) -> ResourceSummary {
    let mut r = ResourceSummary::new();
    if let Some(c) = cores {
        r.set("cores", c);
    }
    if let Some(m) = memory {
        r.set("memory", m);
    }
    if let Some(w) = wall_time {
        r.set("wall_time", w);
    }
    r
}

/// Expande cada patrón a archivos; cada uno se monta con su nombre de archivo.
fn expand_inputs(patterns: &[String], cache: bool) -> Result<Vec<MountRequest>> {
    let flags = if cache {
        MountFlags::cached()
    } else {
        MountFlags::default()
    };

    let mut out = Vec::new();
    for pattern in patterns {
        let mut matched = 0;
        for entry in glob(pattern).with_context(|| format!("patrón inválido: {}", pattern))? {
            let path = entry?;
            if !path.is_file() {
                continue;
            }
            let remote_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("archivo sin nombre")?;
            let size = std::fs::metadata(&path).ok().map(|m| m.len());
            out.push(MountRequest {
                file: FileObject::LocalFile {
                    path: absolute(&path),
                    size,
                },
                remote_name,
                flags,
            });
            matched += 1;
        }
        if matched == 0 {
            bail!("el patrón {} no coincide con ningún archivo", pattern);
        }
    }
    Ok(out)
}

fn absolute(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

fn expand_outputs(specs: &[String]) -> Result<Vec<MountRequest>> {
    specs
        .iter()
        .map(|raw| {
            let (remote_name, local) = parse_pair(raw)?;
            Ok(MountRequest {
                file: FileObject::local(local),
                remote_name,
                flags: MountFlags::default(),
            })
        })
        .collect()
}

fn print_task(t: &TaskRecord) {
    println!("Tarea {}:", t.task_id);
    println!("  tipo      : {:?}", t.task_type);
    println!("  estado    : {:?}", t.state);
    println!("  comando   : {}", t.command_line);
    if let Some(tag) = &t.tag {
        println!("  tag       : {}", tag);
    }
    println!("  categoría : {}", t.category);
    if let Some(lib) = &t.needs_library {
        println!("  librería  : {} (instancia {:?})", lib, t.library_task);
    }
    if let Some(w) = &t.worker {
        println!("  worker    : {}", w);
    }
    println!(
        "  intentos  : tries={} forsaken={} exhausted={}",
        t.try_count, t.forsaken_count, t.exhausted_attempts
    );
    println!("  resultado : {}", t.result);
    if let Some(code) = t.exit_code {
        println!("  exit_code : {}", code);
    }
    if let Some(output) = &t.output {
        println!("  salida    :");
        for line in output.lines() {
            println!("    {}", line);
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            command_line,
            inputs,
            cache,
            outputs,
            env,
            tag,
            category,
            priority,
            cores,
            memory,
            wall_time,
            max_retries,
            features,
            library,
        } => {
            let req = TaskRequest {
                command_line,
                tag,
                category,
                priority,
                max_retries,
                resources: resources(cores, memory, wall_time),
                inputs: expand_inputs(&inputs, cache)?,
                outputs: expand_outputs(&outputs)?,
                env: env
                    .iter()
                    .map(|raw| parse_pair(raw))
                    .collect::<Result<_>>()?,
                features,
                needs_library: library,
                ..TaskRequest::default()
            };

            let url = format!("{}/api/v1/tasks", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if resp.status().is_success() {
                let body: TaskSubmitResponse = resp.json().await?;
                println!("Tarea enviada: id={}", body.task_id);
            } else {
                println!("Error enviando tarea (status {}): {}", resp.status(), resp.text().await?);
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let t: TaskRecord = resp.json().await?;
                print_task(&t);
            } else {
                println!("Error: tarea no encontrada (status {})", resp.status());
            }
        }

        Commands::Wait { tag, timeout } => {
            let url = format!("{}/api/v1/tasks/wait", base_url);
            let resp = client
                .post(&url)
                .json(&WaitRequest {
                    tag,
                    timeout_secs: timeout,
                })
                .send()
                .await?;
            let body: WaitResponse = resp.error_for_status()?.json().await?;
            match body.task {
                Some(t) => print_task(&t),
                None => println!("Ninguna tarea terminó en {}s", timeout),
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{}/cancel", base_url, id);
            let resp = client.post(&url).send().await?;
            if resp.status().is_success() {
                let body: CancelResponse = resp.json().await?;
                println!("Tarea {} cancelada: {:?}", body.task_id, body.disposition);
            } else {
                println!("No se pudo cancelar (status {}): {}", resp.status(), resp.text().await?);
            }
        }

        Commands::Library {
            name,
            command_line,
            slots,
            exec_mode,
            cores,
        } => {
            let req = LibraryRequest {
                name,
                command_line,
                function_slots: slots,
                exec_mode,
                category: None,
                resources: resources(cores, None, None),
                env: Default::default(),
                features: Vec::new(),
            };
            let url = format!("{}/api/v1/libraries", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if resp.status().is_success() {
                let body: LibraryInstallResponse = resp.json().await?;
                println!("Librería {} instalada (template {})", body.name, body.template_id);
            } else {
                println!("Error instalando librería (status {}): {}", resp.status(), resp.text().await?);
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                } else {
                    for w in workers {
                        println!("Worker {}", w.worker_id);
                        println!("  host           : {} ({})", w.hostname, w.addrport);
                        println!("  dead           : {}", w.dead);
                        println!(
                            "  last_heartbeat : {} s ago",
                            w.last_heartbeat_secs_ago
                        );
                        println!("  recursos       : {:?}", w.resources.quantities());
                        if !w.features.is_empty() {
                            println!("  features       : {}", w.features.join(", "));
                        }
                        if !w.libraries.is_empty() {
                            println!("  librerías      : {}", w.libraries.join(", "));
                        }
                        println!(
                            "  tareas         : active={}, started={}, ok={}, failed={}",
                            w.active_tasks, w.tasks_started, w.tasks_succeeded, w.tasks_failed
                        );
                        if let Some(avg) = w.avg_task_ms {
                            println!("  avg_task_ms    : {:.1}", avg);
                        } else {
                            println!("  avg_task_ms    : (sin datos)");
                        }
                        if let Some(cpu) = w.last_cpu_percent {
                            println!("  cpu_percent    : {:.1}%", cpu);
                        } else {
                            println!("  cpu_percent    : (sin datos)");
                        }
                        if let Some(mem) = w.last_mem_bytes {
                            println!("  mem_bytes      : {}", mem);
                        } else {
                            println!("  mem_bytes      : (sin datos)");
                        }
                        println!();
                    }
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }
    }

    Ok(())
}
