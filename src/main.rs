use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use tspy::config::{Config, ShutdownMode, expand_home};
use tspy::error::Error;
use tspy::job::{ControlRequest, Job, JobSpec};
use tspy::process::{KillOnly, ProcessController, SignalBackend, UnixSignals};
use tspy::store::{JobStore, LibSqlStore, RemoveOutcome, with_lock_retries};
use tspy::worker::Worker;

/// Task spooler: queue shell commands, run them from concurrent workers
/// with GPU/CPU slot reservation, priority, and pause/resume/kill.
#[derive(Parser)]
#[command(name = "tspy", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a command to the queue
    Add {
        /// The command to run (passed to `sh -c`)
        command: String,
        /// Job priority (higher runs first)
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// GPU index to reserve exclusively; omit to run on CPU
        #[arg(long)]
        gpu: Option<u32>,
        /// Working directory for the job
        #[arg(long)]
        cwd: Option<String>,
    },
    /// List jobs and their states
    Status {
        /// Emit the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a job's stdout
    Output { id: i64 },
    /// Print a job's stderr
    Error { id: i64 },
    /// Pause a running job
    Pause { id: i64 },
    /// Resume a paused job
    Resume { id: i64 },
    /// Kill a running or paused job
    Kill { id: i64 },
    /// Remove a job (and its log files)
    Remove {
        /// Job ID
        id: Option<i64>,
        /// Remove all jobs and logs
        #[arg(long, conflicts_with = "id")]
        all: bool,
        /// Force: skip confirmation and kill live jobs first
        #[arg(short, long)]
        force: bool,
    },
    /// Run a worker processing queued jobs until interrupted
    Worker {
        /// Number of concurrent jobs
        #[arg(short = 'j', long, default_value_t = 1)]
        jobs: usize,
        /// Restrict GPU jobs to these indices (repeatable)
        #[arg(long = "gpu")]
        gpus: Vec<u32>,
        /// Kill owned jobs on shutdown instead of waiting for them
        #[arg(long)]
        kill_on_exit: bool,
        /// Disable process suspension (pause requests will fail)
        #[arg(long)]
        no_suspend: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env();
    let store = LibSqlStore::open(&config).await?;

    match cli.command {
        Commands::Add {
            command,
            priority,
            gpu,
            cwd,
        } => {
            let mut spec = JobSpec::new(command).priority(priority);
            if let Some(gpu) = gpu {
                spec = spec.gpu(gpu);
            }
            if let Some(cwd) = cwd {
                spec = spec.cwd(expand_home(&cwd));
            }
            let job = with_lock_retries(config.lock_retries, || store.enqueue(spec.clone())).await?;
            let device = match job.gpu {
                Some(g) => format!("GPU {g}"),
                None => "CPU".to_string(),
            };
            println!("Job {} added (priority {}, {device}).", job.id, job.priority);
            println!("  Output log: {}", job.out_file.display());
            println!("  Error log:  {}", job.err_file.display());
        }

        Commands::Status { json } => {
            let jobs = with_lock_retries(config.lock_retries, || store.list()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_status_table(&jobs);
            }
        }

        Commands::Output { id } => {
            let job = with_lock_retries(config.lock_retries, || store.get(id)).await?;
            print_log(&job.out_file);
        }
        Commands::Error { id } => {
            let job = with_lock_retries(config.lock_retries, || store.get(id)).await?;
            print_log(&job.err_file);
        }

        Commands::Pause { id } => {
            request_control(&store, &config, id, ControlRequest::Pause).await?;
            println!("Pause requested for job {id}.");
        }
        Commands::Resume { id } => {
            request_control(&store, &config, id, ControlRequest::Resume).await?;
            println!("Resume requested for job {id}.");
        }
        Commands::Kill { id } => {
            request_control(&store, &config, id, ControlRequest::Kill).await?;
            println!("Kill requested for job {id}.");
        }

        Commands::Remove { id, all, force } => {
            if all {
                remove_all(&store, &config, force).await?;
            } else if let Some(id) = id {
                remove_one(&store, &config, id, force).await?;
                println!("Job {id} removed.");
            } else {
                anyhow::bail!("Specify a job ID or --all.");
            }
        }

        Commands::Worker {
            jobs,
            gpus,
            kill_on_exit,
            no_suspend,
        } => {
            let mut config = config;
            if kill_on_exit {
                config.shutdown_mode = ShutdownMode::Kill;
            }
            let backend: Arc<dyn SignalBackend> = if no_suspend {
                Arc::new(KillOnly::default())
            } else {
                Arc::new(UnixSignals)
            };
            let controller = ProcessController::new(backend, config.kill_grace);
            let gpu_filter = if gpus.is_empty() { None } else { Some(gpus) };

            let store: Arc<dyn JobStore> = Arc::new(store);
            let mut worker = Worker::new(store, controller, config, jobs, gpu_filter);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });

            worker.run(shutdown_rx).await?;
        }
    }

    Ok(())
}

async fn request_control(
    store: &LibSqlStore,
    config: &Config,
    id: i64,
    control: ControlRequest,
) -> anyhow::Result<()> {
    with_lock_retries(config.lock_retries, || store.request_control(id, control)).await?;
    Ok(())
}

/// Remove one job. A live job needs force, which relays a kill and waits
/// (bounded) for the owning worker before deleting the record anyway.
async fn remove_one(
    store: &LibSqlStore,
    config: &Config,
    id: i64,
    force: bool,
) -> anyhow::Result<()> {
    let removed = match with_lock_retries(config.lock_retries, || store.remove(id, force)).await? {
        RemoveOutcome::Removed(job) => job,
        RemoveOutcome::KillRequested(job) => {
            println!("Job {id} is {}; kill requested, waiting...", job.state);
            let deadline = tokio::time::Instant::now() + config.kill_grace + Duration::from_secs(5);
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                match store.get(id).await {
                    Ok(job) if !job.state.is_live() => break,
                    Ok(_) if tokio::time::Instant::now() >= deadline => {
                        // The owning worker may be dead; do not hang.
                        eprintln!("Worker did not act on the kill; removing the record anyway.");
                        break;
                    }
                    Ok(_) => continue,
                    Err(Error::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            with_lock_retries(config.lock_retries, || store.delete_unchecked(id)).await?
        }
    };
    unlink_logs(&removed);
    Ok(())
}

async fn remove_all(store: &LibSqlStore, config: &Config, force: bool) -> anyhow::Result<()> {
    if !force && !confirm("Remove ALL jobs and their logs? [y/N]: ")? {
        println!("Aborted.");
        return Ok(());
    }
    for job in with_lock_retries(config.lock_retries, || store.list()).await? {
        if let Err(e) = remove_one(store, config, job.id, true).await {
            eprintln!("Failed to remove job {}: {e}", job.id);
        }
    }
    println!("All jobs and their logs have been removed.");
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn unlink_logs(job: &Job) {
    for path in [&job.out_file, &job.err_file] {
        let _ = std::fs::remove_file(path);
    }
}

fn print_log(path: &std::path::Path) {
    match std::fs::read_to_string(path) {
        Ok(content) => print!("{content}"),
        Err(_) => println!("(No output yet)"),
    }
}

fn print_status_table(jobs: &[Job]) {
    println!(
        "{:<5} {:<10} {:<4} {:<4} {:<7} {:<5} {:<20} {:<20} {:<20} COMMAND",
        "ID", "STATE", "PRI", "RC", "PID", "GPU", "CREATED", "STARTED", "FINISHED"
    );
    for job in jobs {
        let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<5} {:<10} {:<4} {:<4} {:<7} {:<5} {:<20} {:<20} {:<20} {}",
            job.id,
            job.state.to_string(),
            job.priority,
            job.exit_code.map_or("-".to_string(), |c| c.to_string()),
            job.pid.map_or("-".to_string(), |p| p.to_string()),
            job.gpu.map_or("CPU".to_string(), |g| g.to_string()),
            fmt_time(Some(job.created_at)),
            fmt_time(job.started_at),
            fmt_time(job.finished_at),
            job.command,
        );
    }
}
