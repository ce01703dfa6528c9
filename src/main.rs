use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use queuectl::config::{self, CONFIG_KEYS};
use queuectl::{
    Job, JobId, JobPayload, JobStatus, Queue, QueueOptions, RetryPolicy, RetryPolicyPatch,
    ShellExecutor, StepOutcome, WorkerBuilder, WorkerConfig, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Background job queue for shell commands", long_about = None)]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "QUEUECTL_REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    redis_url: String,

    /// Prefix for every key the queue writes
    #[arg(long, env = "QUEUECTL_PREFIX", default_value = "queuectl", global = true)]
    prefix: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a job to the queue
    Enqueue(EnqueueArgs),

    /// List jobs, optionally filtered by state
    List {
        /// pending, processing, completed, failed or dead
        #[arg(short, long)]
        state: Option<JobStatus>,
    },

    /// Job counts per state and active workers
    Status,

    /// Start, stop or resume workers
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Inspect or requeue dead-lettered jobs
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Show or change the retry defaults for new jobs
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct EnqueueArgs {
    /// Shell command to run
    #[arg(required_unless_present = "payload", conflicts_with = "payload")]
    command: Option<String>,

    /// Full job payload as JSON, e.g. '{"command": "echo hi"}'
    #[arg(long)]
    payload: Option<String>,

    /// Kill the command after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Seconds
    #[arg(long)]
    backoff_base: Option<u64>,

    #[arg(long)]
    backoff_factor: Option<u32>,

    /// Extra data stored with the job, as key=value (repeatable)
    #[arg(long = "data", value_parser = parse_key_val)]
    data: Vec<(String, String)>,
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
    /// Run workers in the foreground until stopped
    Start {
        /// Number of workers
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Process at most one job, then exit
        #[arg(long)]
        once: bool,

        /// Seconds a worker waits for a job before re-checking the stop signal
        #[arg(long, default_value = "1")]
        poll_timeout: u64,

        /// Return jobs stuck in processing for this many seconds to the queue
        #[arg(long)]
        reclaim_after: Option<u64>,
    },

    /// Ask all workers to exit after their current job
    Stop,

    /// Clear a previous stop request
    Resume,
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    /// List dead jobs, oldest first
    List,

    /// Requeue a dead job with a fresh retry budget
    Retry { id: JobId },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the effective retry defaults
    Show,

    /// Set one of max_retries, backoff_base, backoff_factor
    Set { key: String, value: String },

    /// Restore the built-in defaults
    Reset,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=value: no '=' in '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=value: empty key in '{}'", s));
    }
    if key == "command" || key == "timeout" {
        return Err(format!("'{}' cannot be set through --data", key));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so tables on stdout stay clean.
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let options = QueueOptions::new(&cli.redis_url).with_key_prefix(&cli.prefix);
    let queue = Queue::connect(&options)
        .await
        .with_context(|| format!("failed to connect to {}", cli.redis_url))?;

    match cli.command {
        Commands::Enqueue(args) => enqueue(&queue, args).await?,
        Commands::List { state } => {
            let jobs = queue.list_jobs(state).await?;
            if jobs.is_empty() {
                match state {
                    Some(state) => println!("No {} jobs.", state),
                    None => println!("No jobs."),
                }
            } else {
                println!("{}", jobs_table(&jobs));
            }
        }
        Commands::Status => status(&queue).await?,
        Commands::Worker(command) => worker(&queue, command).await?,
        Commands::Dlq(DlqCommand::List) => {
            let jobs = queue.dead_letters().await?;
            if jobs.is_empty() {
                println!("Dead-letter queue is empty.");
            } else {
                println!("{}", dead_table(&jobs));
            }
        }
        Commands::Dlq(DlqCommand::Retry { id }) => {
            queue
                .retry_dead(&id)
                .await
                .with_context(|| format!("cannot retry job {}", id))?;
            println!("Job {} moved back to the queue.", id);
        }
        Commands::Config(ConfigCommand::Show) => {
            print_policy(&queue.retry_defaults().await?);
        }
        Commands::Config(ConfigCommand::Set { key, value }) => {
            let patch = config::patch_from_pair(&key, &value)?;
            let policy = queue.update_config(patch).await?;
            println!("Updated {}.", key);
            print_policy(&policy);
        }
        Commands::Config(ConfigCommand::Reset) => {
            let policy = queue.reset_config().await?;
            println!("Configuration reset to defaults.");
            print_policy(&policy);
        }
    }

    Ok(())
}

async fn enqueue(queue: &Queue, args: EnqueueArgs) -> anyhow::Result<()> {
    let mut payload = match (args.payload, args.command) {
        (Some(raw), _) => {
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("--payload is not valid JSON")?;
            JobPayload::from_value(value)?
        }
        (None, Some(command)) => JobPayload::new(command),
        (None, None) => bail!("a command or --payload is required"),
    };
    if let Some(timeout) = args.timeout {
        payload.timeout = Some(timeout);
    }
    for (key, value) in args.data {
        // Numbers and booleans keep their type; anything else is a string.
        let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
        payload.data.insert(key, value);
    }

    let overrides = RetryPolicyPatch {
        max_retries: args.max_retries,
        backoff_base: args.backoff_base,
        backoff_factor: args.backoff_factor,
    };
    let id = queue.enqueue_with_options(payload, overrides).await?;
    println!("Enqueued job {}", id);
    Ok(())
}

async fn status(queue: &Queue) -> anyhow::Result<()> {
    let stats = queue.get_stats().await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["State", "Jobs"]);
    for status in JobStatus::ALL {
        table.add_row(vec![status.to_string(), stats.count(status).to_string()]);
    }
    table.add_row(vec!["total".to_string(), stats.total().to_string()]);
    println!("{table}");
    println!(
        "Ready: {}  Awaiting retry: {}  Dead-lettered: {}",
        stats.ready, stats.delayed, stats.dead_letters
    );

    let workers = queue.workers().await?;
    if workers.is_empty() {
        println!("No active workers.");
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Worker", "Status", "Current job", "Updated"]);
        for worker in workers {
            table.add_row(vec![
                worker.name.clone(),
                worker.status.to_string(),
                worker.current_job_label(),
                worker.updated_at.to_rfc3339(),
            ]);
        }
        println!("{table}");
    }

    if queue.stop_requested().await? {
        println!("Stop requested: workers exit after their current job.");
    }
    Ok(())
}

async fn worker(queue: &Queue, command: WorkerCommand) -> anyhow::Result<()> {
    match command {
        WorkerCommand::Start {
            count,
            once,
            poll_timeout,
            reclaim_after,
        } => {
            let config = WorkerConfig {
                poll_timeout: Duration::from_secs(poll_timeout.max(1)),
                reclaim_after: reclaim_after.map(Duration::from_secs),
                ..WorkerConfig::default()
            };
            let executor = Arc::new(ShellExecutor::new());

            if once {
                let mut worker = WorkerBuilder::new(queue.clone(), executor)
                    .with_config(config)
                    .build();
                match worker.run_once().await? {
                    StepOutcome::Processed { id, status } => println!("Job {} is now {}.", id, status),
                    StepOutcome::Dropped(id) | StepOutcome::Lost(id) => {
                        println!("Job {} was handled by another worker.", id)
                    }
                    StepOutcome::Idle => println!("No job was ready."),
                    StepOutcome::Stopped => println!("Workers are stopped; run `queuectl worker resume`."),
                }
            } else {
                let summary = WorkerPool::new(queue.clone(), executor, count)
                    .with_config(config)
                    .with_signal_handling(true)
                    .run()
                    .await?;
                println!(
                    "{} worker(s) stopped after processing {} job(s).",
                    summary.workers, summary.processed
                );
            }
        }
        WorkerCommand::Stop => {
            queue.request_stop().await?;
            println!("Stop requested. Workers will exit after their current job.");
        }
        WorkerCommand::Resume => {
            queue.resume().await?;
            println!("Stop request cleared.");
        }
    }
    Ok(())
}

fn jobs_table(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "State", "Attempts", "Command", "Created", "Last error"]);
    for job in jobs {
        table.add_row(vec![
            job.id.to_string(),
            job.status.to_string(),
            format!("{}/{}", job.attempts, job.policy.max_retries),
            job.command().to_string(),
            job.created_at.to_rfc3339(),
            job.last_error.clone().unwrap_or_default(),
        ]);
    }
    table
}

fn dead_table(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Command", "Attempts", "Failed at", "Reason"]);
    for job in jobs {
        table.add_row(vec![
            job.id.to_string(),
            job.command().to_string(),
            job.attempts.to_string(),
            job.failed_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
            job.reason.clone().unwrap_or_default(),
        ]);
    }
    table
}

fn print_policy(policy: &RetryPolicy) {
    let values = [
        policy.max_retries.to_string(),
        policy.backoff_base.to_string(),
        policy.backoff_factor.to_string(),
    ];
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Key", "Value"]);
    for (key, value) in CONFIG_KEYS.iter().zip(values) {
        table.add_row(vec![key.to_string(), value]);
    }
    println!("{table}");
}
