use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use gearline::client::{Client, JobEvent, JobOutcome, SubmitRequest};
use gearline::config::{BrokerConfig, ClientOptions, OrphanPolicy, DEFAULT_PORT};
use gearline::scheduler::Priority;
use gearline::server::BrokerServer;
use gearline::shutdown::install_shutdown_handler;
use gearline::worker::{ShellExecutor, Worker};

#[derive(Parser, Debug)]
#[command(name = "gearline")]
#[command(version)]
#[command(about = "A job queue broker with priority scheduling and sleeping workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a broker
    Server(ServerArgs),

    /// Job commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run a worker that maps functions to shell commands
    Worker(WorkerArgs),

    /// Send a text administration command (status, workers, version, reap <handle>, shutdown)
    Admin {
        #[command(flatten)]
        client: ClientArgs,

        /// The command line to send
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Name embedded in job handles (defaults to $HOSTNAME)
    #[arg(long)]
    node_name: Option<String>,

    /// Directory for persisted background jobs
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// What to do with a job whose worker disconnects mid-job
    #[arg(long, value_enum, default_value = "leave-running")]
    orphan_policy: OrphanPolicy,

    /// Maximum number of live jobs
    #[arg(long)]
    max_jobs: Option<usize>,
}

// =============================================================================
// Client Arguments (shared by job and admin commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker address
    #[arg(long, short = 'a', default_value = "127.0.0.1:4730")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        /// Function name
        function: String,

        /// Payload (read from stdin when omitted)
        payload: Option<String>,

        /// Submit as a background job and print only the handle
        #[arg(long, short = 'b')]
        background: bool,

        /// low, normal or high
        #[arg(long, short = 'p', default_value = "normal")]
        priority: Priority,

        /// Client-supplied unique id
        #[arg(long, short = 'u', default_value = "")]
        unique: String,
    },
    /// Get status of a job by handle
    Status {
        /// The job handle, e.g. H:host:1
        handle: String,
    },
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Broker address
    #[arg(long, short = 'a', default_value = "127.0.0.1:4730")]
    addr: String,

    /// Function to serve, as name=command (repeatable)
    #[arg(long = "function", short = 'f', required = true, value_parser = parse_function)]
    functions: Vec<(String, String)>,
}

fn parse_function(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, command)) if !name.trim().is_empty() && !command.trim().is_empty() => {
            Ok((name.trim().to_string(), command.to_string()))
        }
        _ => Err(format!("expected name=command, got {:?}", s)),
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    handle: String,
    background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
}

#[derive(Serialize)]
struct JobStatusOutput {
    handle: String,
    known: bool,
    running: bool,
    numerator: u64,
    denominator: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn read_payload(payload: Option<String>) -> Result<Bytes, Box<dyn std::error::Error>> {
    match payload {
        Some(payload) => Ok(Bytes::from(payload)),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            Ok(Bytes::from(buf))
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut config = BrokerConfig::new(listen_addr).with_orphan_policy(args.orphan_policy);
    if let Some(node_name) = args.node_name {
        config = config.with_node_name(node_name);
    }
    if let Some(dir) = args.store_dir {
        config = config.with_store_dir(dir);
    }
    if let Some(max_jobs) = args.max_jobs {
        config.max_jobs = max_jobs;
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        node = %config.node_name,
        store_dir = ?config.store_dir,
        orphan_policy = ?config.orphan_policy,
        "Starting gearline broker"
    );

    let shutdown = install_shutdown_handler();
    let server = BrokerServer::bind(config).await?;
    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    args: &ClientArgs,
    request: SubmitRequest,
    background: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if background {
        let client = Client::connect_with(&args.addr, ClientOptions::default().close_when_idle()).await?;
        let handle = client.submit_background(request).await?;
        match args.output {
            OutputFormat::Json => {
                let output = JobSubmitOutput {
                    handle,
                    background: true,
                    outcome: None,
                    result: None,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Job submitted in the background");
                println!("Handle: {}", handle);
            }
        }
        return Ok(());
    }

    let client = Client::connect(&args.addr).await?;
    let mut job = client.submit(request).await?;
    let handle = job.handle().to_string();
    if matches!(args.output, OutputFormat::Table) {
        println!("Handle: {}", handle);
    }

    let mut outcome = None;
    while let Some(event) = job.next_event().await {
        if matches!(args.output, OutputFormat::Table) {
            match &event {
                JobEvent::Status {
                    numerator,
                    denominator,
                } => println!("Progress: {}/{}", numerator, denominator),
                JobEvent::Data(data) => println!("Data: {}", String::from_utf8_lossy(data)),
                JobEvent::Warning(data) => {
                    println!("Warning: {}", String::from_utf8_lossy(data))
                }
                _ => {}
            }
        }
        outcome = match event {
            JobEvent::Complete(data) => Some(JobOutcome::Complete(data)),
            JobEvent::Fail => Some(JobOutcome::Fail),
            JobEvent::Exception(data) => Some(JobOutcome::Exception(data)),
            _ => continue,
        };
        break;
    }

    let Some(outcome) = outcome else {
        eprintln!("Error: connection closed before the job finished");
        std::process::exit(1);
    };
    let result = match &outcome {
        JobOutcome::Complete(data) | JobOutcome::Exception(data) => {
            Some(String::from_utf8_lossy(data).into_owned())
        }
        JobOutcome::Fail => None,
    };

    match args.output {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                handle,
                background: false,
                outcome: Some(outcome.to_string()),
                result: result.clone(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Outcome: {}", outcome);
            if let Some(result) = &result {
                println!("Result:");
                for line in result.lines() {
                    println!("  {}", line);
                }
            }
        }
    }

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_job_status(
    args: &ClientArgs,
    handle: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect(&args.addr).await?;
    let status = client.get_status(&handle).await?;

    match args.output {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                handle,
                known: status.known,
                running: status.running,
                numerator: status.numerator,
                denominator: status.denominator,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Handle:   {}", handle);
            println!("Known:    {}", status.known);
            println!("Running:  {}", status.running);
            if status.denominator > 0 {
                println!("Progress: {}/{}", status.numerator, status.denominator);
            }
        }
    }
    Ok(())
}

async fn handle_admin(args: &ClientArgs, command: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let line = command.join(" ");
    let multi_line = matches!(command[0].to_ascii_lowercase().as_str(), "status" | "workers");

    let stream = TcpStream::connect(&args.addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(format!("{}\n", line).as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let mut reply = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if multi_line && line == "." {
            break;
        }
        let done = !multi_line;
        reply.push(line);
        if done {
            break;
        }
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reply)?),
        OutputFormat::Table => {
            for line in &reply {
                println!("{}", line);
            }
        }
    }
    if reply.first().is_some_and(|l| l.starts_with("ERR")) {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let executor = args
        .functions
        .into_iter()
        .fold(ShellExecutor::new(), |executor, (name, command)| {
            executor.with_command(name, command)
        });

    let worker = Worker::connect(&args.addr).await?;
    tracing::info!(
        addr = %args.addr,
        functions = ?executor.functions().collect::<Vec<_>>(),
        "Starting gearline worker"
    );

    let shutdown = install_shutdown_handler();
    executor.serve(&worker, shutdown).await?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => match command {
            JobCommands::Submit {
                function,
                payload,
                background,
                priority,
                unique,
            } => {
                let request = SubmitRequest::new(function, read_payload(payload).await?)
                    .with_priority(priority)
                    .with_unique_id(unique);
                handle_job_submit(&client, request, background).await?;
            }
            JobCommands::Status { handle } => {
                handle_job_status(&client, handle).await?;
            }
        },
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Admin { client, command } => {
            handle_admin(&client, command).await?;
        }
    }

    Ok(())
}
