//
// cli.rs
// Dicom-Intake-rs
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the intake service, broker and server.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::{
    batch,
    config::Config,
    db::Database,
    preview,
    queue::{BrokerQueue, ConsumerSettings, QueueConsumer},
    seal::{self, Sealer},
    service::{self, BatchSubmission, FileSubmission, IntakeService},
    status::StatusService,
    storage::FileStore,
    web,
};

const WAIT_POLL: Duration = Duration::from_millis(250);

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "dicom-intake")]
#[command(about = "DICOM intake pipeline: validate, convert, anonymize and seal uploads", long_about = None)]
pub struct Cli {
    /// TOML configuration file; DICOM_INTAKE_* environment variables override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Consume jobs from the configured broker until ctrl-c
    Worker {
        /// Overrides broker.consumers
        #[arg(long)]
        consumers: Option<usize>,
    },
    /// Submit one or more files, each as its own upload
    Submit {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        owner: Option<String>,
        /// Block until every upload reaches a terminal status
        #[arg(long)]
        wait: bool,
    },
    /// Submit every file under a directory as one batch
    SubmitDir {
        directory: PathBuf,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        wait: bool,
    },
    /// Show persisted status of an upload or batch
    Status {
        #[command(subcommand)]
        target: StatusTarget,
    },
    /// Write the decrypted, hash-verified artifact of a completed upload
    Export {
        upload_id: String,
        #[arg(short, long)]
        output: PathBuf,
        /// Also render frame 0 as PNG
        #[arg(long)]
        png: Option<PathBuf>,
    },
    /// Delete finished broker rows older than broker.retention_secs
    Prune,
    /// Print a fresh AES-256 sealing key as hex
    Keygen,
}

#[derive(Subcommand)]
pub enum StatusTarget {
    Upload {
        id: String,
    },
    Batch {
        id: String,
        /// Include every member upload
        #[arg(long)]
        files: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            web::start_server(&config).await?
        }
        Commands::Worker { consumers } => {
            if let Some(consumers) = consumers {
                config.broker.consumers = consumers.max(1);
            }
            run_worker(config).await?
        }
        Commands::Submit { paths, owner, wait } => {
            tokio::task::spawn_blocking(move || submit_files(&config, &paths, owner, wait)).await??
        }
        Commands::SubmitDir {
            directory,
            owner,
            wait,
        } => {
            tokio::task::spawn_blocking(move || submit_directory(&config, &directory, owner, wait))
                .await??
        }
        Commands::Status { target } => show_status(&config, target)?,
        Commands::Export {
            upload_id,
            output,
            png,
        } => export(&config, &upload_id, &output, png.as_deref())?,
        Commands::Prune => {
            let queue = open_broker(&config)?;
            let removed = queue.prune_finished(Duration::from_secs(config.broker.retention_secs))?;
            println!("Pruned {} finished broker job(s)", removed);
        }
        Commands::Keygen => println!("{}", seal::generate_key_hex()),
    }

    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let queue = Arc::new(open_broker(&config)?);
    queue
        .probe()
        .with_context(|| format!("Broker at {} is unreachable", queue.path().display()))?;

    let db = Arc::new(Database::open(&config.storage.database).context("Failed to open intake database")?);
    let store = FileStore::new(&config.storage.artifact_root)?;
    let runner = Arc::new(service::build_runner(&config, db, store)?);
    let consumer = QueueConsumer::spawn(queue, runner, ConsumerSettings::from_config(&config.broker));

    // Returns on ctrl-c, or once a consumer stopped everything after a fatal error.
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                tracing::info!("shutdown requested, finishing current jobs");
                break;
            }
            _ = tokio::time::sleep(WAIT_POLL) => {
                if consumer.is_stopped() {
                    break;
                }
            }
        }
    }

    let fatal = consumer.is_stopped();
    consumer.stop();
    tokio::task::spawn_blocking(move || consumer.join()).await?;
    if fatal {
        bail!("Queue consumers stopped after a fatal pipeline error");
    }
    Ok(())
}

fn submit_files(
    config: &Config,
    paths: &[PathBuf],
    owner: Option<String>,
    wait: bool,
) -> anyhow::Result<()> {
    let service = IntakeService::from_config(config)?;
    let mut accepted = Vec::new();

    for path in paths {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        let submission = FileSubmission {
            filename,
            content_type: mime_guess::from_path(path).first_raw().map(str::to_string),
            bytes,
            owner_id: owner.clone(),
            origin: Some("cli".to_string()),
        };
        match service.submit(submission) {
            Ok(upload_id) => {
                println!("{} -> {}", path.display(), upload_id);
                accepted.push(upload_id);
            }
            // Rejections are persisted too; report and keep going.
            Err(err) => eprintln!("{}: {}", path.display(), err),
        }
    }

    if wait {
        for upload_id in &accepted {
            let view = loop {
                let view = service.get_upload_status(upload_id)?;
                if view.status.is_terminal() {
                    break view;
                }
                thread::sleep(WAIT_POLL);
            };
            print_json(&view)?;
        }
    }

    service.shutdown();
    Ok(())
}

fn submit_directory(
    config: &Config,
    directory: &Path,
    owner: Option<String>,
    wait: bool,
) -> anyhow::Result<()> {
    let files = batch::collect_directory(directory)?;
    if files.is_empty() {
        bail!("No files found under {}", directory.display());
    }

    let service = IntakeService::from_config(config)?;
    let batch_id = service.submit_batch(BatchSubmission {
        files,
        owner_id: owner,
        origin: Some("cli".to_string()),
    })?;
    println!("Batch {}", batch_id);

    if wait {
        let view = loop {
            let view = service.get_batch_status(&batch_id)?;
            if view.status.is_terminal() {
                break view;
            }
            tracing::debug!(
                processed = view.processed_count,
                total = view.total_count,
                "waiting for batch"
            );
            thread::sleep(WAIT_POLL);
        };
        print_json(&view)?;
    }

    service.shutdown();
    Ok(())
}

fn show_status(config: &Config, target: StatusTarget) -> anyhow::Result<()> {
    let status = open_status(config)?;
    match target {
        StatusTarget::Upload { id } => print_json(&status.upload(&id)?),
        StatusTarget::Batch { id, files } => {
            print_json(&status.batch(&id)?)?;
            if files {
                print_json(&status.batch_files(&id)?)?;
            }
            Ok(())
        }
    }
}

fn export(config: &Config, upload_id: &str, output: &Path, png: Option<&Path>) -> anyhow::Result<()> {
    let status = open_status(config)?;
    let sealer = Sealer::from_config(&config.sealing).context("Invalid sealing configuration")?;
    let part10 = status.unsealed_artifact(upload_id, &sealer)?;

    std::fs::write(output, &part10).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Artifact saved to: {:?}", output);

    if let Some(png) = png {
        let bytes = preview::first_frame_png(&part10)?;
        std::fs::write(png, bytes).with_context(|| format!("Failed to write {}", png.display()))?;
        println!("Preview saved to: {:?}", png);
    }
    Ok(())
}

fn open_status(config: &Config) -> anyhow::Result<StatusService> {
    let db = Database::open(&config.storage.database).context("Failed to open intake database")?;
    let store = FileStore::new(&config.storage.artifact_root)?;
    Ok(StatusService::new(Arc::new(db), store))
}

fn open_broker(config: &Config) -> anyhow::Result<BrokerQueue> {
    let url = config
        .broker
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("broker.url is not configured"))?;
    BrokerQueue::connect(url).with_context(|| format!("Failed to open broker {}", url))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
