//! FileVault CLI: drives the upload orchestrator against the configured
//! database and storage backend.
//!
//! Configuration comes from the environment (or `.env`): DATABASE_URL,
//! STORAGE_TYPE and the matching backend settings.

use anyhow::Context;
use clap::{Parser, Subcommand};
use filevault_cli::{init_tracing, parse_part};
use filevault_core::Config;
use filevault_db::{setup_database, FileRepository, PgFileRepository};
use filevault_services::{FileService, MaxAgePolicy, ReconciliationService};
use filevault_storage::{create_storage, CompletedPart, Storage};
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "filevault", about = "File upload orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file through the service
    Upload {
        /// Path to the file to upload
        file: PathBuf,
        /// Stored name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
        /// Declared content type (advisory; the bytes are sniffed)
        #[arg(long, default_value = "")]
        content_type: String,
    },
    /// Start a presigned single-shot upload
    Presign {
        name: String,
        #[arg(long)]
        size: i64,
        #[arg(long, default_value = "")]
        content_type: String,
    },
    /// Confirm a presigned single-shot upload
    Confirm { id: Uuid },
    /// Start a presigned multipart upload
    MultipartInit {
        name: String,
        #[arg(long)]
        size: i64,
        #[arg(long, default_value = "")]
        content_type: String,
    },
    /// Presigned URL for one part of a multipart upload
    PartUrl { id: Uuid, part_number: i32 },
    /// Complete a multipart upload
    MultipartComplete {
        id: Uuid,
        /// Uploaded part as NUMBER:ETAG, repeated in ascending order
        #[arg(long = "part", value_parser = parse_part, required = true)]
        parts: Vec<CompletedPart>,
    },
    /// Presigned download URL for a completed file
    DownloadUrl {
        id: Uuid,
        /// Expiry in seconds (default 900)
        #[arg(long)]
        expires_in: Option<u64>,
    },
    /// Stream a completed file to a local path
    Download { id: Uuid, out: PathBuf },
    /// Get a single file record
    Get { id: Uuid },
    /// List files, newest first
    List {
        #[arg(long, default_value = "0")]
        offset: i64,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Delete a file and its object
    Delete { id: Uuid },
    /// Reap abandoned pending/uploading records
    Reconcile {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize response")?;
    println!("{}", out);
    Ok(())
}

async fn download_to(service: &FileService, id: Uuid, out: PathBuf) -> anyhow::Result<()> {
    let mut download = service.open_download(id).await?;
    let mut file = tokio::fs::File::create(&out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = download.body.next().await {
        let chunk = chunk.context("Failed to read object stream")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    print_json(&serde_json::json!({
        "file_id": id,
        "path": out,
        "bytes": written,
        "content_type": download.content_type,
        "content_disposition": download.content_disposition,
    }))
}

async fn reconcile(
    config: &Config,
    repo: Arc<dyn FileRepository>,
    storage: Arc<dyn Storage>,
    once: bool,
) -> anyhow::Result<()> {
    let policy = MaxAgePolicy::from_config(&config.reconcile);
    let service = ReconciliationService::new(repo, storage, Arc::new(policy))
        .with_interval(config.reconcile.interval)
        .with_batch_size(config.reconcile.batch_size);

    if once {
        let report = service.sweep_once().await?;
        return print_json(&report);
    }

    tracing::info!(
        interval_secs = config.reconcile.interval.as_secs(),
        "Reconciliation worker started"
    );
    let mut handle = Arc::new(service).start();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping reconciliation worker");
            handle.abort();
        }
        result = &mut handle => {
            result.context("Reconciliation worker stopped unexpectedly")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let pool = setup_database(&config).await?;
    let repo: Arc<dyn FileRepository> = Arc::new(PgFileRepository::new(pool));
    let storage = create_storage(&config)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(backend = %storage.backend_type(), "Storage backend ready");

    let service = FileService::new(repo.clone(), storage.clone())
        .with_verify_on_confirm(config.verify_on_confirm());

    match cli.command {
        Commands::Upload {
            file,
            name,
            content_type,
        } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("Upload path has no file name")?,
            };
            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let size = handle.metadata().await?.len() as i64;

            let record = service
                .upload(&name, &content_type, size, Box::pin(handle))
                .await?;
            print_json(&record)?;
        }
        Commands::Presign {
            name,
            size,
            content_type,
        } => {
            let result = service
                .init_presigned_upload(&name, &content_type, size)
                .await?;
            print_json(&result)?;
        }
        Commands::Confirm { id } => {
            let record = service.confirm_upload(id).await?;
            print_json(&record)?;
        }
        Commands::MultipartInit {
            name,
            size,
            content_type,
        } => {
            let result = service
                .init_multipart_upload(&name, &content_type, size)
                .await?;
            print_json(&result)?;
        }
        Commands::PartUrl { id, part_number } => {
            let result = service.part_upload_url(id, part_number).await?;
            print_json(&result)?;
        }
        Commands::MultipartComplete { id, parts } => {
            let record = service.complete_multipart_upload(id, &parts).await?;
            print_json(&record)?;
        }
        Commands::DownloadUrl { id, expires_in } => {
            let result = service
                .download_url(id, expires_in.map(Duration::from_secs))
                .await?;
            print_json(&result)?;
        }
        Commands::Download { id, out } => {
            download_to(&service, id, out).await?;
        }
        Commands::Get { id } => {
            let record = service.get_file(id).await?;
            print_json(&record)?;
        }
        Commands::List { offset, limit } => {
            let page = service.list_files(offset, limit).await?;
            print_json(&page)?;
        }
        Commands::Delete { id } => {
            service.delete_file(id).await?;
            print_json(&serde_json::json!({ "success": true, "message": format!("File {} deleted", id) }))?;
        }
        Commands::Reconcile { once } => {
            reconcile(&config, repo, storage, once).await?;
        }
    }

    Ok(())
}
