use anyhow::Error;
use clap::Parser;

use imageq::config::{Command, ConfigContext, Settings};
use imageq::db::DbHandle;
use imageq::server::{self, ClientRequest, ServerContext, ServerMessage};
use imageq::storage::Storage;
use imageq::store::JobStore;
use imageq::submit::Upload;
use imageq::transcode::ImageTranscoder;
use imageq::{telemetry, ImageJob};
use serde_json::json;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

#[instrument(skip_all)]
async fn run(
    cancel_token: CancellationToken,
    settings: Settings,
    files: Vec<PathBuf>,
    size: Option<i64>,
) -> Result<(), Error> {
    let db = DbHandle::new(&settings.connect_url, settings.pool_max).await?;
    let storage = Storage::new(&settings.storage_root);
    let ctx = ServerContext {
        store: Arc::new(db.clone()),
        transcoder: Arc::new(ImageTranscoder::new(storage.clone(), settings.jpeg_quality)),
        storage,
        limits: settings.upload_limits(),
    };

    // Channel for sending requests to be processed
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    // Channel for getting responses from the server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) =
                    server::serve(cancel_token, ctx, recv_from_client, send_to_client).await
                {
                    error!("Error starting server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    for file in files {
        let upload = match size {
            Some(size) => Upload::new(file).with_size(size),
            None => Upload::new(file),
        };
        send_to_server.send(ClientRequest::Submit(upload))?;
    }

    debug!("Done submitting files");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Run Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(ServerMessage::Accepted(job)) => {
                        info!(job_id = %job.id, filename = ?job.original_filename, "Image accepted, processing continues in the background");
                    },
                    Some(msg) => {
                        info!(event = "Message", msg = ?msg);
                    },
                    None => {
                        debug!("Server connection closed, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for server to shutdown...");
    server_spawn.await?;
    db.close().await;

    Ok(())
}

fn job_json(job: &ImageJob) -> serde_json::Value {
    json!({
        "id": job.id,
        "filename": job.original_filename,
        "status": job.status,
        "target_dimension": job.target_dimension,
        "original_size_bytes": job.original_size_bytes,
        "processed_size_bytes": job.processed_size_bytes,
        "original_url": Storage::media_url(&job.original_path),
        "processed_url": job.processed_path.as_deref().map(Storage::media_url),
        "error": job.error,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}

fn print_json(value: &serde_json::Value) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn status(settings: &Settings, id: Uuid) -> Result<(), Error> {
    let db = DbHandle::new(&settings.connect_url, settings.pool_max).await?;
    let job = db.get_job(id).await?;
    db.close().await;
    match job {
        Some(job) => print_json(&job_json(&job)),
        None => anyhow::bail!("Job {} not found", id),
    }
}

async fn list(settings: &Settings, limit: i64) -> Result<(), Error> {
    let db = DbHandle::new(&settings.connect_url, settings.pool_max).await?;
    let jobs = db.list_jobs(limit).await?;
    db.close().await;
    print_json(&jobs.iter().map(job_json).collect::<serde_json::Value>())
}

async fn health(settings: &Settings) -> Result<(), Error> {
    let checked = match DbHandle::new(&settings.connect_url, settings.pool_max).await {
        Ok(db) => {
            let pinged = db.ping().await;
            db.close().await;
            pinged
        }
        Err(err) => Err(err),
    };
    match checked {
        Ok(()) => print_json(&json!({ "status": "ok" })),
        Err(err) => {
            print_json(&json!({ "status": "error", "error": err.to_string() }))?;
            anyhow::bail!("Health check failed")
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "imageq=debug");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.settings.jaeger_endpoint.as_deref())?;

    let result = match config.command {
        Command::Run { files, size } => {
            let token = CancellationToken::new();
            let app = tokio::spawn(run(token.clone(), config.settings, files, size));

            tokio::spawn(async move {
                let (mut sigterm, mut sigint) = match (
                    signal(SignalKind::terminate()),
                    signal(SignalKind::interrupt()),
                ) {
                    (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                    _ => {
                        error!("Failed to install signal handlers");
                        token.cancel();
                        return;
                    }
                };
                tokio::select! {
                    _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
                    _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
                }
            });
            app.await?
        }
        Command::Status { id } => status(&config.settings, id).await,
        Command::List { limit } => list(&config.settings, limit).await,
        Command::Health => health(&config.settings).await,
    };
    println!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
