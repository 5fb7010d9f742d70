//! skaldd: Skald check daemon.
//!
//! Reads one JSON request per line on stdin and writes one JSON response
//! per line on stdout, serving requests concurrently through the full
//! dispatcher stack with the built-in engine. Responses carry the request's
//! `id` and may arrive out of order.
//!
//! ```text
//! {"id": 1, "text": {"plain": "This is is bad."}, "language": "en", "caller": {"ip": "10.0.0.7"}}
//! {"id":1,"status":200,"body":{"language":"en","matches":[...],"cached":false}}
//! ```
//!
//! Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skald::config::{Config, Secrets};
use skald::{
    BasicEngine, Dispatcher, HandledResponse, PipelineKey, RequestContext, Skald, SkaldError,
};

/// Skald daemon: serves check requests over stdio.
#[derive(Parser)]
#[command(name = "skaldd")]
#[command(version)]
#[command(about = "Skald check daemon (JSON lines over stdio)")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter directive.
    #[arg(long, env = "SKALD_LOG", default_value = "info")]
    log: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: RequestContext,
}

#[derive(Serialize)]
struct Reply {
    id: Option<Value>,
    #[serde(flatten)]
    response: HandledResponse,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = Config::load_or_default(args.config.as_deref())?;
    let secrets = Secrets::load()?;

    let dispatcher = Arc::new(build_dispatcher(&config, &secrets)?);

    if !config.engine.prewarm.is_empty() {
        let keys: Vec<PipelineKey> = config.engine.prewarm.iter().map(PipelineKey::new).collect();
        dispatcher.pool().prewarm(&keys).await?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent = config.server.max_concurrent_requests,
        "skaldd starting"
    );

    let (tx, mut rx) = mpsc::channel::<String>(1024);
    let writer = tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let permits = Arc::new(Semaphore::new(config.server.max_concurrent_requests.max(1)));
    let mut inflight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let permit = Arc::clone(&permits).acquire_owned().await?;
        let dispatcher = Arc::clone(&dispatcher);
        let tx = tx.clone();
        inflight.spawn(async move {
            let reply = serve_line(&dispatcher, &line).await;
            drop(permit);
            match serde_json::to_string(&reply) {
                Ok(encoded) => {
                    // The writer only stops when stdout is gone.
                    let _ = tx.send(encoded).await;
                }
                Err(e) => warn!(error = %e, "failed to encode response"),
            }
        });
        while inflight.try_join_next().is_some() {}
    }

    while inflight.join_next().await.is_some() {}
    drop(tx);
    writer.await??;

    dispatcher.shutdown().await;
    info!("skaldd stopped");
    Ok(())
}

fn build_dispatcher(config: &Config, secrets: &Secrets) -> Result<Dispatcher, SkaldError> {
    let mut engine = BasicEngine::new();
    if !config.engine.languages.is_empty() {
        engine = engine.languages(config.engine.languages.iter().cloned());
    }
    config
        .configure(Skald::builder().engine(engine), secrets)
        .build()
}

async fn serve_line(dispatcher: &Dispatcher, line: &str) -> Reply {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => Reply {
            id: envelope.id,
            response: dispatcher.handle(envelope.request).await,
        },
        Err(e) => Reply {
            id: None,
            response: HandledResponse::from(&SkaldError::Json(e)),
        },
    }
}
