use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

mod cli;
mod config;
mod eid;
mod errors;
mod images;
mod lock;
mod menu;
mod oracle;
mod overview;
mod pipeline;
mod prompts;
mod retry;
mod reviews;
mod semantic;
mod storage;

use config::{Config, TextEmbedderKind};
use errors::{FailurePayload, PipelineError};
use oracle::HttpOracle;
use pipeline::{PipelineContext, PipelineContextBuilder};

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the json payload
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_context(args: &cli::Args) -> anyhow::Result<PipelineContext> {
    let base_path = match &args.base_path {
        Some(path) => path.clone(),
        None => pipeline::default_base_path()?,
    };
    let config = Config::load_with(&base_path)
        .with_context(|| format!("Failed to load config from {}", base_path.display()))?;

    let oracles = &config.oracles;
    let api_key = oracles
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok());
    let http = Arc::new(HttpOracle::new(
        &oracles.endpoint,
        Duration::from_secs(oracles.request_timeout_secs),
        api_key,
    )?);

    let mut builder = PipelineContextBuilder::new();
    if oracles.text_embedder == TextEmbedderKind::Local {
        #[cfg(feature = "local-embeddings")]
        {
            let embedder =
                semantic::LocalTextEmbedder::new(&oracles.local_model, base_path.clone())?;
            log::info!("using local text embedder {}", embedder.name());
            builder = builder.text_embedder(Arc::new(embedder));
        }
        #[cfg(not(feature = "local-embeddings"))]
        anyhow::bail!("oracles.text_embedder is local but menulens was built without local-embeddings");
    }

    builder.config(config).http(http).build()
}

fn main() -> ExitCode {
    init_logging();
    let args = cli::Args::parse();

    let result = build_context(&args)
        .map_err(PipelineError::from)
        .and_then(|ctx| cli::execute(&args.command, &ctx));

    match result {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            let payload = FailurePayload::from(&err);
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
            ExitCode::FAILURE
        }
    }
}
