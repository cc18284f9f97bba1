use clap::Parser;
use coder_bridge::api;
use coder_bridge::core::upstream::UpstreamEngine;
use coder_bridge::utils::config::{Args, ServerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    coder_bridge::utils::init_logging(&args.log_filter);

    let config = ServerConfig::from_args(&args);
    config.validate()?;

    if !config.tool_calling {
        tracing::warn!("Tool call extraction disabled, generated text is forwarded untouched");
    }

    let engine = Arc::new(UpstreamEngine::new(&config.upstream_url, &config.model_id)?);
    api::start_server(config, engine).await
}
