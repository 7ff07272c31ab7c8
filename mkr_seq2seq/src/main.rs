use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::TrainDecoderConfig;

mod config;
mod training;

fn main() -> Result<()> {
    configure_logging()?;
    let config = TrainDecoderConfig::parse();
    info!(?config, "starting decoder training");

    let corpus = training::read_corpus(&config)?;
    let mut model = training::setup_model(&config, &corpus)?;
    let loss = training::train(&mut model, &corpus)?;
    info!(loss, "finished training");

    if let Some(path) = &config.output_path {
        model.save(path)?;
        info!(path, "saved model");
    }
    Ok(())
}

fn configure_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
