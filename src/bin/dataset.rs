use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::dataset::{fetch_and_list, HubDatasetClient, DEFAULT_DATASET};

#[path = "../dataset.rs"]
mod dataset;

/// Download a dataset into the local cache and list its files
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identifier of the dataset repository
    #[arg(short, long, env, default_value = DEFAULT_DATASET)]
    dataset: String,

    /// Directory of the local hub cache
    #[arg(short, long, env = "HF_HUB_CACHE")]
    cache_dir: Option<PathBuf>,

    /// Access token for gated or private datasets
    #[arg(short, long, env = "HF_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("WARN")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = HubDatasetClient::new(args.cache_dir, args.token)?;
    fetch_and_list(&client, &args.dataset, &mut std::io::stdout().lock())?;
    Ok(())
}
