use std::env;

use anyhow::{bail, Context, Result};
use reqwest::Url;

const DEFAULT_HEALTH_URL: &str = "http://127.0.0.1:5001/health";

/// Exits non-zero unless the service answers its health check with a success status.
fn main() -> Result<()> {
    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_HEALTH_URL.to_string());
    let url = Url::parse(&url).with_context(|| format!("Invalid URL {url}"))?;

    let response = reqwest::blocking::get(url.clone())?;
    if !response.status().is_success() {
        bail!("{url} answered with {}", response.status())
    }

    Ok(())
}
