//! Print per-source aggregate statistics from a recency store as JSON,
//! one object per line.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use omnicomp::RecencyStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OMNICOMP_DB").ok())
        .context("usage: omnicomp-stats <db-path> (or set OMNICOMP_DB)")?
        .into();

    let store = RecencyStore::connect(&path)
        .await
        .with_context(|| format!("cannot open store at {}", path.display()))?;
    for stat in store.stats().await? {
        println!("{}", serde_json::to_string(&stat)?);
    }
    Ok(())
}
