//! One-shot catalog seeding from a relay list file.

use std::{fs, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::nip11;
use crate::store::RelayRepository;

/// Seed the catalog from `path`, one relay URL per line.
///
/// Each URL's information document is fetched first so the seeded rows carry
/// metadata; URLs whose fetch fails are logged and skipped. Returns how many
/// relays were written.
pub async fn seed_relays(
    path: &str,
    repo: Arc<dyn RelayRepository>,
    timeout: Duration,
) -> Result<usize> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let urls: Vec<&str> = data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    info!(count = urls.len(), path, "seeding relays");

    let mut seeded = 0;
    for url in urls {
        let info = match nip11::fetch(url, timeout).await {
            Ok(info) => info,
            Err(e) => {
                warn!(url, error = %e, "skipping relay, nip11 fetch failed");
                continue;
            }
        };
        if let Err(e) = repo.create(&info.into_relay(url)).await {
            warn!(url, error = %e, "failed to insert relay");
            continue;
        }
        seeded += 1;
    }
    info!(seeded, "seeding finished");
    Ok(seeded)
}
