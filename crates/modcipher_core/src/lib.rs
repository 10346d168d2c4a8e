pub mod config;
pub mod fetch;
pub mod proxy;

use anyhow::Result;
use config::Config;
use fetch::{render, Fetcher};
use tracing::{error, info};

/// Logs the preference table, then fetches every URL in turn. A failed URL
/// is logged and skipped.
pub async fn run(config: Config) -> Result<()> {
    for entry in config.preferences.ranked() {
        info!(cipher_suite = %entry.suite, value = entry.score, "preference");
    }

    let fetcher = Fetcher::new(&config)?;
    for url in &config.urls {
        match fetcher.get(url).await {
            Ok(response) => println!("{}", render(&response.body)),
            Err(e) => error!(url = %url, "GET failed: {:#}", e),
        }
    }
    Ok(())
}
