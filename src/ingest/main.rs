use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use color_eyre::eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use kactus::config::Config;
use kactus::fetch::{FeedFetcher, FetchOutcome};
use kactus::{ChangeSet, PositionCache};

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

fn log_changes(changes: &ChangeSet) {
    info!(
        changed = changes.len(),
        stale = changes.stale,
        superseded = changes.superseded,
        rejected = changes.rejected.len(),
        "ingested feed"
    );
    for (vehicle_id, record) in changes.iter() {
        debug!(vehicle_id, timestamp = %record.timestamp(), "vehicle updated");
    }
}

/// Writes through a temporary file so readers never see a partial file.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

fn write_outputs(config: &Config, cache: &PositionCache) -> Result<()> {
    if let Some(path) = &config.json {
        let json = serde_json::to_vec_pretty(&cache.snapshot_view())?;
        write_atomically(path, &json)?;
        debug!(path = %path.display(), "wrote vehicle json");
    }
    if let Some(path) = &config.output {
        write_atomically(path, &cache.to_feed_bytes(false))?;
        debug!(path = %path.display(), "wrote feed");
    }
    Ok(())
}

/// In one-shot mode any failure is fatal; a continuous poller logs it and
/// tries again next round.
fn keep_going(result: Result<()>, once: bool) -> Result<()> {
    match result {
        Err(e) if !once => {
            error!(error = %e, "failed to write outputs");
            Ok(())
        }
        other => other,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let mut cache = PositionCache::new(config.stale_window).with_label(config.source.url.clone());
    let mut fetcher = FeedFetcher::new(config.source.clone())?;

    loop {
        let lastloop = Instant::now();

        match fetcher.poll().await {
            Ok(FetchOutcome::Updated(feed)) => match cache.ingest(feed.entities) {
                Ok(changes) => log_changes(&changes),
                Err(e) if config.once => return Err(e.into()),
                Err(e) => error!(error = %e, "feed rejected"),
            },
            Ok(outcome) => debug!(?outcome, "nothing new"),
            Err(e) if e.is_rate_limited() && !config.once => {
                warn!(backoff = ?RATE_LIMIT_BACKOFF, "rate limited by feed");
                tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                continue;
            }
            Err(e) if config.once => return Err(e.into()),
            Err(e) => warn!(error = %e, "poll failed"),
        }

        let purged = cache.purge_stale(None);
        if purged > 0 {
            info!(purged, "purged stale vehicles");
        }

        keep_going(write_outputs(&config, &cache), config.once)?;

        if config.once {
            info!(vehicles = cache.len(), "done");
            return Ok(());
        }

        let duration = lastloop.elapsed();
        if duration < config.interval {
            tokio::time::sleep(config.interval - duration).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kactus::config::ConfigArgs;

    fn config(dir: &Path, once: bool) -> Config {
        Config::try_from(ConfigArgs {
            feed: Some("https://example.org/vp.pb".to_string()),
            once,
            json: Some(dir.join("vehicles.json").display().to_string()),
            output: Some(dir.join("vehicles.pb").display().to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("kactus-ingest-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn writes_json_and_feed() {
        let dir = scratch_dir("ok");
        fs::create_dir_all(&dir).unwrap();
        let cache = PositionCache::new(chrono::Duration::minutes(60));

        write_outputs(&config(&dir, true), &cache).unwrap();

        assert_eq!(fs::read_to_string(dir.join("vehicles.json")).unwrap(), "[]");
        assert!(kactus::decode_feed(&fs::read(dir.join("vehicles.pb")).unwrap()).is_ok());
        assert!(!dir.join("vehicles.json.tmp").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn write_failures_only_stop_one_shot_runs() {
        let dir = scratch_dir("missing");
        let cache = PositionCache::new(chrono::Duration::minutes(60));

        let continuous = config(&dir, false);
        assert!(keep_going(write_outputs(&continuous, &cache), continuous.once).is_ok());

        let once = config(&dir, true);
        assert!(keep_going(write_outputs(&once, &cache), once.once).is_err());
    }
}
