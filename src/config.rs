use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fetch::{FeedAuth, FeedSource, URL_KEY_PLACEHOLDER};

pub const DEFAULT_STALE_MINUTES: u64 = 60;
pub const DEFAULT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Command line options as given, before validation.
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub feed: Option<String>,
    pub stale_minutes: Option<u64>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub bind: Option<String>,
    pub auth_type: Option<String>,
    pub auth_header: Option<String>,
    pub auth_keys: Option<String>,
    pub agencies: Option<String>,
    pub routes: Option<String>,
    pub once: bool,
    pub json: Option<String>,
    pub output: Option<String>,
}

impl ConfigArgs {
    pub fn from_arguments(arguments: &arguments::Arguments) -> Self {
        Self {
            feed: arguments.get::<String>("feed"),
            stale_minutes: arguments.get::<u64>("stale-minutes"),
            interval: arguments.get::<u64>("interval"),
            timeout: arguments.get::<u64>("timeout"),
            bind: arguments.get::<String>("bind"),
            auth_type: arguments.get::<String>("auth-type"),
            auth_header: arguments.get::<String>("auth-header"),
            auth_keys: arguments.get::<String>("auth-keys"),
            agencies: arguments.get::<String>("agencies"),
            routes: arguments.get::<String>("routes"),
            once: arguments.get::<bool>("once").unwrap_or(false),
            json: arguments.get::<String>("json"),
            output: arguments.get::<String>("output"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: FeedSource,
    pub stale_window: chrono::Duration,
    pub interval: Duration,
    pub bind: String,
    pub agencies: Option<PathBuf>,
    pub routes: Option<PathBuf>,
    pub once: bool,
    pub json: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Config {
    /// Reads and validates the process arguments.
    pub fn from_env() -> Result<Self> {
        let arguments = arguments::parse(std::env::args())
            .map_err(|e| Error::Config(format!("could not parse arguments: {e:?}")))?;
        Self::try_from(ConfigArgs::from_arguments(&arguments))
    }
}

/// Splits a comma separated key list, dropping blanks.
fn split_keys(keys: Option<&str>) -> Vec<String> {
    keys.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

fn positive(value: Option<u64>, default: u64, name: &str) -> Result<u64> {
    match value.unwrap_or(default) {
        0 => Err(Error::Config(format!("--{name} must be greater than zero"))),
        value => Ok(value),
    }
}

impl TryFrom<ConfigArgs> for Config {
    type Error = Error;

    fn try_from(args: ConfigArgs) -> Result<Self> {
        let url = args
            .feed
            .filter(|feed| !feed.trim().is_empty())
            .ok_or_else(|| Error::Config("--feed is required".to_string()))?;

        let keys = split_keys(args.auth_keys.as_deref());

        let auth = match args.auth_type.as_deref().unwrap_or("none") {
            "none" => FeedAuth::None,
            "header" => {
                let name = args
                    .auth_header
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| Error::Config("header auth needs --auth-header".to_string()))?;
                if keys.is_empty() {
                    return Err(Error::Config("header auth needs --auth-keys".to_string()));
                }
                FeedAuth::Header { name, keys }
            }
            "url" => {
                if keys.is_empty() {
                    return Err(Error::Config("url auth needs --auth-keys".to_string()));
                }
                if !url.contains(URL_KEY_PLACEHOLDER) {
                    return Err(Error::Config(format!(
                        "url auth needs {URL_KEY_PLACEHOLDER} in the feed url"
                    )));
                }
                FeedAuth::Url { keys }
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown --auth-type {other:?}, expected none, header or url"
                )))
            }
        };

        reqwest::Url::parse(&url).map_err(|e| Error::Config(format!("--feed: {e}")))?;

        let stale_minutes = positive(args.stale_minutes, DEFAULT_STALE_MINUTES, "stale-minutes")?;
        let interval = positive(args.interval, DEFAULT_INTERVAL_SECS, "interval")?;
        let timeout = positive(args.timeout, DEFAULT_TIMEOUT_SECS, "timeout")?;

        let stale_window = i64::try_from(stale_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .ok_or_else(|| Error::Config("--stale-minutes is too large".to_string()))?;

        if args.routes.is_some() && args.agencies.is_none() {
            return Err(Error::Config("--routes needs --agencies".to_string()));
        }

        Ok(Self {
            source: FeedSource {
                url,
                auth,
                timeout: Duration::from_secs(timeout),
            },
            stale_window,
            interval: Duration::from_secs(interval),
            bind: args.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            agencies: args.agencies.map(PathBuf::from),
            routes: args.routes.map(PathBuf::from),
            once: args.once,
            json: args.json.map(PathBuf::from),
            output: args.output.map(PathBuf::from),
        })
    }
}
