use thiserror::Error;

use crate::codec::EntityKind;

/// Errors raised by the feed codec, the position cache, the static
/// registries and the fetcher.
#[derive(Error, Debug)]
pub enum Error {
    /// A vehicle position entity that cannot become a record. Only that
    /// record is dropped, the rest of the batch still merges.
    #[error("invalid vehicle position in entity {entity_id:?}: {reason}")]
    InvalidRecord { entity_id: String, reason: String },

    /// The feed carried something other than vehicle positions. The whole
    /// ingest is rejected and the cache is left untouched.
    #[error("unexpected {kind} entity {entity_id:?} in vehicle position feed")]
    UnexpectedEntityKind { entity_id: String, kind: EntityKind },

    #[error("failed to decode feed: {0}")]
    DecodeFailure(#[from] prost::DecodeError),

    #[error("failed to fetch feed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("feed responded with HTTP {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("{file} row {row}: {reason}")]
    InvalidStaticData {
        file: &'static str,
        row: u64,
        reason: String,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid_record(entity_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            entity_id: entity_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn static_data(file: &'static str, row: u64, reason: impl Into<String>) -> Self {
        Self::InvalidStaticData {
            file,
            row,
            reason: reason.into(),
        }
    }

    /// True for the errors a polling loop should wait out instead of
    /// treating as a broken feed.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::HttpStatus(status) if *status == reqwest::StatusCode::TOO_MANY_REQUESTS)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
