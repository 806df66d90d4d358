//! Stale-aware cache of GTFS-realtime vehicle positions, with the feed codec,
//! static agency / route registries and the HTTP poller that keep it fed.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod static_data;
pub mod view;

pub use cache::{CacheStatus, ChangeSet, PositionCache, SharedPositionCache};
pub use codec::{decode_feed, encode_feed, DecodedFeed, EntityKind, FeedEntity};
pub use error::{Error, Result};
pub use model::{VehiclePositionRecord, VehicleUpdate};
