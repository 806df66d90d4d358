//! Position consolidation cache.
//!
//! Keeps one record per vehicle: the newest by capture timestamp, as long as
//! it is within the stale window. Staleness is evaluated lazily, on ingest
//! and on explicit purge.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::codec::{self, FeedEntity, Incrementality};
use crate::error::{Error, Result};
use crate::model::VehiclePositionRecord;
use crate::view::{self, VehicleView};

/// Records inserted or replaced by one ingest call, plus what was dropped.
#[derive(Debug, Default)]
pub struct ChangeSet {
    records: AHashMap<String, VehiclePositionRecord>,
    /// Records older than the stale window cutoff.
    pub stale: usize,
    /// Records that lost to an existing record with the same or a later
    /// timestamp.
    pub superseded: usize,
    /// Per-record failures. The rest of the batch was still applied.
    pub rejected: Vec<Error>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, vehicle_id: &str) -> bool {
        self.records.contains_key(vehicle_id)
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&VehiclePositionRecord> {
        self.records.get(vehicle_id)
    }

    pub fn vehicle_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.records.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VehiclePositionRecord)> {
        self.records.iter().map(|(id, record)| (id.as_str(), record))
    }

    pub fn into_records(self) -> AHashMap<String, VehiclePositionRecord> {
        self.records
    }

    /// Encodes just the changed records as a differential feed.
    pub fn to_feed_bytes_at(&self, generated_at: DateTime<Utc>) -> Vec<u8> {
        codec::encode_feed(
            sorted(self.records.values()),
            Incrementality::Differential,
            generated_at,
        )
    }

    fn record(&mut self, record: VehiclePositionRecord) {
        self.records.insert(record.vehicle_id().to_string(), record);
    }
}

pub struct PositionCache {
    stale_window: Duration,
    entries: AHashMap<String, VehiclePositionRecord>,
    last_ingested_at: Option<DateTime<Utc>>,
    changed_at: Option<DateTime<Utc>>,
    label: String,
}

impl PositionCache {
    pub fn new(stale_window: Duration) -> Self {
        Self {
            stale_window,
            entries: AHashMap::new(),
            last_ingested_at: None,
            changed_at: None,
            label: String::from("default"),
        }
    }

    /// Name used in this cache's log events, usually the feed id.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Builds a cache from one encoded feed.
    pub fn from_feed_bytes(stale_window: Duration, bytes: &[u8]) -> Result<Self> {
        let mut cache = Self::new(stale_window);
        cache.ingest_feed_bytes(bytes)?;
        Ok(cache)
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    pub fn last_ingested_at(&self) -> Option<DateTime<Utc>> {
        self.last_ingested_at
    }

    /// When the stored set of records last changed, by ingest, purge or
    /// removal. Never moves backwards.
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.changed_at
    }

    fn mark_changed(&mut self, at: DateTime<Utc>) {
        self.changed_at = Some(self.changed_at.map_or(at, |previous| previous.max(at)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&VehiclePositionRecord> {
        self.entries.get(vehicle_id)
    }

    pub fn vehicle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Copies of every stored record, ordered by vehicle id.
    pub fn records(&self) -> Vec<VehiclePositionRecord> {
        sorted(self.entries.values()).cloned().collect()
    }

    pub fn remove(&mut self, vehicle_id: &str) -> Option<VehiclePositionRecord> {
        let removed = self.entries.remove(vehicle_id);
        if removed.is_some() {
            self.mark_changed(Utc::now());
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.mark_changed(Utc::now());
        }
    }

    /// `now - stale_window`, saturating at the earliest representable time.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.stale_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn ingest(&mut self, entities: Vec<FeedEntity>) -> Result<ChangeSet> {
        self.ingest_at(entities, Utc::now())
    }

    /// Merges a decoded batch into the cache as of `now`.
    ///
    /// Any non-vehicle entity rejects the whole batch before anything is
    /// touched. Otherwise each record is merged last-write-wins: it replaces
    /// the stored record only if its timestamp is strictly later, and records
    /// older than `now - stale_window` are dropped.
    pub fn ingest_at(&mut self, entities: Vec<FeedEntity>, now: DateTime<Utc>) -> Result<ChangeSet> {
        if let Some((entity_id, kind)) = entities.iter().find_map(|entity| match entity {
            FeedEntity::Other { id, kind } => Some((id, *kind)),
            FeedEntity::Vehicle(_) => None,
        }) {
            error!(
                feed = %self.label,
                entity_id = %entity_id,
                %kind,
                "rejecting batch with non-vehicle entity"
            );
            return Err(Error::UnexpectedEntityKind {
                entity_id: entity_id.clone(),
                kind,
            });
        }

        let cutoff = self.cutoff(now);
        let received = entities.len();
        let mut changes = ChangeSet::default();

        for entity in entities {
            let FeedEntity::Vehicle(update) = entity else {
                continue;
            };

            let record = match VehiclePositionRecord::try_from(update) {
                Ok(record) => record,
                Err(err) => {
                    warn!(feed = %self.label, error = %err, "skipping vehicle position");
                    changes.rejected.push(err);
                    continue;
                }
            };

            if record.is_stale(cutoff) {
                changes.stale += 1;
                continue;
            }

            match self.entries.entry(record.vehicle_id().to_string()) {
                Entry::Vacant(slot) => {
                    changes.record(record.clone());
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    if record.timestamp() > slot.get().timestamp() {
                        changes.record(record.clone());
                        slot.insert(record);
                    } else {
                        changes.superseded += 1;
                    }
                }
            }
        }

        self.last_ingested_at = Some(now);
        if !changes.is_empty() {
            self.mark_changed(now);
        }

        debug!(
            feed = %self.label,
            received,
            changed = changes.len(),
            stale = changes.stale,
            superseded = changes.superseded,
            rejected = changes.rejected.len(),
            total = self.entries.len(),
            "ingested vehicle positions"
        );

        Ok(changes)
    }

    /// Decodes a protobuf feed and ingests it.
    pub fn ingest_feed_bytes(&mut self, bytes: &[u8]) -> Result<ChangeSet> {
        let feed = codec::decode_feed(bytes)?;
        self.ingest(feed.entities)
    }

    /// Drops every record captured before `as_of`, or before
    /// `now - stale_window` when no cutoff is given. Returns how many were
    /// removed.
    pub fn purge_stale(&mut self, as_of: Option<DateTime<Utc>>) -> usize {
        let cutoff = as_of.unwrap_or_else(|| self.cutoff(Utc::now()));
        let before = self.entries.len();
        self.entries.retain(|_, record| !record.is_stale(cutoff));
        let purged = before - self.entries.len();

        if purged > 0 {
            self.mark_changed(Utc::now());
            debug!(feed = %self.label, purged, %cutoff, "purged stale vehicle positions");
        }
        purged
    }

    pub fn snapshot_view(&self) -> Vec<VehicleView> {
        view::render_snapshot(self.entries.values())
    }

    pub fn to_feed_bytes(&self, is_differential: bool) -> Vec<u8> {
        self.to_feed_bytes_at(is_differential, Utc::now())
    }

    /// Re-encodes the current records, ordered by vehicle id.
    pub fn to_feed_bytes_at(&self, is_differential: bool, generated_at: DateTime<Utc>) -> Vec<u8> {
        let incrementality = if is_differential {
            Incrementality::Differential
        } else {
            Incrementality::FullDataset
        };
        codec::encode_feed(sorted(self.entries.values()), incrementality, generated_at)
    }
}

fn sorted<'a>(
    records: impl Iterator<Item = &'a VehiclePositionRecord>,
) -> impl Iterator<Item = &'a VehiclePositionRecord> {
    let mut records: Vec<&VehiclePositionRecord> = records.collect();
    records.sort_unstable_by(|a, b| a.vehicle_id().cmp(b.vehicle_id()));
    records.into_iter()
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CacheStatus {
    pub vehicles: usize,
    pub stale_window_secs: i64,
    /// POSIX seconds of the last successful ingest.
    pub last_ingested_at: Option<i64>,
    /// POSIX milliseconds of the last change to the stored records.
    pub changed_at_millis: Option<i64>,
}

/// A [`PositionCache`] shared between one polling task and any number of
/// readers.
///
/// Ingest and purge hold the write lock for the whole merge, so readers only
/// ever see the cache before or after a batch. Readers get owned copies.
#[derive(Clone)]
pub struct SharedPositionCache {
    inner: Arc<RwLock<PositionCache>>,
}

impl SharedPositionCache {
    pub fn new(cache: PositionCache) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    pub async fn ingest(&self, entities: Vec<FeedEntity>) -> Result<ChangeSet> {
        self.inner.write().await.ingest(entities)
    }

    pub async fn ingest_at(&self, entities: Vec<FeedEntity>, now: DateTime<Utc>) -> Result<ChangeSet> {
        self.inner.write().await.ingest_at(entities, now)
    }

    pub async fn purge_stale(&self, as_of: Option<DateTime<Utc>>) -> usize {
        self.inner.write().await.purge_stale(as_of)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn get(&self, vehicle_id: &str) -> Option<VehiclePositionRecord> {
        self.inner.read().await.get(vehicle_id).cloned()
    }

    pub async fn records(&self) -> Vec<VehiclePositionRecord> {
        self.inner.read().await.records()
    }

    pub async fn snapshot_view(&self) -> Vec<VehicleView> {
        self.inner.read().await.snapshot_view()
    }

    pub async fn to_feed_bytes(&self, is_differential: bool) -> Vec<u8> {
        self.inner.read().await.to_feed_bytes(is_differential)
    }

    /// Full dataset stamped with [`PositionCache::changed_at`], so a cache
    /// that has not changed encodes to the same bytes every time. Returns the
    /// stamp alongside the bytes.
    pub async fn published_feed(&self) -> (Vec<u8>, Option<DateTime<Utc>>) {
        let cache = self.inner.read().await;
        let stamp = cache.changed_at();
        let bytes = cache.to_feed_bytes_at(false, stamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
        (bytes, stamp)
    }

    pub async fn status(&self) -> CacheStatus {
        let cache = self.inner.read().await;
        CacheStatus {
            vehicles: cache.len(),
            stale_window_secs: cache.stale_window().num_seconds(),
            last_ingested_at: cache.last_ingested_at().map(|at| at.timestamp()),
            changed_at_millis: cache.changed_at().map(|at| at.timestamp_millis()),
        }
    }
}
