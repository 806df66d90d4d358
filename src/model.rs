use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;

/// Declares a domain enum mirroring a GTFS-realtime enum, with the wire
/// numbering kept so the codec can map both ways.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_i32(value: i32) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn as_i32(self) -> i32 {
                self as i32
            }
        }
    };
}

wire_enum!(
    /// Where the vehicle is relative to `stop_id`.
    VehicleStopStatus {
        IncomingAt = 0,
        StoppedAt = 1,
        InTransitTo = 2,
    }
);

wire_enum!(
    CongestionLevel {
        UnknownCongestionLevel = 0,
        RunningSmoothly = 1,
        StopAndGo = 2,
        Congestion = 3,
        SevereCongestion = 4,
    }
);

wire_enum!(
    OccupancyStatus {
        Empty = 0,
        ManySeatsAvailable = 1,
        FewSeatsAvailable = 2,
        StandingRoomOnly = 3,
        CrushedStandingRoomOnly = 4,
        Full = 5,
        NotAcceptingPassengers = 6,
        NoDataAvailable = 7,
        NotBoardable = 8,
    }
);

wire_enum!(
    /// Relation between a trip and the static schedule.
    ScheduleRelationship {
        Scheduled = 0,
        Added = 1,
        Unscheduled = 2,
        Canceled = 3,
        Replacement = 5,
        Duplicated = 6,
        Deleted = 7,
    }
);

/// Geographic position of a vehicle. Latitude and longitude are in WGS-84
/// degrees, bearing in degrees clockwise from north, odometer in meters and
/// speed in meters per second.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub latitude: f32,
    pub longitude: f32,
    pub bearing: Option<f32>,
    pub odometer: Option<f64>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TripDescriptor {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub schedule_relationship: Option<ScheduleRelationship>,
}

/// Identification of a stored vehicle. The id is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleDescriptor {
    pub id: String,
    pub label: Option<String>,
    pub license_plate: Option<String>,
}

/// A vehicle position as it came off the wire, before validation. Anything
/// may be missing here, including what a stored record requires.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehicleUpdate {
    /// Id of the feed entity that carried this update.
    pub entity_id: String,
    pub vehicle_id: Option<String>,
    pub label: Option<String>,
    pub license_plate: Option<String>,
    /// POSIX seconds.
    pub timestamp: Option<u64>,
    pub position: Option<Position>,
    pub trip: Option<TripDescriptor>,
    pub occupancy_status: Option<OccupancyStatus>,
    pub congestion_level: Option<CongestionLevel>,
    pub current_status: Option<VehicleStopStatus>,
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
}

/// The latest known position of one vehicle. Records are immutable; the
/// cache replaces them whole.
#[derive(Debug, Clone, PartialEq)]
pub struct VehiclePositionRecord {
    vehicle: VehicleDescriptor,
    timestamp: DateTime<Utc>,
    position: Option<Position>,
    trip: Option<TripDescriptor>,
    occupancy_status: Option<OccupancyStatus>,
    congestion_level: Option<CongestionLevel>,
    current_status: Option<VehicleStopStatus>,
    current_stop_sequence: Option<u32>,
    stop_id: Option<String>,
}

impl TryFrom<VehicleUpdate> for VehiclePositionRecord {
    type Error = Error;

    fn try_from(update: VehicleUpdate) -> Result<Self, Self::Error> {
        let vehicle_id = match update.vehicle_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(Error::invalid_record(&update.entity_id, "missing vehicle id")),
        };

        let Some(seconds) = update.timestamp else {
            return Err(Error::invalid_record(&update.entity_id, "missing timestamp"));
        };

        let timestamp = i64::try_from(seconds)
            .ok()
            .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
            .ok_or_else(|| {
                Error::invalid_record(
                    &update.entity_id,
                    format!("timestamp {seconds} out of range"),
                )
            })?;

        Ok(Self {
            vehicle: VehicleDescriptor {
                id: vehicle_id,
                label: update.label,
                license_plate: update.license_plate,
            },
            timestamp,
            position: update.position,
            trip: update.trip,
            occupancy_status: update.occupancy_status,
            congestion_level: update.congestion_level,
            current_status: update.current_status,
            current_stop_sequence: update.current_stop_sequence,
            stop_id: update.stop_id,
        })
    }
}

impl VehiclePositionRecord {
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle.id
    }

    pub fn vehicle(&self) -> &VehicleDescriptor {
        &self.vehicle
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn trip(&self) -> Option<&TripDescriptor> {
        self.trip.as_ref()
    }

    pub fn occupancy_status(&self) -> Option<OccupancyStatus> {
        self.occupancy_status
    }

    pub fn congestion_level(&self) -> Option<CongestionLevel> {
        self.congestion_level
    }

    pub fn current_status(&self) -> Option<VehicleStopStatus> {
        self.current_status
    }

    pub fn current_stop_sequence(&self) -> Option<u32> {
        self.current_stop_sequence
    }

    pub fn stop_id(&self) -> Option<&str> {
        self.stop_id.as_deref()
    }

    /// Whether this record was captured strictly before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.timestamp < cutoff
    }

    /// `"<timestamp>:<vehicle id>"`, the entity id used when re-encoding.
    pub fn entity_key(&self) -> String {
        format!("{}:{}", self.timestamp.timestamp(), self.vehicle.id)
    }

    /// Stable hash of `(vehicle id, timestamp)`, for callers that receive the
    /// same record over several transports and want to drop repeats before
    /// ingesting. The cache itself does not rely on it.
    pub fn fingerprint(&self) -> u64 {
        farmhash::hash64(self.entity_key().as_bytes())
    }

    /// Back to the unvalidated wire shape, keyed by [`Self::entity_key`].
    pub fn to_update(&self) -> VehicleUpdate {
        VehicleUpdate {
            entity_id: self.entity_key(),
            vehicle_id: Some(self.vehicle.id.clone()),
            label: self.vehicle.label.clone(),
            license_plate: self.vehicle.license_plate.clone(),
            timestamp: u64::try_from(self.timestamp.timestamp()).ok(),
            position: self.position.clone(),
            trip: self.trip.clone(),
            occupancy_status: self.occupancy_status,
            congestion_level: self.congestion_level,
            current_status: self.current_status,
            current_stop_sequence: self.current_stop_sequence,
            stop_id: self.stop_id.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn update(vehicle_id: &str, timestamp: i64) -> VehicleUpdate {
        VehicleUpdate {
            entity_id: format!("entity-{vehicle_id}"),
            vehicle_id: Some(vehicle_id.to_string()),
            timestamp: Some(timestamp as u64),
            ..Default::default()
        }
    }

    pub(crate) fn record(vehicle_id: &str, timestamp: i64) -> VehiclePositionRecord {
        VehiclePositionRecord::try_from(update(vehicle_id, timestamp)).unwrap()
    }

    #[test]
    fn record_requires_vehicle_id() {
        let mut missing = update("bus-1", 1_700_000_000);
        missing.vehicle_id = None;
        let err = VehiclePositionRecord::try_from(missing).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { ref entity_id, .. } if entity_id == "entity-bus-1"));

        let blank = update("   ", 1_700_000_000);
        assert!(VehiclePositionRecord::try_from(blank).is_err());
    }

    #[test]
    fn record_requires_timestamp() {
        let mut missing = update("bus-1", 0);
        missing.timestamp = None;
        let err = VehiclePositionRecord::try_from(missing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid vehicle position in entity \"entity-bus-1\": missing timestamp"
        );
    }

    #[test]
    fn out_of_range_timestamp_is_rejected() {
        let mut far = update("bus-1", 0);
        far.timestamp = Some(u64::MAX);
        assert!(VehiclePositionRecord::try_from(far).is_err());
    }

    #[test]
    fn staleness_is_strict() {
        let rec = record("bus-1", 1_000);
        let at = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let after = DateTime::<Utc>::from_timestamp(1_001, 0).unwrap();
        assert!(!rec.is_stale(at));
        assert!(rec.is_stale(after));
    }

    #[test]
    fn entity_key_and_fingerprint() {
        let a = record("bus-1", 1_700_000_000);
        let b = record("bus-1", 1_700_000_000);
        let c = record("bus-1", 1_700_000_001);
        assert_eq!(a.entity_key(), "1700000000:bus-1");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn to_update_keeps_fields() {
        let mut source = update("tram-4", 1_700_000_000);
        source.label = Some("4".to_string());
        source.stop_id = Some("S1".to_string());
        source.current_status = Some(VehicleStopStatus::StoppedAt);
        let rec = VehiclePositionRecord::try_from(source).unwrap();
        let back = rec.to_update();
        assert_eq!(back.entity_id, "1700000000:tram-4");
        assert_eq!(back.label.as_deref(), Some("4"));
        assert_eq!(back.stop_id.as_deref(), Some("S1"));
        assert_eq!(back.current_status, Some(VehicleStopStatus::StoppedAt));
        assert_eq!(VehiclePositionRecord::try_from(back).unwrap(), rec);
    }

    #[test]
    fn wire_enum_numbering() {
        assert_eq!(ScheduleRelationship::from_i32(5), Some(ScheduleRelationship::Replacement));
        assert_eq!(ScheduleRelationship::from_i32(4), None);
        assert_eq!(OccupancyStatus::NotBoardable.as_i32(), 8);
        assert_eq!(VehicleStopStatus::from_i32(3), None);
    }
}
