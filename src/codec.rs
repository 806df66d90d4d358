//! GTFS-realtime wire codec.
//!
//! Protobuf messages from the `gtfs-rt` crate never leave this module: the
//! rest of the crate sees [`FeedEntity`] and [`VehicleUpdate`] going in and
//! plain bytes coming out.

use std::fmt;

use chrono::{DateTime, Utc};
use prost::Message;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{
    CongestionLevel, OccupancyStatus, Position, ScheduleRelationship, TripDescriptor,
    VehiclePositionRecord, VehicleStopStatus, VehicleUpdate,
};

pub const GTFS_REALTIME_VERSION: &str = "2.0";

/// What a non-vehicle entity carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    TripUpdate,
    Alert,
    Shape,
    /// No payload at all, e.g. a bare deletion marker.
    Empty,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TripUpdate => "trip update",
            Self::Alert => "alert",
            Self::Shape => "shape",
            Self::Empty => "empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEntity {
    Vehicle(VehicleUpdate),
    Other { id: String, kind: EntityKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incrementality {
    FullDataset,
    Differential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedHeaderInfo {
    pub version: String,
    pub incrementality: Incrementality,
    /// POSIX seconds, when the producer stamped one.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFeed {
    pub header: FeedHeaderInfo,
    pub entities: Vec<FeedEntity>,
}

/// Decodes a protobuf `FeedMessage`, keeping entity order.
pub fn decode_feed(bytes: &[u8]) -> Result<DecodedFeed> {
    let message = gtfs_rt::FeedMessage::decode(bytes)?;

    debug!(
        bytes = bytes.len(),
        entities = message.entity.len(),
        "decoded feed message"
    );

    let incrementality = match message.header.incrementality {
        Some(value) if value == gtfs_rt::feed_header::Incrementality::Differential as i32 => {
            Incrementality::Differential
        }
        _ => Incrementality::FullDataset,
    };

    Ok(DecodedFeed {
        header: FeedHeaderInfo {
            version: message.header.gtfs_realtime_version,
            incrementality,
            timestamp: message.header.timestamp,
        },
        entities: message.entity.into_iter().map(entity_from_wire).collect(),
    })
}

/// Encodes records as one feed message, one entity per record, in the order
/// given. Entity ids are [`VehiclePositionRecord::entity_key`].
pub fn encode_feed<'a>(
    records: impl IntoIterator<Item = &'a VehiclePositionRecord>,
    incrementality: Incrementality,
    generated_at: DateTime<Utc>,
) -> Vec<u8> {
    let entity: Vec<gtfs_rt::FeedEntity> = records
        .into_iter()
        .map(|record| gtfs_rt::FeedEntity {
            id: record.entity_key(),
            is_deleted: None,
            trip_update: None,
            vehicle: Some(vehicle_to_wire(&record.to_update())),
            alert: None,
            shape: None,
        })
        .collect();

    let incrementality = match incrementality {
        Incrementality::FullDataset => gtfs_rt::feed_header::Incrementality::FullDataset,
        Incrementality::Differential => gtfs_rt::feed_header::Incrementality::Differential,
    };

    let message = gtfs_rt::FeedMessage {
        header: gtfs_rt::FeedHeader {
            gtfs_realtime_version: GTFS_REALTIME_VERSION.to_string(),
            incrementality: Some(incrementality as i32),
            timestamp: u64::try_from(generated_at.timestamp()).ok(),
        },
        entity,
    };

    let bytes = message.encode_to_vec();
    debug!(
        entities = message.entity.len(),
        bytes = bytes.len(),
        "encoded feed message"
    );
    bytes
}

fn entity_from_wire(entity: gtfs_rt::FeedEntity) -> FeedEntity {
    if let Some(vehicle) = entity.vehicle {
        return FeedEntity::Vehicle(vehicle_from_wire(entity.id, vehicle));
    }

    let kind = if entity.trip_update.is_some() {
        EntityKind::TripUpdate
    } else if entity.alert.is_some() {
        EntityKind::Alert
    } else if entity.shape.is_some() {
        EntityKind::Shape
    } else {
        EntityKind::Empty
    };

    FeedEntity::Other {
        id: entity.id,
        kind,
    }
}

fn vehicle_from_wire(entity_id: String, vehicle: gtfs_rt::VehiclePosition) -> VehicleUpdate {
    let descriptor = vehicle.vehicle.unwrap_or_default();

    let occupancy_status = vehicle
        .occupancy_status
        .and_then(|v| known(&entity_id, "occupancy_status", v, OccupancyStatus::from_i32(v)));
    let congestion_level = vehicle
        .congestion_level
        .and_then(|v| known(&entity_id, "congestion_level", v, CongestionLevel::from_i32(v)));
    let current_status = vehicle
        .current_status
        .and_then(|v| known(&entity_id, "current_status", v, VehicleStopStatus::from_i32(v)));

    let trip = vehicle.trip.map(|trip| TripDescriptor {
        schedule_relationship: trip.schedule_relationship.and_then(|v| {
            known(
                &entity_id,
                "schedule_relationship",
                v,
                ScheduleRelationship::from_i32(v),
            )
        }),
        trip_id: trip.trip_id,
        route_id: trip.route_id,
        direction_id: trip.direction_id,
        start_time: trip.start_time,
        start_date: trip.start_date,
    });

    let position = vehicle.position.map(|p| Position {
        latitude: p.latitude,
        longitude: p.longitude,
        bearing: p.bearing,
        odometer: p.odometer,
        speed: p.speed,
    });

    VehicleUpdate {
        entity_id,
        vehicle_id: descriptor.id,
        label: descriptor.label,
        license_plate: descriptor.license_plate,
        timestamp: vehicle.timestamp,
        position,
        trip,
        occupancy_status,
        congestion_level,
        current_status,
        current_stop_sequence: vehicle.current_stop_sequence,
        stop_id: vehicle.stop_id,
    }
}

fn known<T>(entity_id: &str, field: &'static str, raw: i32, value: Option<T>) -> Option<T> {
    if value.is_none() {
        warn!(entity_id, field, raw, "dropping unknown enum value");
    }
    value
}

fn vehicle_to_wire(update: &VehicleUpdate) -> gtfs_rt::VehiclePosition {
    let descriptor = (update.vehicle_id.is_some()
        || update.label.is_some()
        || update.license_plate.is_some())
    .then(|| gtfs_rt::VehicleDescriptor {
        id: update.vehicle_id.clone(),
        label: update.label.clone(),
        license_plate: update.license_plate.clone(),
        wheelchair_accessible: None,
    });

    gtfs_rt::VehiclePosition {
        trip: update.trip.as_ref().map(|trip| gtfs_rt::TripDescriptor {
            trip_id: trip.trip_id.clone(),
            route_id: trip.route_id.clone(),
            direction_id: trip.direction_id,
            start_time: trip.start_time.clone(),
            start_date: trip.start_date.clone(),
            schedule_relationship: trip.schedule_relationship.map(ScheduleRelationship::as_i32),
        }),
        vehicle: descriptor,
        position: update.position.as_ref().map(|p| gtfs_rt::Position {
            latitude: p.latitude,
            longitude: p.longitude,
            bearing: p.bearing,
            odometer: p.odometer,
            speed: p.speed,
        }),
        current_stop_sequence: update.current_stop_sequence,
        stop_id: update.stop_id.clone(),
        current_status: update.current_status.map(VehicleStopStatus::as_i32),
        timestamp: update.timestamp,
        congestion_level: update.congestion_level.map(CongestionLevel::as_i32),
        occupancy_status: update.occupancy_status.map(OccupancyStatus::as_i32),
        occupancy_percentage: None,
        multi_carriage_details: vec![],
    }
}
