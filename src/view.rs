//! JSON projection of vehicle position records.
//!
//! Optional fields absent from the source are left out of the output rather
//! than rendered as `null`. Zero odometer and speed readings are treated as
//! absent, since many producers send 0 when they have no reading. NaN and
//! infinite readings are dropped too, as JSON cannot carry them.

use serde::Serialize;

use crate::model::{
    CongestionLevel, OccupancyStatus, Position, ScheduleRelationship, TripDescriptor,
    VehiclePositionRecord, VehicleStopStatus,
};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleView {
    pub vehicle_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip: Option<TripView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_status: Option<OccupancyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_level: Option<CongestionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<VehicleStopStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop_sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    /// POSIX seconds.
    pub timestamp: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PositionView {
    pub latitude: f32,
    pub longitude: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odometer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_relationship: Option<ScheduleRelationship>,
}

pub fn render_record(record: &VehiclePositionRecord) -> VehicleView {
    let vehicle = record.vehicle();
    VehicleView {
        vehicle_id: vehicle.id.clone(),
        label: vehicle.label.clone(),
        license_plate: vehicle.license_plate.clone(),
        position: record.position().map(render_position),
        trip: record.trip().map(render_trip),
        occupancy_status: record.occupancy_status(),
        congestion_level: record.congestion_level(),
        current_status: record.current_status(),
        current_stop_sequence: record.current_stop_sequence(),
        stop_id: record.stop_id().map(str::to_string),
        timestamp: record.timestamp().timestamp(),
    }
}

pub fn render_position(position: &Position) -> PositionView {
    PositionView {
        latitude: position.latitude,
        longitude: position.longitude,
        bearing: position.bearing.filter(|bearing| bearing.is_finite()),
        odometer: position
            .odometer
            .filter(|odometer| odometer.is_finite() && *odometer > 0.0),
        speed: position
            .speed
            .filter(|speed| speed.is_finite() && *speed > 0.0),
    }
}

pub fn render_trip(trip: &TripDescriptor) -> TripView {
    TripView {
        route_id: trip.route_id.clone(),
        trip_id: trip.trip_id.clone(),
        start_date: trip.start_date.clone(),
        start_time: trip.start_time.clone(),
        direction_id: trip.direction_id,
        schedule_relationship: trip.schedule_relationship,
    }
}

/// Renders records ordered by vehicle id.
pub fn render_snapshot<'a>(
    records: impl IntoIterator<Item = &'a VehiclePositionRecord>,
) -> Vec<VehicleView> {
    let mut views: Vec<VehicleView> = records.into_iter().map(render_record).collect();
    views.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
    views
}
