//! Fleet collections served through the sync layer.

use super::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TRIPS: &str = "trips";
pub const DIESEL_RECORDS: &str = "diesel_records";
pub const DRIVER_BEHAVIOR_EVENTS: &str = "driver_behavior_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    #[default]
    Planned,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub vehicle_id: String,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub status: TripStatus,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Record for Trip {
    const COLLECTION: &'static str = TRIPS;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DieselRecord {
    pub id: String,
    pub vehicle_id: String,
    pub litres: f64,
    pub cost: f64,
    #[serde(default)]
    pub odometer_km: Option<f64>,
    #[serde(default)]
    pub trip_id: Option<String>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
}

impl DieselRecord {
    pub fn cost_per_litre(&self) -> Option<f64> {
        (self.litres > 0.0).then(|| self.cost / self.litres)
    }
}

impl Record for DieselRecord {
    const COLLECTION: &'static str = DIESEL_RECORDS;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverBehaviorEvent {
    pub id: String,
    pub driver_id: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    /// e.g. "harsh_braking", "speeding", "idling"
    pub event_type: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Record for DriverBehaviorEvent {
    const COLLECTION: &'static str = DRIVER_BEHAVIOR_EVENTS;

    fn id(&self) -> &str {
        &self.id
    }
}
