//! Diesel model structs for devices and the append-only telemetry tables.
//!
//! Rows are only ever inserted by the ingester; the `Queryable` variants exist
//! for read-back (device lookup and verification).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

// Canonical values for `anomaly_events.event_type`, mirrored by the table's CHECK constraint.
pub mod event_types {
    pub const DROP: &str = "DROP";
    pub const STALL: &str = "STALL";
    pub const OVERSHOOT: &str = "OVERSHOOT";
    pub const ENCODER_FAULT: &str = "ENCODER_FAULT";
}

pub const DEFAULT_DEVICE_DESCRIPTION: &str = "Telemetry device";

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
#[diesel(primary_key(device_id))]
pub struct Device {
    pub device_id: i64,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub name: String,
    pub description: String,
}

impl NewDevice {
    pub fn named(name: impl Into<String>) -> Self {
        NewDevice {
            name: name.into(),
            description: DEFAULT_DEVICE_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::telemetry_metrics)]
#[diesel(belongs_to(Device))]
pub struct TelemetryMetric {
    pub id: i64,
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub target_rpm: Option<f64>,
    pub rpm: Option<f64>,
    pub deviation_rpm: Option<f64>,
    pub deviation_pct: Option<f64>,
    pub pwm: Option<f64>,
    pub duty_pct: Option<f64>,
    pub delta_counts: Option<f64>,
    pub sudden_drop: bool,
    pub stall: bool,
    pub overshoot: bool,
    pub encoder_fault: bool,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::telemetry_metrics)]
pub struct NewTelemetryMetric {
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub target_rpm: Option<f64>,
    pub rpm: Option<f64>,
    pub deviation_rpm: Option<f64>,
    pub deviation_pct: Option<f64>,
    pub pwm: Option<f64>,
    pub duty_pct: Option<f64>,
    pub delta_counts: Option<f64>,
    pub sudden_drop: bool,
    pub stall: bool,
    pub overshoot: bool,
    pub encoder_fault: bool,
}

// Raw payload retention
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::telemetry_events)]
#[diesel(primary_key(event_id))]
#[diesel(belongs_to(Device))]
pub struct TelemetryEvent {
    pub event_id: i64,
    pub device_id: i64,
    pub time_s: Option<f64>,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::telemetry_events)]
pub struct NewTelemetryEvent {
    pub device_id: i64,
    pub time_s: Option<f64>,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::anomaly_events)]
#[diesel(primary_key(anomaly_id))]
#[diesel(belongs_to(Device))]
pub struct AnomalyEvent {
    pub anomaly_id: i64,
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::anomaly_events)]
pub struct NewAnomalyEvent {
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
}

/// Everything one accepted message writes, committed as a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub metric: NewTelemetryMetric,
    pub event: NewTelemetryEvent,
    pub anomalies: Vec<NewAnomalyEvent>,
}
