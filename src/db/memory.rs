//! In-memory `TelemetryStore` for unit tests.
//!
//! Mirrors the PostgreSQL constraints the ingester relies on: unique device
//! names, the anomaly event_type check, and all-or-nothing sample writes.

use crate::db::models::{
    event_types, Device, NewAnomalyEvent, NewDevice, NewTelemetryEvent, NewTelemetryMetric, SampleBatch,
};
use crate::db::store::{StoreError, TelemetryStore};
use chrono::Utc;
use diesel::result::Error as DieselError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct Tables {
    pub devices: Vec<Device>,
    pub metrics: Vec<NewTelemetryMetric>,
    pub events: Vec<NewTelemetryEvent>,
    pub anomalies: Vec<NewAnomalyEvent>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Every storage call, successful or not.
    pub calls: AtomicUsize,
    /// Fail all operations as if the database were unreachable.
    pub offline: AtomicBool,
    /// Fail the next `write_sample` after staging the sample and raw event.
    pub fail_next_write: AtomicBool,
    /// Widens the window between lookup and insert to provoke races.
    pub lookup_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn with_lookup_delay(delay: Duration) -> Self {
        MemoryStore {
            lookup_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> Tables {
        self.tables.lock().expect("tables lock").clone()
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("database offline".to_string()));
        }
        Ok(())
    }
}

impl TelemetryStore for MemoryStore {
    fn find_device(&self, name: &str) -> Result<Option<Device>, StoreError> {
        self.enter()?;
        let found = {
            let tables = self.tables.lock().expect("tables lock");
            tables.devices.iter().find(|d| d.name == name).cloned()
        };
        if let Some(delay) = self.lookup_delay {
            thread::sleep(delay);
        }
        Ok(found)
    }

    fn insert_device(&self, device: &NewDevice) -> Result<Option<i64>, StoreError> {
        self.enter()?;
        let mut tables = self.tables.lock().expect("tables lock");
        if tables.devices.iter().any(|d| d.name == device.name) {
            return Ok(None);
        }
        let device_id = tables.devices.len() as i64 + 1;
        tables.devices.push(Device {
            device_id,
            name: device.name.clone(),
            description: device.description.clone(),
            created_at: Utc::now(),
        });
        Ok(Some(device_id))
    }

    fn write_sample(&self, batch: &SampleBatch) -> Result<usize, StoreError> {
        self.enter()?;
        let mut tables = self.tables.lock().expect("tables lock");
        if !tables.devices.iter().any(|d| d.device_id == batch.metric.device_id) {
            return Err(StoreError::Query(DieselError::NotFound));
        }

        // Stage against a copy; only a fully successful batch replaces the tables.
        let mut staged = tables.clone();
        staged.metrics.push(batch.metric.clone());
        staged.events.push(batch.event.clone());
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Query(DieselError::RollbackTransaction));
        }
        for anomaly in &batch.anomalies {
            let known = [
                event_types::DROP,
                event_types::STALL,
                event_types::OVERSHOOT,
                event_types::ENCODER_FAULT,
            ];
            if !known.contains(&anomaly.event_type.as_str()) {
                return Err(StoreError::Query(DieselError::RollbackTransaction));
            }
            staged.anomalies.push(anomaly.clone());
        }

        *tables = staged;
        Ok(2 + batch.anomalies.len())
    }
}
