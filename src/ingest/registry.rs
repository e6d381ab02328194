//! Device name → id resolution.
//!
//! The cache only short-circuits lookups; the unique constraint on
//! `devices.name` decides which row wins a concurrent first sighting.

use crate::db::models::NewDevice;
use crate::db::store::{StoreError, TelemetryStore};
use core::fmt;
use dashmap::DashMap;
use log::{debug, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub enum ResolveError {
    Store { name: String, source: StoreError },
    /// Every insert lost a race, yet the winning row never became visible.
    Contended { name: String, attempts: usize },
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Store { name, source } => write!(f, "device '{}': {}", name, source),
            ResolveError::Contended { name, attempts } => {
                write!(f, "device '{}' still unresolved after {} attempt(s)", name, attempts)
            }
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ResolveError::Store { source, .. } => Some(source),
            ResolveError::Contended { .. } => None,
        }
    }
}

pub struct DeviceRegistry {
    store: Arc<dyn TelemetryStore>,
    cache: DashMap<String, i64>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        DeviceRegistry {
            store,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self, name: &str) -> Option<i64> {
        self.cache.get(name).map(|entry| *entry.value())
    }

    pub fn resolve(&self, name: &str) -> Result<i64, ResolveError> {
        if let Some(id) = self.cached(name) {
            return Ok(id);
        }

        let store_err = |source: StoreError| ResolveError::Store {
            name: name.to_string(),
            source,
        };

        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            if let Some(device) = self.store.find_device(name).map_err(store_err)? {
                self.cache.insert(name.to_string(), device.device_id);
                info!("Found device '{}' with id={}", name, device.device_id);
                return Ok(device.device_id);
            }

            match self.store.insert_device(&NewDevice::named(name)).map_err(store_err)? {
                Some(id) => {
                    self.cache.insert(name.to_string(), id);
                    info!("Created device '{}' with id={}", name, id);
                    return Ok(id);
                }
                None => debug!(
                    "Device '{}' was created concurrently (attempt {}); re-reading",
                    name, attempt
                ),
            }
        }

        Err(ResolveError::Contended {
            name: name.to_string(),
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }
}
