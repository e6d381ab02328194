//! Storage seam for the ingester and its PostgreSQL implementation.
//!
//! Every operation checks one connection out of the r2d2 pool and hands it
//! back when the guard drops, including on error paths.

use crate::db::models::{Device, NewDevice, SampleBatch};
use crate::schema;
use core::fmt;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::PgConnection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum StoreError {
    /// No connection could be obtained.
    Connection(String),
    /// A statement failed; any open transaction has been rolled back.
    Query(DieselError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "connection unavailable: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Connection(_) => None,
            StoreError::Query(e) => Some(e),
        }
    }
}

impl From<DieselError> for StoreError {
    fn from(value: DieselError) -> Self {
        StoreError::Query(value)
    }
}

pub trait TelemetryStore: Send + Sync {
    fn find_device(&self, name: &str) -> Result<Option<Device>, StoreError>;

    /// Insert a device unless one with the same name exists.
    ///
    /// Returns the new id, or `None` when the name was already taken (possibly
    /// by a concurrent writer); the caller re-reads in that case.
    fn insert_device(&self, device: &NewDevice) -> Result<Option<i64>, StoreError>;

    /// Commit a sample, its raw event and its anomalies atomically.
    /// Returns the number of rows written.
    fn write_sample(&self, batch: &SampleBatch) -> Result<usize, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Build the bounded pool. Fails if the initial connections cannot be established.
    pub fn connect(database_url: &str, max_size: u32) -> Result<Self, String> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(POOL_CHECKOUT_TIMEOUT)
            .build(manager)
            .map_err(|e| format!("DB connection failed: {}", e))?;
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn checkout(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Connection(e.to_string()))
    }
}

impl TelemetryStore for PgStore {
    fn find_device(&self, name: &str) -> Result<Option<Device>, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.checkout()?;
        D::devices
            .filter(D::name.eq(name))
            .select(Device::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn insert_device(&self, device: &NewDevice) -> Result<Option<i64>, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.checkout()?;
        let inserted = diesel::insert_into(D::devices)
            .values(device)
            .on_conflict(D::name)
            .do_nothing()
            .returning(D::device_id)
            .get_result::<i64>(&mut conn)
            .optional();

        match inserted {
            Ok(id) => Ok(id),
            // Lost a race that ON CONFLICT did not absorb.
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_sample(&self, batch: &SampleBatch) -> Result<usize, StoreError> {
        use schema::anomaly_events::dsl as A;
        use schema::telemetry_events::dsl as E;
        use schema::telemetry_metrics::dsl as M;

        let mut conn = self.checkout()?;
        conn.transaction::<usize, DieselError, _>(|conn| {
            let mut written = diesel::insert_into(M::telemetry_metrics)
                .values(&batch.metric)
                .execute(conn)?;
            written += diesel::insert_into(E::telemetry_events)
                .values(&batch.event)
                .execute(conn)?;
            if !batch.anomalies.is_empty() {
                written += diesel::insert_into(A::anomaly_events)
                    .values(&batch.anomalies)
                    .execute(conn)?;
            }
            Ok(written)
        })
        .map_err(StoreError::from)
    }
}

// These run against a live PostgreSQL and are skipped unless TEST_DATABASE_URL is set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AnomalyEvent, TelemetryEvent, TelemetryMetric};
    use crate::ingest::classify::classify;
    use crate::ingest::decode::TelemetryDecoder;
    use crate::ingest::registry::DeviceRegistry;
    use crate::ingest::writer::build_batch;
    use chrono::Utc;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn test_store() -> Option<PgStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url, 8).expect("connect to TEST_DATABASE_URL");
        let mut conn = store.pool().get().expect("checkout");
        crate::apply_database_migrations(&mut conn).expect("migrations apply");
        Some(store)
    }

    fn unique_name(prefix: &str) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{prefix}-{}-{nanos}", std::process::id())
    }

    fn row_counts(store: &PgStore, device_id: i64) -> (usize, usize, usize) {
        use schema::anomaly_events::dsl as A;
        use schema::telemetry_events::dsl as E;
        use schema::telemetry_metrics::dsl as M;

        let mut conn = store.pool().get().expect("checkout");
        let metrics: Vec<TelemetryMetric> = M::telemetry_metrics
            .filter(M::device_id.eq(device_id))
            .select(TelemetryMetric::as_select())
            .load(&mut conn)
            .expect("load metrics");
        let events: Vec<TelemetryEvent> = E::telemetry_events
            .filter(E::device_id.eq(device_id))
            .select(TelemetryEvent::as_select())
            .load(&mut conn)
            .expect("load events");
        let anomalies: Vec<AnomalyEvent> = A::anomaly_events
            .filter(A::device_id.eq(device_id))
            .select(AnomalyEvent::as_select())
            .load(&mut conn)
            .expect("load anomalies");
        (metrics.len(), events.len(), anomalies.len())
    }

    fn new_device(store: &PgStore, prefix: &str) -> i64 {
        store
            .insert_device(&NewDevice::named(unique_name(prefix)))
            .expect("insert device")
            .expect("fresh name")
    }

    #[test]
    fn stall_packet_writes_one_row_per_table() {
        let Some(store) = test_store() else { return };
        let device_id = new_device(&store, "pg-stall");

        let msg = TelemetryDecoder::default()
            .decode(br#"{"rpm": 5, "pwm": 250, "flags": {"stall": true}}"#)
            .expect("decodes");
        let c = classify(&msg.packet);
        let batch = build_batch(device_id, &msg.packet, msg.raw.clone(), &c.flags, Utc::now());

        assert_eq!(store.write_sample(&batch).expect("write"), 3);
        assert_eq!(row_counts(&store, device_id), (1, 1, 1));

        use schema::anomaly_events::dsl as A;
        let mut conn = store.pool().get().expect("checkout");
        let stored: AnomalyEvent = A::anomaly_events
            .filter(A::device_id.eq(device_id))
            .select(AnomalyEvent::as_select())
            .first(&mut conn)
            .expect("anomaly row");
        assert_eq!(stored.event_type, "STALL");
        assert!(stored.message.contains("rpm=5"));
        assert!(stored.message.contains("pwm=250"));
    }

    #[test]
    fn failed_anomaly_insert_rolls_back_whole_message() {
        let Some(store) = test_store() else { return };
        let device_id = new_device(&store, "pg-atomic");

        let msg = TelemetryDecoder::default()
            .decode(br#"{"rpm": 5, "pwm": 250, "flags": {"stall": true, "overshoot": true}}"#)
            .expect("decodes");
        let c = classify(&msg.packet);
        let mut batch = build_batch(device_id, &msg.packet, msg.raw.clone(), &c.flags, Utc::now());
        // Violates the event_type CHECK constraint after the sample and raw event are inserted.
        batch.anomalies[1].event_type = "NOT_A_TYPE".to_string();

        assert!(matches!(store.write_sample(&batch), Err(StoreError::Query(_))));
        assert_eq!(row_counts(&store, device_id), (0, 0, 0));
    }

    // Points every pooled connection at `schema` via the libpq `options` parameter.
    fn url_with_search_path(url: &str, schema: &str) -> String {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}options=-csearch_path%3D{schema}")
    }

    #[test]
    fn migrations_add_name_uniqueness_to_existing_devices_table() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else { return };
        let schema_name = unique_name("preexisting").replace('-', "_");
        let mut admin = PgConnection::establish(&url).expect("connect");
        diesel::sql_query(format!("CREATE SCHEMA {schema_name}"))
            .execute(&mut admin)
            .expect("create schema");

        let scoped_url = url_with_search_path(&url, &schema_name);
        let store = PgStore::connect(&scoped_url, 2).expect("connect scoped");
        {
            let mut conn = store.pool().get().expect("checkout");
            // Shape of a devices table created before this ingester existed.
            diesel::sql_query(
                "CREATE TABLE devices (
                    device_id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
            )
            .execute(&mut conn)
            .expect("create legacy devices");
            crate::apply_database_migrations(&mut conn).expect("migrations apply");
        }

        let first = store.insert_device(&NewDevice::named("motor-01")).expect("insert");
        let second = store.insert_device(&NewDevice::named("motor-01")).expect("insert");
        let registry = DeviceRegistry::new(Arc::new(store));
        let resolved = registry.resolve("motor-01").expect("resolve");

        diesel::sql_query(format!("DROP SCHEMA {schema_name} CASCADE"))
            .execute(&mut admin)
            .expect("drop schema");

        assert!(first.is_some());
        assert_eq!(second, None);
        assert_eq!(Some(resolved), first);
    }

    #[test]
    fn conflicting_insert_returns_none() {
        let Some(store) = test_store() else { return };
        let name = unique_name("pg-conflict");

        let first = store.insert_device(&NewDevice::named(&name)).expect("insert");
        let second = store.insert_device(&NewDevice::named(&name)).expect("insert");
        assert!(first.is_some());
        assert_eq!(second, None);

        let found = store.find_device(&name).expect("find").expect("exists");
        assert_eq!(Some(found.device_id), first);
        assert_eq!(found.description, "Telemetry device");
    }

    #[test]
    fn concurrent_first_sight_creates_one_device() {
        let Some(store) = test_store() else { return };
        let store: Arc<dyn TelemetryStore> = Arc::new(store);
        let name = unique_name("pg-race");
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                // Separate registries so every thread misses its cache.
                let registry = DeviceRegistry::new(store.clone());
                let barrier = barrier.clone();
                let name = name.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.resolve(&name).expect("resolve")
                })
            })
            .collect();
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().expect("thread")).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "ids diverged: {ids:?}");

        use schema::devices::dsl as D;
        let url = std::env::var("TEST_DATABASE_URL").expect("set");
        let mut conn = PgConnection::establish(&url).expect("connect");
        let count: i64 = D::devices
            .filter(D::name.eq(&name))
            .count()
            .get_result(&mut conn)
            .expect("count");
        assert_eq!(count, 1);
    }
}
