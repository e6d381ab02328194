//! Per-message orchestration: decode, resolve, classify, persist.
//!
//! `handle` never fails. Each drop point logs, bumps a counter, and reports an
//! [`Outcome`] so the caller can move on to the next message.

use crate::db::store::TelemetryStore;
use crate::ingest::classify::{classify, Status};
use crate::ingest::decode::{DecodedMessage, TelemetryDecoder};
use crate::ingest::registry::DeviceRegistry;
use crate::ingest::writer::PersistenceWriter;
use crate::utils::{fmt_reading, payload_preview};
use core::fmt;
use log::{debug, error, info, warn};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Emit a statistics line every this many received messages.
const STATS_LOG_EVERY: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Persisted {
        device_id: i64,
        status: Status,
        anomalies: usize,
    },
    DroppedDecode,
    DroppedResolve,
    DroppedWrite,
}

#[derive(Debug, Default)]
struct IngestStats {
    received: AtomicU64,
    persisted: AtomicU64,
    anomalies: AtomicU64,
    dropped_decode: AtomicU64,
    dropped_resolve: AtomicU64,
    dropped_write: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub anomalies: u64,
    pub dropped_decode: u64,
    pub dropped_resolve: u64,
    pub dropped_write: u64,
    pub panicked: u64,
}

impl Display for StatsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={}, persisted={}, anomalies={}, dropped(decode={}, resolve={}, write={}), panicked={}",
            self.received,
            self.persisted,
            self.anomalies,
            self.dropped_decode,
            self.dropped_resolve,
            self.dropped_write,
            self.panicked
        )
    }
}

pub struct IngestPipeline {
    decoder: TelemetryDecoder,
    registry: DeviceRegistry,
    writer: PersistenceWriter,
    stats: IngestStats,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn TelemetryStore>, default_device_name: impl Into<String>) -> Self {
        IngestPipeline {
            decoder: TelemetryDecoder::new(default_device_name),
            registry: DeviceRegistry::new(store.clone()),
            writer: PersistenceWriter::new(store),
            stats: IngestStats::default(),
        }
    }

    pub fn handle(&self, payload: &[u8]) -> Outcome {
        let received = self.stats.received.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Incoming message ({} bytes): {}", payload.len(), payload_preview(payload));

        let outcome = self.process(payload);
        let counter = match &outcome {
            Outcome::Persisted { anomalies, .. } => {
                self.stats.anomalies.fetch_add(*anomalies as u64, Ordering::Relaxed);
                &self.stats.persisted
            }
            Outcome::DroppedDecode => &self.stats.dropped_decode,
            Outcome::DroppedResolve => &self.stats.dropped_resolve,
            Outcome::DroppedWrite => &self.stats.dropped_write,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if received % STATS_LOG_EVERY == 0 {
            info!("Ingest stats: {}", self.stats());
        }
        outcome
    }

    fn process(&self, payload: &[u8]) -> Outcome {
        let DecodedMessage {
            device_name,
            packet,
            raw,
        } = match self.decoder.decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping message, {} (payload: {})", e, payload_preview(payload));
                return Outcome::DroppedDecode;
            }
        };
        let device_name = device_name.as_str();

        let device_id = match self.registry.resolve(device_name) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to resolve device id, dropping message: {}", e);
                return Outcome::DroppedResolve;
            }
        };

        let classification = classify(&packet);

        match self.writer.write(device_id, &packet, raw, &classification.flags) {
            Ok(summary) => {
                info!(
                    "[{}] Stored telemetry: rpm={}, target={}, pwm={}, status={}",
                    device_name,
                    fmt_reading(packet.rpm),
                    fmt_reading(packet.target_rpm),
                    fmt_reading(packet.pwm),
                    classification.status
                );
                if !summary.anomalies.is_empty() {
                    let kinds = summary.anomalies.iter().map(|k| k.to_string()).collect::<Vec<_>>();
                    info!("[{}] Anomalies recorded: {}", device_name, kinds.join(", "));
                }
                if let Some(reported) = classification.reported_status.as_deref() {
                    debug!("[{}] Device reported status '{}'", device_name, reported);
                }
                Outcome::Persisted {
                    device_id,
                    status: classification.status,
                    anomalies: summary.anomalies.len(),
                }
            }
            Err(e) => {
                error!(
                    "[{}] Database error while storing telemetry for device id={}, rolled back: {}",
                    device_name, device_id, e
                );
                Outcome::DroppedWrite
            }
        }
    }

    /// Called by a worker that caught a panic while handling a message.
    pub fn record_panic(&self) {
        self.stats.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            received: s.received.load(Ordering::Relaxed),
            persisted: s.persisted.load(Ordering::Relaxed),
            anomalies: s.anomalies.load(Ordering::Relaxed),
            dropped_decode: s.dropped_decode.load(Ordering::Relaxed),
            dropped_resolve: s.dropped_resolve.load(Ordering::Relaxed),
            dropped_write: s.dropped_write.load(Ordering::Relaxed),
            panicked: s.panicked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;

    fn pipeline() -> (Arc<MemoryStore>, IngestPipeline) {
        let store = Arc::new(MemoryStore::default());
        let pipeline = IngestPipeline::new(store.clone(), "motor-driver-01");
        (store, pipeline)
    }

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(format!("tests/data/{name}")).expect("fixture present")
    }

    #[test]
    fn normal_packet_writes_sample_and_raw_event_only() {
        let (store, pipeline) = pipeline();
        let outcome = pipeline.handle(&fixture("normal-packet.json"));

        let tables = store.snapshot();
        assert_eq!(tables.devices.len(), 1);
        assert_eq!(tables.devices[0].name, "motor-01");
        assert_eq!(
            outcome,
            Outcome::Persisted {
                device_id: tables.devices[0].device_id,
                status: Status::Ok,
                anomalies: 0
            }
        );
        assert_eq!(tables.metrics.len(), 1);
        assert!(!tables.metrics[0].stall);
        assert!(!tables.metrics[0].encoder_fault);
        assert!(!tables.metrics[0].sudden_drop);
        assert!(!tables.metrics[0].overshoot);
        assert_eq!(tables.metrics[0].rpm, Some(1500.0));
        assert_eq!(tables.events.len(), 1);
        assert_eq!(tables.events[0].time_s, Some(1234.5));
        assert_eq!(tables.events[0].raw["duty_pct"], 47.0);
        assert!(tables.anomalies.is_empty());
    }

    #[test]
    fn stall_packet_records_one_stall_anomaly() {
        let (store, pipeline) = pipeline();
        let outcome = pipeline.handle(&fixture("stall-packet.json"));
        assert!(matches!(
            outcome,
            Outcome::Persisted {
                status: Status::Alert,
                anomalies: 1,
                ..
            }
        ));

        let tables = store.snapshot();
        assert_eq!(tables.metrics.len(), 1);
        assert!(tables.metrics[0].stall);
        assert_eq!(tables.events.len(), 1);
        assert_eq!(tables.anomalies.len(), 1);
        assert_eq!(tables.anomalies[0].event_type, "STALL");
        assert!(tables.anomalies[0].message.contains("rpm=5"));
        assert!(tables.anomalies[0].message.contains("pwm=250"));
        assert_eq!(tables.anomalies[0].device_id, tables.metrics[0].device_id);
    }

    #[test]
    fn missing_device_name_falls_back_to_default() {
        let (store, pipeline) = pipeline();
        let outcome = pipeline.handle(br#"{"rpm": 800, "flags": {}}"#);
        assert!(matches!(outcome, Outcome::Persisted { .. }));

        let tables = store.snapshot();
        assert_eq!(tables.devices.len(), 1);
        assert_eq!(tables.devices[0].name, "motor-driver-01");
        assert_eq!(tables.metrics.len(), 1);
        assert_eq!(tables.metrics[0].rpm, Some(800.0));
    }

    #[test]
    fn malformed_payload_touches_no_storage() {
        let (store, pipeline) = pipeline();
        assert_eq!(pipeline.handle(b"{not valid json"), Outcome::DroppedDecode);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        // Pipeline stays usable.
        assert!(matches!(
            pipeline.handle(&fixture("normal-packet.json")),
            Outcome::Persisted { .. }
        ));
        assert_eq!(store.snapshot().metrics.len(), 1);
    }

    #[test]
    fn multiple_flags_map_to_matching_rows() {
        let (store, pipeline) = pipeline();
        pipeline.handle(br#"{"device_name": "m", "rpm": 10, "flags": {"stall": true, "overshoot": true}}"#);

        let mut types: Vec<String> = store.snapshot().anomalies.into_iter().map(|a| a.event_type).collect();
        types.sort();
        assert_eq!(types, vec!["OVERSHOOT".to_string(), "STALL".to_string()]);
    }

    #[test]
    fn resolution_failure_drops_message() {
        let (store, pipeline) = pipeline();
        store.offline.store(true, Ordering::SeqCst);
        assert_eq!(pipeline.handle(&fixture("normal-packet.json")), Outcome::DroppedResolve);

        store.offline.store(false, Ordering::SeqCst);
        assert!(matches!(
            pipeline.handle(&fixture("normal-packet.json")),
            Outcome::Persisted { .. }
        ));
    }

    #[test]
    fn write_failure_is_atomic_and_not_fatal() {
        let (store, pipeline) = pipeline();
        store.fail_next_write.store(true, Ordering::SeqCst);
        assert_eq!(pipeline.handle(&fixture("stall-packet.json")), Outcome::DroppedWrite);

        let tables = store.snapshot();
        assert_eq!(tables.devices.len(), 1);
        assert!(tables.metrics.is_empty());
        assert!(tables.events.is_empty());
        assert!(tables.anomalies.is_empty());

        assert!(matches!(
            pipeline.handle(&fixture("stall-packet.json")),
            Outcome::Persisted { anomalies: 1, .. }
        ));
    }

    #[test]
    fn duplicate_messages_are_appended_twice() {
        let (store, pipeline) = pipeline();
        pipeline.handle(&fixture("stall-packet.json"));
        pipeline.handle(&fixture("stall-packet.json"));

        let tables = store.snapshot();
        assert_eq!(tables.devices.len(), 1);
        assert_eq!(tables.metrics.len(), 2);
        assert_eq!(tables.anomalies.len(), 2);
    }

    #[test]
    fn stats_count_every_outcome() {
        let (store, pipeline) = pipeline();
        pipeline.handle(&fixture("normal-packet.json"));
        pipeline.handle(&fixture("stall-packet.json"));
        pipeline.handle(b"[]");
        store.fail_next_write.store(true, Ordering::SeqCst);
        pipeline.handle(&fixture("normal-packet.json"));
        pipeline.record_panic();

        assert_eq!(
            pipeline.stats(),
            StatsSnapshot {
                received: 4,
                persisted: 2,
                anomalies: 1,
                dropped_decode: 1,
                dropped_resolve: 0,
                dropped_write: 1,
                panicked: 1,
            }
        );
    }
}
