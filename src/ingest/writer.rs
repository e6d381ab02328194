use crate::db::models::{NewAnomalyEvent, NewTelemetryEvent, NewTelemetryMetric, SampleBatch};
use crate::db::store::{StoreError, TelemetryStore};
use crate::ingest::classify::{AnomalyFlags, AnomalyKind};
use crate::ingest::decode::TelemetryPacket;
use crate::utils::fmt_reading;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Human-readable description of a raised flag, with the readings that explain it.
pub fn anomaly_message(kind: AnomalyKind, packet: &TelemetryPacket) -> String {
    let rpm = fmt_reading(packet.rpm);
    let target = fmt_reading(packet.target_rpm);
    let pwm = fmt_reading(packet.pwm);
    match kind {
        AnomalyKind::Drop => format!("Sudden RPM drop detected (rpm={rpm}, target={target})"),
        AnomalyKind::Stall => format!("Possible stall / high load (rpm={rpm}, pwm={pwm})"),
        AnomalyKind::Overshoot => format!("RPM overshoot (rpm={rpm}, target={target})"),
        AnomalyKind::EncoderFault => format!(
            "Encoder not updating while PWM={pwm}, delta_counts={}",
            fmt_reading(packet.delta_counts)
        ),
    }
}

/// Assemble every row one message produces. All rows share `now` as their write time.
pub fn build_batch(
    device_id: i64,
    packet: &TelemetryPacket,
    raw: Value,
    flags: &AnomalyFlags,
    now: DateTime<Utc>,
) -> SampleBatch {
    let metric = NewTelemetryMetric {
        device_id,
        timestamp: now,
        target_rpm: packet.target_rpm,
        rpm: packet.rpm,
        deviation_rpm: packet.deviation_rpm,
        deviation_pct: packet.deviation_pct,
        pwm: packet.pwm,
        duty_pct: packet.duty_pct,
        delta_counts: packet.delta_counts,
        sudden_drop: flags.sudden_drop,
        stall: flags.stall,
        overshoot: flags.overshoot,
        encoder_fault: flags.encoder_fault,
    };

    let event = NewTelemetryEvent {
        device_id,
        time_s: packet.time_s,
        raw,
        created_at: now,
    };

    let anomalies = flags
        .active()
        .map(|kind| NewAnomalyEvent {
            device_id,
            timestamp: now,
            event_type: kind.event_type().to_string(),
            message: anomaly_message(kind, packet),
        })
        .collect();

    SampleBatch {
        metric,
        event,
        anomalies,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: usize,
    pub anomalies: Vec<AnomalyKind>,
}

pub struct PersistenceWriter {
    store: Arc<dyn TelemetryStore>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        PersistenceWriter { store }
    }

    pub fn write(
        &self,
        device_id: i64,
        packet: &TelemetryPacket,
        raw: Value,
        flags: &AnomalyFlags,
    ) -> Result<WriteSummary, StoreError> {
        let batch = build_batch(device_id, packet, raw, flags, Utc::now());
        let rows = self.store.write_sample(&batch)?;
        Ok(WriteSummary {
            rows,
            anomalies: flags.active().collect(),
        })
    }
}
