//! Status and fault-flag derivation for a decoded packet.
//!
//! The firmware already evaluates its thresholds; this module trusts the
//! reported flags and only folds them into an overall status.

use crate::db::models::event_types;
use crate::ingest::decode::TelemetryPacket;
use core::fmt;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Alert,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Alert => "ALERT",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    Drop,
    Stall,
    Overshoot,
    EncoderFault,
}

impl AnomalyKind {
    /// Insertion order for anomaly rows.
    pub const ALL: [AnomalyKind; 4] = [
        AnomalyKind::Drop,
        AnomalyKind::Stall,
        AnomalyKind::Overshoot,
        AnomalyKind::EncoderFault,
    ];

    pub fn event_type(&self) -> &'static str {
        match self {
            AnomalyKind::Drop => event_types::DROP,
            AnomalyKind::Stall => event_types::STALL,
            AnomalyKind::Overshoot => event_types::OVERSHOOT,
            AnomalyKind::EncoderFault => event_types::ENCODER_FAULT,
        }
    }
}

impl Display for AnomalyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyFlags {
    pub sudden_drop: bool,
    pub stall: bool,
    pub overshoot: bool,
    pub encoder_fault: bool,
}

impl AnomalyFlags {
    pub fn is_set(&self, kind: AnomalyKind) -> bool {
        match kind {
            AnomalyKind::Drop => self.sudden_drop,
            AnomalyKind::Stall => self.stall,
            AnomalyKind::Overshoot => self.overshoot,
            AnomalyKind::EncoderFault => self.encoder_fault,
        }
    }

    pub fn any(&self) -> bool {
        AnomalyKind::ALL.iter().any(|k| self.is_set(*k))
    }

    /// Raised flags, in insertion order.
    pub fn active(&self) -> impl Iterator<Item = AnomalyKind> + '_ {
        AnomalyKind::ALL.into_iter().filter(|k| self.is_set(*k))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: Status,
    pub flags: AnomalyFlags,
    /// Status text supplied by the device, if any. Logged, never persisted.
    pub reported_status: Option<String>,
}

pub fn classify(packet: &TelemetryPacket) -> Classification {
    let reported = &packet.flags;
    let flags = AnomalyFlags {
        sudden_drop: reported.sudden_drop,
        stall: reported.stall,
        overshoot: reported.overshoot,
        encoder_fault: reported.encoder_fault,
    };

    let status = if reported.status.is_some() || flags.any() {
        Status::Alert
    } else {
        Status::Ok
    };

    Classification {
        status,
        flags,
        reported_status: reported.status.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::decode::FlagSet;

    fn packet_with(flags: FlagSet) -> TelemetryPacket {
        TelemetryPacket {
            rpm: Some(1500.0),
            target_rpm: Some(1500.0),
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn quiet_packet_is_ok() {
        let c = classify(&packet_with(FlagSet::default()));
        assert_eq!(c.status, Status::Ok);
        assert!(!c.flags.any());
        assert_eq!(c.flags.active().count(), 0);
    }

    #[test]
    fn any_flag_raises_alert() {
        for kind in AnomalyKind::ALL {
            let mut flags = FlagSet::default();
            match kind {
                AnomalyKind::Drop => flags.sudden_drop = true,
                AnomalyKind::Stall => flags.stall = true,
                AnomalyKind::Overshoot => flags.overshoot = true,
                AnomalyKind::EncoderFault => flags.encoder_fault = true,
            }
            let c = classify(&packet_with(flags));
            assert_eq!(c.status, Status::Alert, "{kind} should alert");
            assert_eq!(c.flags.active().collect::<Vec<_>>(), vec![kind]);
        }
    }

    #[test]
    fn reported_status_forces_alert() {
        let c = classify(&packet_with(FlagSet {
            status: Some("WARN".into()),
            ..Default::default()
        }));
        assert_eq!(c.status, Status::Alert);
        assert!(!c.flags.any());
        assert_eq!(c.reported_status.as_deref(), Some("WARN"));
    }

    #[test]
    fn classification_is_idempotent() {
        let packet = packet_with(FlagSet {
            stall: true,
            overshoot: true,
            ..Default::default()
        });
        let first = classify(&packet);
        let second = classify(&packet);
        assert_eq!(first, second);
        assert_eq!(
            first.flags.active().collect::<Vec<_>>(),
            vec![AnomalyKind::Stall, AnomalyKind::Overshoot]
        );
    }

    #[test]
    fn thresholds_are_not_recomputed() {
        // Zero rpm under full PWM still classifies OK when the device raised nothing.
        let packet = TelemetryPacket {
            rpm: Some(0.0),
            target_rpm: Some(1500.0),
            pwm: Some(255.0),
            ..Default::default()
        };
        assert_eq!(classify(&packet).status, Status::Ok);
    }
}
