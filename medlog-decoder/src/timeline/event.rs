//! Draft and final timeline events
//!
//! Drafts are what a device-specific builder produces from raw records: one
//! point in time, no durations resolved and no pairing done. Final events are
//! what the reconstructor emits once basal durations, bolus/wizard pairs and
//! suspend tuples are known.

use crate::timeline::annotations::Annotations;
use crate::timeline::schedule::PumpSettings;
use crate::timeline::segment::{DeliveryType, Segment};
use crate::types::{device_time_serde, DeviceTime, Timestamp};
use chrono::{Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Basal rate change as recorded by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasalDraft {
    pub delivery_type: DeliveryType,
    /// Units per hour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Fraction of the scheduled rate, for percent temps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Programmed duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
}

impl BasalDraft {
    /// A temp with zero rate and zero duration ends the running temp
    pub fn is_cancel(&self) -> bool {
        self.delivery_type == DeliveryType::Temp
            && self.duration == Some(0)
            && self.rate.unwrap_or(0.0) == 0.0
            && self.percent.unwrap_or(0.0) == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusSubType {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "square")]
    Square,
    #[serde(rename = "dual/square")]
    DualSquare,
}

/// Insulin bolus; amounts in units, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusDraft {
    pub sub_type: BolusSubType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_normal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_extended: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
}

impl BolusDraft {
    pub fn normal(amount: f64) -> Self {
        Self {
            sub_type: BolusSubType::Normal,
            normal: Some(amount),
            expected_normal: None,
            extended: None,
            expected_extended: None,
            duration: None,
            expected_duration: None,
        }
    }

    /// Nothing delivered and nothing programmed: a logging artifact
    pub fn is_empty_artifact(&self) -> bool {
        let delivered = self.normal.unwrap_or(0.0) + self.extended.unwrap_or(0.0);
        delivered == 0.0 && self.expected_normal.is_none() && self.expected_extended.is_none()
    }
}

/// Bolus calculator inputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_input: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_carb_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// How a fingerstick reading reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmbgSubType {
    Manual,
    Linked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseDraft {
    pub value: f64,
    pub units: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<SmbgSubType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmDraft {
    pub alarm_type: String,
}

/// Device clock change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeChangeDraft {
    #[serde(with = "device_time_serde")]
    pub from: DeviceTime,
    #[serde(with = "device_time_serde")]
    pub to: DeviceTime,
    pub agent: String,
}

/// What a draft event describes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DraftKind {
    Basal(BasalDraft),
    Bolus(BolusDraft),
    Wizard(WizardDraft),
    Cbg(GlucoseDraft),
    Smbg(GlucoseDraft),
    Ketone(GlucoseDraft),
    Suspend(StatusDraft),
    Resume(StatusDraft),
    Alarm(AlarmDraft),
    Settings(PumpSettings),
    TimeChange(TimeChangeDraft),
}

impl DraftKind {
    pub fn scheduled_basal(rate: f64, schedule_name: impl Into<String>) -> Self {
        DraftKind::Basal(BasalDraft {
            delivery_type: DeliveryType::Scheduled,
            rate: Some(rate),
            percent: None,
            duration: None,
            schedule_name: Some(schedule_name.into()),
        })
    }

    pub fn temp_basal(rate: f64, duration_ms: i64) -> Self {
        DraftKind::Basal(BasalDraft {
            delivery_type: DeliveryType::Temp,
            rate: Some(rate),
            percent: None,
            duration: Some(duration_ms),
            schedule_name: None,
        })
    }

    /// Temp expressed as a fraction of the scheduled rate
    pub fn percent_temp_basal(percent: f64, duration_ms: i64) -> Self {
        DraftKind::Basal(BasalDraft {
            delivery_type: DeliveryType::Temp,
            rate: None,
            percent: Some(percent),
            duration: Some(duration_ms),
            schedule_name: None,
        })
    }

    pub fn cancel_temp_basal() -> Self {
        Self::temp_basal(0.0, 0)
    }

    pub fn suspended_basal() -> Self {
        DraftKind::Basal(BasalDraft {
            delivery_type: DeliveryType::Suspend,
            rate: None,
            percent: None,
            duration: None,
            schedule_name: None,
        })
    }

    pub fn bolus(normal: f64) -> Self {
        DraftKind::Bolus(BolusDraft::normal(normal))
    }

    pub fn wizard(carb_input: Option<f64>) -> Self {
        DraftKind::Wizard(WizardDraft {
            carb_input,
            ..WizardDraft::default()
        })
    }

    pub fn cbg(value: f64, units: impl Into<String>) -> Self {
        DraftKind::Cbg(GlucoseDraft {
            value,
            units: units.into(),
            sub_type: None,
        })
    }

    pub fn smbg(value: f64, units: impl Into<String>, sub_type: Option<SmbgSubType>) -> Self {
        DraftKind::Smbg(GlucoseDraft {
            value,
            units: units.into(),
            sub_type,
        })
    }

    pub fn ketone(value: f64) -> Self {
        DraftKind::Ketone(GlucoseDraft {
            value,
            units: "mmol/L".into(),
            sub_type: None,
        })
    }

    pub fn suspend(reason: Option<String>) -> Self {
        DraftKind::Suspend(StatusDraft { reason })
    }

    pub fn resume(reason: Option<String>) -> Self {
        DraftKind::Resume(StatusDraft { reason })
    }

    pub fn alarm(alarm_type: impl Into<String>) -> Self {
        DraftKind::Alarm(AlarmDraft {
            alarm_type: alarm_type.into(),
        })
    }

    pub fn settings(settings: PumpSettings) -> Self {
        DraftKind::Settings(settings)
    }

    pub fn time_change(from: DeviceTime, to: DeviceTime) -> Self {
        DraftKind::TimeChange(TimeChangeDraft {
            from,
            to,
            agent: "manual".into(),
        })
    }
}

/// A single device event awaiting reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftEvent {
    pub time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    /// Position in the device log, for tie-breaking and diagnostics
    #[serde(default)]
    pub index: u64,
    #[serde(flatten)]
    pub kind: DraftKind,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl DraftEvent {
    pub fn new(time: Timestamp, device_time: DeviceTime, kind: DraftKind) -> Self {
        Self {
            time,
            device_time,
            index: 0,
            kind,
            annotations: Annotations::new(),
        }
    }

    /// Draft at a device-local time, `offset_minutes` ahead of UTC
    pub fn at_local(device_time: DeviceTime, offset_minutes: i32, kind: DraftKind) -> Self {
        let utc = device_time - Duration::minutes(offset_minutes as i64);
        Self::new(Utc.from_utc_datetime(&utc), device_time, kind)
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub fn annotate(mut self, code: impl Into<String>) -> Self {
        self.annotations.push(code);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusEvent {
    pub time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    #[serde(flatten)]
    pub bolus: BolusDraft,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardEvent {
    pub time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    #[serde(flatten)]
    pub wizard: WizardDraft,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bolus: Option<BolusEvent>,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingEvent {
    pub time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    #[serde(flatten)]
    pub reading: GlucoseDraft,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    Suspended,
    Resumed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReason {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subType", rename_all = "camelCase")]
pub enum DeviceEventDetail {
    Status {
        status: PumpStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<i64>,
        reason: StatusReason,
        /// Alarm that caused the suspension
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
    Alarm {
        #[serde(rename = "alarmType")]
        alarm_type: String,
    },
    TimeChange {
        change: TimeChangeDraft,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    #[serde(flatten)]
    pub detail: DeviceEventDetail,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsEvent {
    pub time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    #[serde(flatten)]
    pub settings: PumpSettings,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// A reconstructed event ready for upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FinalEvent {
    Basal(Segment),
    Bolus(BolusEvent),
    Wizard(WizardEvent),
    Cbg(ReadingEvent),
    Smbg(ReadingEvent),
    BloodKetone(ReadingEvent),
    DeviceEvent(DeviceEvent),
    PumpSettings(SettingsEvent),
}

impl FinalEvent {
    pub fn time(&self) -> Timestamp {
        match self {
            FinalEvent::Basal(segment) => segment.start_time,
            FinalEvent::Bolus(event) => event.time,
            FinalEvent::Wizard(event) => event.time,
            FinalEvent::Cbg(event) | FinalEvent::Smbg(event) | FinalEvent::BloodKetone(event) => {
                event.time
            }
            FinalEvent::DeviceEvent(event) => event.time,
            FinalEvent::PumpSettings(event) => event.time,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FinalEvent::Basal(_) => "basal",
            FinalEvent::Bolus(_) => "bolus",
            FinalEvent::Wizard(_) => "wizard",
            FinalEvent::Cbg(_) => "cbg",
            FinalEvent::Smbg(_) => "smbg",
            FinalEvent::BloodKetone(_) => "bloodKetone",
            FinalEvent::DeviceEvent(_) => "deviceEvent",
            FinalEvent::PumpSettings(_) => "pumpSettings",
        }
    }

    pub fn as_basal(&self) -> Option<&Segment> {
        match self {
            FinalEvent::Basal(segment) => Some(segment),
            _ => None,
        }
    }

    /// Zero boluses with no programmed amount, standalone or inside a wizard
    pub fn is_empty_bolus(&self) -> bool {
        match self {
            FinalEvent::Bolus(event) => event.bolus.is_empty_artifact(),
            FinalEvent::Wizard(event) => event
                .bolus
                .as_ref()
                .map_or(false, |bolus| bolus.bolus.is_empty_artifact()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(hour: u32, minute: u32) -> DeviceTime {
        NaiveDate::from_ymd_opt(2016, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_at_local_applies_offset() {
        let draft = DraftEvent::at_local(local(10, 0), 120, DraftKind::bolus(1.5));
        assert_eq!(draft.time, Utc.with_ymd_and_hms(2016, 3, 14, 8, 0, 0).unwrap());
        assert_eq!(draft.device_time, local(10, 0));
    }

    #[test]
    fn test_cancel_detection() {
        let DraftKind::Basal(cancel) = DraftKind::cancel_temp_basal() else {
            panic!("expected basal");
        };
        assert!(cancel.is_cancel());

        let DraftKind::Basal(temp) = DraftKind::temp_basal(0.0, 1_800_000) else {
            panic!("expected basal");
        };
        assert!(!temp.is_cancel());
    }

    #[test]
    fn test_empty_bolus_artifact() {
        assert!(BolusDraft::normal(0.0).is_empty_artifact());
        assert!(!BolusDraft::normal(0.5).is_empty_artifact());

        let mut interrupted = BolusDraft::normal(0.0);
        interrupted.expected_normal = Some(2.0);
        assert!(!interrupted.is_empty_artifact());
    }

    #[test]
    fn test_draft_json_roundtrip() {
        let json = r#"{
            "time": "2016-03-14T08:00:00Z",
            "deviceTime": "2016-03-14T10:00:00",
            "index": 7,
            "type": "basal",
            "deliveryType": "temp",
            "rate": 1,
            "duration": 1800000
        }"#;
        let draft: DraftEvent = serde_json::from_str(json).unwrap();
        assert_eq!(draft.index, 7);
        assert_eq!(draft.kind, DraftKind::temp_basal(1.0, 1_800_000));

        let text = serde_json::to_string(&draft).unwrap();
        let reparsed: DraftEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed, draft);
    }

    #[test]
    fn test_final_event_tags() {
        let event = FinalEvent::DeviceEvent(DeviceEvent {
            time: Utc.with_ymd_and_hms(2016, 3, 14, 8, 0, 0).unwrap(),
            device_time: local(10, 0),
            detail: DeviceEventDetail::Alarm {
                alarm_type: "occlusion".into(),
            },
            annotations: Annotations::new(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "deviceEvent");
        assert_eq!(value["subType"], "alarm");
        assert_eq!(value["alarmType"], "occlusion");
        assert_eq!(value["deviceTime"], "2016-03-14T10:00:00");
    }
}
