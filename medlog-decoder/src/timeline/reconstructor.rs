//! Timeline reconstruction engine
//!
//! Consumes draft events in time order and turns point-in-time device records
//! into a timeline: basal segments get durations and suppressed profiles,
//! boluses are paired with their wizard, suspend/resume pairs become status
//! events. One engine serves every pump family; the differences live behind
//! [`DeviceFamily`].

use crate::config::DecoderConfig;
use crate::timeline::annotations::{self, sourced, Annotations};
use crate::timeline::event::{
    BasalDraft, BolusEvent, DeviceEvent, DeviceEventDetail, DraftEvent, DraftKind, FinalEvent,
    GlucoseDraft, PumpStatus, ReadingEvent, SettingsEvent, SmbgSubType, StatusReason,
    WizardEvent,
};
use crate::timeline::family::DeviceFamily;
use crate::timeline::schedule::{ms_in_day, PumpSettings};
use crate::timeline::segment::{DeliveryType, Segment, SuppressedProfile, MAX_SUPPRESSED_DEPTH};
use crate::types::{DecoderError, DeviceTime, Result, Timestamp};
use chrono::Datelike;

/// Fatal condition that stopped reconstruction
#[derive(Debug, Clone)]
enum Abort {
    Ordering {
        previous: Timestamp,
        offending: Timestamp,
    },
    MissingContext(String),
}

impl Abort {
    fn to_error(&self) -> DecoderError {
        match self {
            Abort::Ordering {
                previous,
                offending,
            } => DecoderError::OrderingViolation {
                previous: *previous,
                offending: *offending,
            },
            Abort::MissingContext(message) => DecoderError::MissingContext(message.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSuspend {
    time: Timestamp,
    device_time: DeviceTime,
    reason: Option<String>,
    cause: Option<String>,
    annotations: Annotations,
}

#[derive(Debug, Clone, Copy)]
struct LastReading {
    time: Timestamp,
    value: f64,
    sub_type: Option<SmbgSubType>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn millis_between(start: Timestamp, end: Timestamp) -> i64 {
    (end - start).num_milliseconds()
}

/// Stateful reconstruction of one device's timeline
///
/// # Example
/// ```no_run
/// use medlog_decoder::{DecoderConfig, DraftEvent, DraftKind, Reconstructor, Tandem};
/// use chrono::NaiveDate;
///
/// let mut engine = Reconstructor::new(Tandem, DecoderConfig::new());
/// let at = NaiveDate::from_ymd_opt(2016, 3, 14).unwrap().and_hms_opt(2, 0, 0).unwrap();
/// engine.submit(DraftEvent::at_local(at, 0, DraftKind::scheduled_basal(0.75, "standard"))).unwrap();
/// let events = engine.finalize().unwrap();
/// ```
pub struct Reconstructor<F: DeviceFamily> {
    family: F,
    config: DecoderConfig,

    current_basal: Option<Segment>,
    pending_bolus: Option<BolusEvent>,
    pending_wizard: Option<WizardEvent>,
    pending_suspend: Option<PendingSuspend>,
    settings: Option<PumpSettings>,
    last_cbg: Option<LastReading>,
    last_smbg: Option<LastReading>,

    output: Vec<FinalEvent>,
    last_time: Option<Timestamp>,
    aborted: Option<Abort>,
}

impl<F: DeviceFamily> Reconstructor<F> {
    pub fn new(family: F, config: DecoderConfig) -> Self {
        Self {
            family,
            config,
            current_basal: None,
            pending_bolus: None,
            pending_wizard: None,
            pending_suspend: None,
            settings: None,
            last_cbg: None,
            last_smbg: None,
            output: Vec::new(),
            last_time: None,
            aborted: None,
        }
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    /// Settings currently in effect
    pub fn settings(&self) -> Option<&PumpSettings> {
        self.settings.as_ref()
    }

    /// Feed the next draft event
    ///
    /// Events must arrive in non-decreasing time order. An out-of-order event
    /// or missing required context aborts reconstruction: this and every later
    /// call fail and nothing is emitted.
    pub fn submit(&mut self, event: DraftEvent) -> Result<()> {
        if let Some(abort) = &self.aborted {
            return Err(abort.to_error());
        }

        if let Some(previous) = self.last_time {
            if event.time < previous {
                return Err(self.abort(Abort::Ordering {
                    previous,
                    offending: event.time,
                }));
            }
        }
        self.last_time = Some(event.time);
        self.flush_pending_before(event.time);

        let DraftEvent {
            time,
            device_time,
            index,
            kind,
            annotations,
        } = event;
        log::trace!("Draft #{} at {}: {:?}", index, time, kind);

        let outcome = match kind {
            DraftKind::Basal(basal) => self.handle_basal(time, device_time, index, basal, annotations),
            DraftKind::Bolus(bolus) => {
                self.handle_bolus(BolusEvent {
                    time,
                    device_time,
                    bolus,
                    annotations,
                });
                Ok(())
            }
            DraftKind::Wizard(wizard) => {
                self.handle_wizard(WizardEvent {
                    time,
                    device_time,
                    wizard,
                    bolus: None,
                    annotations,
                });
                Ok(())
            }
            DraftKind::Cbg(reading) => {
                self.handle_cbg(time, device_time, reading, annotations);
                Ok(())
            }
            DraftKind::Smbg(reading) => {
                self.handle_smbg(time, device_time, reading, annotations);
                Ok(())
            }
            DraftKind::Ketone(reading) => {
                self.output.push(FinalEvent::BloodKetone(ReadingEvent {
                    time,
                    device_time,
                    reading,
                    annotations,
                }));
                Ok(())
            }
            DraftKind::Suspend(status) => {
                self.handle_suspend(time, device_time, index, status.reason, annotations)
            }
            DraftKind::Resume(status) => {
                self.handle_resume(time, device_time, index, status.reason, annotations);
                Ok(())
            }
            DraftKind::Alarm(alarm) => {
                if let Some(suspend) = self.pending_suspend.as_mut() {
                    if suspend.cause.is_none() && self.family.is_suspend_cause(&alarm.alarm_type) {
                        suspend.cause = Some(alarm.alarm_type.clone());
                    }
                }
                self.push_device_event(
                    time,
                    device_time,
                    DeviceEventDetail::Alarm {
                        alarm_type: alarm.alarm_type,
                    },
                    annotations,
                );
                Ok(())
            }
            DraftKind::Settings(settings) => {
                self.handle_settings(time, device_time, settings, annotations);
                Ok(())
            }
            DraftKind::TimeChange(change) => {
                self.push_device_event(
                    time,
                    device_time,
                    DeviceEventDetail::TimeChange { change },
                    annotations,
                );
                Ok(())
            }
        };

        match outcome {
            Err(DecoderError::MissingContext(message)) => {
                Err(self.abort(Abort::MissingContext(message)))
            }
            other => other,
        }
    }

    /// Close everything still open and return the timeline
    ///
    /// Drops zero boluses nobody programmed and events dated at or before
    /// the configured year threshold, then stable-sorts by time. The engine
    /// is empty afterwards and can take a new device.
    pub fn finalize(&mut self) -> Result<Vec<FinalEvent>> {
        if let Some(abort) = &self.aborted {
            return Err(abort.to_error());
        }

        if let Some(current) = self.current_basal.take() {
            self.close_final_basal(current);
        }
        if let Some(bolus) = self.pending_bolus.take() {
            self.output.push(FinalEvent::Bolus(bolus));
        }
        if let Some(wizard) = self.pending_wizard.take() {
            self.emit_wizard(wizard);
        }
        if let Some(suspend) = self.pending_suspend.take() {
            let mut annotations = suspend.annotations;
            annotations.push(annotations::INCOMPLETE_TUPLE);
            self.push_device_event(
                suspend.time,
                suspend.device_time,
                DeviceEventDetail::Status {
                    status: PumpStatus::Suspended,
                    duration: None,
                    reason: StatusReason {
                        suspended: Some(suspend.reason.unwrap_or_else(|| "manual".into())),
                        resumed: None,
                    },
                    cause: suspend.cause,
                },
                annotations,
            );
        }

        let year_threshold = self.config.year_threshold;
        let emitted = std::mem::take(&mut self.output);
        let total = emitted.len();
        let mut events: Vec<FinalEvent> = emitted
            .into_iter()
            .filter(|event| {
                if event.time().year() <= year_threshold {
                    log::debug!("Dropping {} dated {}", event.type_name(), event.time());
                    return false;
                }
                if event.is_empty_bolus() {
                    log::debug!("Dropping zero {} at {}", event.type_name(), event.time());
                    return false;
                }
                true
            })
            .collect();
        events.sort_by_key(|event| event.time());

        log::info!(
            "Reconstructed {} events ({} filtered)",
            events.len(),
            total - events.len()
        );

        self.settings = None;
        self.last_cbg = None;
        self.last_smbg = None;
        self.last_time = None;
        Ok(events)
    }

    fn abort(&mut self, abort: Abort) -> DecoderError {
        let error = abort.to_error();
        log::error!("Timeline reconstruction aborted: {}", error);
        self.output.clear();
        self.current_basal = None;
        self.pending_bolus = None;
        self.pending_wizard = None;
        self.pending_suspend = None;
        self.aborted = Some(abort);
        error
    }

    fn flush_pending_before(&mut self, time: Timestamp) {
        if self.pending_bolus.as_ref().map_or(false, |bolus| bolus.time < time) {
            if let Some(bolus) = self.pending_bolus.take() {
                self.output.push(FinalEvent::Bolus(bolus));
            }
        }
        if self.pending_wizard.as_ref().map_or(false, |wizard| wizard.time < time) {
            if let Some(wizard) = self.pending_wizard.take() {
                self.emit_wizard(wizard);
            }
        }
    }

    // Basal

    fn handle_basal(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        index: u64,
        draft: BasalDraft,
        annotations: Annotations,
    ) -> Result<()> {
        if draft.is_cancel() {
            self.cancel_temp(time, device_time, index);
            return Ok(());
        }

        let mut overridden = None;
        if let Some(current) = self.current_basal.take() {
            if current.start_time == time {
                log::debug!("Basal at {} replaces the segment opened at the same time", time);
                overridden = current.suppressed;
            } else {
                let (last, ended_early) = self.close_basal(current, time);
                if ended_early {
                    overridden = last.suppressed.clone().or_else(|| Some(last.profile()));
                } else {
                    overridden = Some(last.profile());
                }
            }
        }

        if let Some(segment) = self.open_segment(time, device_time, index, draft, overridden, annotations)? {
            self.current_basal = Some(segment);
        }
        Ok(())
    }

    /// End the running temp and go back to what it suppressed
    fn cancel_temp(&mut self, time: Timestamp, device_time: DeviceTime, index: u64) {
        let Some(current) = self.current_basal.take() else {
            log::debug!("Ignoring temp basal cancel at {}: no basal running", time);
            return;
        };
        if current.delivery_type != DeliveryType::Temp {
            log::debug!(
                "Ignoring temp basal cancel at {}: {:?} basal running",
                time,
                current.delivery_type
            );
            self.current_basal = Some(current);
            return;
        }

        log::debug!("Temp basal cancelled at {}", time);
        let suppressed = if current.start_time == time {
            current.suppressed
        } else {
            let (last, _) = self.close_basal(current, time);
            last.suppressed
        };
        self.current_basal = suppressed.and_then(|profile| self.restore(profile, time, device_time, index));
    }

    /// Segment resuming `profile` at `time`, annotated as fabricated
    ///
    /// A temp is only resumed while its programmed duration lasts, and then
    /// for the remainder of it.
    fn restore(
        &self,
        profile: SuppressedProfile,
        time: Timestamp,
        device_time: DeviceTime,
        index: u64,
    ) -> Option<Segment> {
        let Some(profile) = profile.resumable_at(time) else {
            log::debug!("Nothing to resume at {}", time);
            return None;
        };
        let mut restored = Segment::new(time, device_time, profile.delivery_type);
        restored.index = index;
        restored.rate = profile.rate;
        restored.percent = profile.percent;
        restored.programmed_duration = profile.remaining_at(time);
        restored.schedule_name = profile.schedule_name;
        restored.suppressed = profile.suppressed.map(|inner| *inner);
        restored.annotations.push(sourced(
            self.family.source(),
            annotations::sourced::FABRICATED_FROM_SUPPRESSED,
        ));
        Some(restored)
    }

    fn open_segment(
        &self,
        time: Timestamp,
        device_time: DeviceTime,
        index: u64,
        draft: BasalDraft,
        overridden: Option<SuppressedProfile>,
        annotations: Annotations,
    ) -> Result<Option<Segment>> {
        let mut segment = Segment::new(time, device_time, draft.delivery_type);
        segment.index = index;
        segment.annotations = annotations;
        segment.schedule_name = draft.schedule_name;

        match draft.delivery_type {
            DeliveryType::Scheduled => {
                if segment.schedule_name.is_none() {
                    segment.schedule_name =
                        self.settings.as_ref().map(|settings| settings.active_schedule.clone());
                }
                segment.rate = match draft.rate {
                    Some(rate) => Some(rate),
                    None => self
                        .scheduled_profile_at(&device_time, segment.schedule_name.as_deref())
                        .and_then(|profile| profile.rate),
                };
                if segment.rate.is_none() {
                    return Err(DecoderError::MissingContext(format!(
                        "scheduled basal at {} has no rate and no schedule to look it up",
                        time
                    )));
                }
            }
            DeliveryType::Temp => {
                let base = match overridden {
                    Some(profile) if profile.delivery_type == DeliveryType::Scheduled => Some(profile),
                    Some(profile) => profile.suppressed.map(|inner| *inner),
                    None => None,
                }
                .or_else(|| self.scheduled_profile_at(&device_time, None));

                segment.percent = draft.percent;
                segment.rate = match (draft.rate, draft.percent) {
                    (Some(rate), _) => Some(rate),
                    (None, Some(percent)) => match base.as_ref().and_then(|profile| profile.rate) {
                        Some(base_rate) => Some(base_rate * percent),
                        None => {
                            log::warn!(
                                "Dropping percent temp basal at {}: no scheduled rate to apply it to",
                                time
                            );
                            return Ok(None);
                        }
                    },
                    (None, None) => {
                        return Err(DecoderError::MissingContext(format!(
                            "temp basal at {} has neither rate nor percent",
                            time
                        )));
                    }
                };
                segment.programmed_duration = draft.duration;
                segment.suppressed = base;
            }
            DeliveryType::Suspend => {
                segment.rate = draft.rate;
                segment.programmed_duration = draft.duration;
                segment.suppressed =
                    overridden.or_else(|| self.scheduled_profile_at(&device_time, None));
            }
        }

        segment.suppressed = segment
            .suppressed
            .map(|profile| profile.truncated(MAX_SUPPRESSED_DEPTH));
        Ok(Some(segment))
    }

    fn scheduled_profile_at(
        &self,
        device_time: &DeviceTime,
        schedule_name: Option<&str>,
    ) -> Option<SuppressedProfile> {
        let settings = self.settings.as_ref()?;
        let schedule = self.family.schedule(settings, schedule_name)?;
        let rate = schedule.rate_at(ms_in_day(device_time))?;
        let name = schedule_name.unwrap_or(&settings.active_schedule);
        Some(SuppressedProfile::scheduled(rate, Some(name.to_string())))
    }

    /// Close a segment at `end` and emit it
    ///
    /// Returns the last emitted piece and whether the segment's programmed
    /// duration ran out before `end`.
    fn close_basal(&mut self, mut segment: Segment, end: Timestamp) -> (Segment, bool) {
        let gap = millis_between(segment.start_time, end);
        let mut ended_early = false;
        match segment.programmed_duration {
            Some(programmed) if programmed > gap => {
                segment.expected_duration = Some(programmed);
                segment.duration = Some(gap);
            }
            Some(programmed) if programmed < gap => {
                log::debug!(
                    "{:?} basal at {} ended {} ms before the next event",
                    segment.delivery_type,
                    segment.start_time,
                    gap - programmed
                );
                segment.duration = Some(programmed);
                segment.annotations.push(annotations::UNKNOWN_DURATION);
                ended_early = true;
            }
            _ => segment.duration = Some(gap),
        }

        let (earlier, last) = self.split_at_schedule_changes(segment);
        for piece in earlier {
            self.emit_basal(piece);
        }
        self.emit_basal(last.clone());
        (last, ended_early)
    }

    fn close_final_basal(&mut self, mut segment: Segment) {
        if segment.delivery_type != DeliveryType::Scheduled {
            match segment.programmed_duration {
                Some(programmed) => {
                    segment.duration = Some(programmed);
                    let (earlier, last) = self.split_at_schedule_changes(segment);
                    for piece in earlier {
                        self.emit_basal(piece);
                    }
                    self.emit_basal(last);
                }
                None => {
                    segment.duration = Some(0);
                    segment.annotations.push(annotations::UNKNOWN_DURATION);
                    self.emit_basal(segment);
                }
            }
            return;
        }

        let ms = ms_in_day(&segment.device_time);
        let entry = self
            .settings
            .as_ref()
            .and_then(|settings| self.family.schedule(settings, segment.schedule_name.as_deref()))
            .and_then(|schedule| {
                schedule
                    .entry_at(ms)
                    .map(|(i, entry)| (entry.rate, schedule.next_start(i)))
            });

        match entry {
            Some((rate, next_start)) if Some(round3(rate)) == segment.rate.map(round3) => {
                segment.duration = Some(next_start - ms);
                segment.annotations.push(annotations::FINAL_BASAL_FROM_SCHEDULE);
            }
            Some(_) => {
                segment.duration = Some(0);
                segment
                    .annotations
                    .push(sourced(self.family.source(), annotations::sourced::OFF_SCHEDULE_RATE));
                segment.annotations.push(annotations::UNKNOWN_DURATION);
            }
            None => {
                segment.duration = Some(0);
                segment.annotations.push(annotations::UNKNOWN_DURATION);
            }
        }
        self.emit_basal(segment);
    }

    /// Split a temp or suspend at schedule starts strictly inside it
    ///
    /// Only starts that change the suppressed scheduled rate cause a split.
    /// Later pieces carry the new scheduled rate in their suppressed profile.
    /// Returns the pieces before the last one, and the last one.
    fn split_at_schedule_changes(&self, segment: Segment) -> (Vec<Segment>, Segment) {
        let duration = match segment.duration {
            Some(duration) if duration > 0 => duration,
            _ => return (Vec::new(), segment),
        };
        if segment.delivery_type == DeliveryType::Scheduled {
            return (Vec::new(), segment);
        }
        let Some(settings) = self.settings.as_ref() else {
            return (Vec::new(), segment);
        };
        let Some(base) = segment
            .suppressed
            .as_ref()
            .and_then(|profile| profile.base_scheduled())
        else {
            return (Vec::new(), segment);
        };
        let Some(schedule) = self.family.schedule(settings, base.schedule_name.as_deref()) else {
            return (Vec::new(), segment);
        };

        let source = self.family.source();
        let schedule_name = base.schedule_name.clone();
        let mut base_rate = base.rate;
        let boundaries = schedule.boundaries_within(ms_in_day(&segment.device_time), duration);

        let mut pieces = Vec::new();
        let mut current = segment;
        let mut consumed = 0;
        for (offset, entry) in boundaries {
            if base_rate.map(round3) == Some(round3(entry.rate)) {
                continue;
            }

            let local_offset = offset - consumed;
            let mut later = current.split_off(local_offset);
            later.duration = Some(duration - offset);
            later.expected_duration = current.expected_duration.map(|expected| expected - local_offset);
            current.duration = Some(local_offset);
            current.expected_duration = None;
            if current.annotations.remove(annotations::UNKNOWN_DURATION) {
                later.annotations.push(annotations::UNKNOWN_DURATION);
            }

            let mut scheduled = SuppressedProfile::scheduled(entry.rate, schedule_name.clone());
            scheduled
                .annotations
                .push(sourced(source, annotations::sourced::FABRICATED_FROM_SCHEDULE));
            later.suppressed = current
                .suppressed
                .as_ref()
                .map(|profile| profile.rebased(&scheduled));
            if let Some(percent) = later.percent {
                later.rate = Some(entry.rate * percent);
            }
            later
                .annotations
                .push(sourced(source, annotations::sourced::FABRICATED_FROM_SCHEDULE));

            log::debug!(
                "Split {:?} basal at schedule change {} ms after {}",
                current.delivery_type,
                local_offset,
                current.start_time
            );
            pieces.push(current);
            current = later;
            consumed = offset;
            base_rate = Some(entry.rate);
        }
        (pieces, current)
    }

    fn emit_basal(&mut self, mut segment: Segment) {
        if let Some(duration) = segment.duration {
            if duration > self.config.flat_rate_limit_ms {
                log::debug!(
                    "Truncating {} ms basal at {} to the flat-rate limit",
                    duration,
                    segment.start_time
                );
                segment.duration = Some(self.config.flat_rate_limit_ms);
                segment
                    .annotations
                    .push(sourced(self.family.source(), annotations::sourced::FLAT_RATE));
            }
        }
        self.output.push(FinalEvent::Basal(segment));
    }

    // Suspend and resume

    fn handle_suspend(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        index: u64,
        reason: Option<String>,
        annotations: Annotations,
    ) -> Result<()> {
        if self.pending_suspend.is_some() {
            log::debug!("Ignoring repeated suspend at {}", time);
            return Ok(());
        }
        self.pending_suspend = Some(PendingSuspend {
            time,
            device_time,
            reason,
            cause: None,
            annotations,
        });

        let already_suspended = self
            .current_basal
            .as_ref()
            .map_or(false, |segment| segment.delivery_type == DeliveryType::Suspend);
        if already_suspended {
            return Ok(());
        }

        let draft = BasalDraft {
            delivery_type: DeliveryType::Suspend,
            rate: None,
            percent: None,
            duration: None,
            schedule_name: None,
        };
        self.handle_basal(time, device_time, index, draft, Annotations::new())
    }

    fn handle_resume(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        index: u64,
        reason: Option<String>,
        annotations: Annotations,
    ) {
        let resumed = Some(reason.unwrap_or_else(|| "manual".into()));
        match self.pending_suspend.take() {
            Some(suspend) => {
                let mut merged = suspend.annotations;
                merged.extend(annotations);
                self.push_device_event(
                    suspend.time,
                    suspend.device_time,
                    DeviceEventDetail::Status {
                        status: PumpStatus::Suspended,
                        duration: Some(millis_between(suspend.time, time)),
                        reason: StatusReason {
                            suspended: Some(suspend.reason.unwrap_or_else(|| "manual".into())),
                            resumed,
                        },
                        cause: suspend.cause,
                    },
                    merged,
                );
            }
            None => {
                log::debug!("Resume at {} without a preceding suspend", time);
                self.push_device_event(
                    time,
                    device_time,
                    DeviceEventDetail::Status {
                        status: PumpStatus::Resumed,
                        duration: None,
                        reason: StatusReason {
                            suspended: None,
                            resumed,
                        },
                        cause: None,
                    },
                    annotations,
                );
            }
        }

        let Some(current) = self.current_basal.take() else {
            return;
        };
        if current.delivery_type != DeliveryType::Suspend {
            self.current_basal = Some(current);
            return;
        }

        let (last, _) = self.close_basal(current, time);
        self.current_basal = last
            .suppressed
            .and_then(|profile| self.restore(profile, time, device_time, index));
    }

    fn push_device_event(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        detail: DeviceEventDetail,
        annotations: Annotations,
    ) {
        self.output.push(FinalEvent::DeviceEvent(DeviceEvent {
            time,
            device_time,
            detail,
            annotations,
        }));
    }

    // Bolus and wizard

    fn handle_bolus(&mut self, bolus: BolusEvent) {
        if let Some(mut wizard) = self.pending_wizard.take() {
            if wizard.time == bolus.time {
                wizard.bolus = Some(bolus);
                self.emit_wizard(wizard);
                return;
            }
            self.emit_wizard(wizard);
        }
        if let Some(previous) = self.pending_bolus.replace(bolus) {
            self.output.push(FinalEvent::Bolus(previous));
        }
    }

    fn handle_wizard(&mut self, mut wizard: WizardEvent) {
        if let Some(bolus) = self.pending_bolus.take() {
            if bolus.time == wizard.time {
                wizard.bolus = Some(bolus);
                self.emit_wizard(wizard);
                return;
            }
            self.output.push(FinalEvent::Bolus(bolus));
        }
        if let Some(previous) = self.pending_wizard.replace(wizard) {
            log::debug!("Wizard at {} has no matching bolus", previous.time);
            self.emit_wizard(previous);
        }
    }

    fn emit_wizard(&mut self, mut wizard: WizardEvent) {
        if self.settings.as_ref().map_or(false, |settings| settings.uses_exchanges()) {
            wizard.wizard.carb_input = wizard.wizard.carb_input.map(|carbs| (carbs * 15.0).round());
            wizard.wizard.insulin_carb_ratio = wizard
                .wizard
                .insulin_carb_ratio
                .filter(|ratio| *ratio > 0.0)
                .map(|ratio| (15.0 / ratio).round());
        }
        self.output.push(FinalEvent::Wizard(wizard));
    }

    // Readings and settings

    fn handle_cbg(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        reading: GlucoseDraft,
        annotations: Annotations,
    ) {
        if let (Some(window), Some(last)) =
            (self.family.cbg_dedupe_window_ms(&self.config), self.last_cbg)
        {
            if last.value == reading.value && millis_between(last.time, time) < window {
                log::trace!("Dropping repeated CGM value {} at {}", reading.value, time);
                return;
            }
        }
        self.last_cbg = Some(LastReading {
            time,
            value: reading.value,
            sub_type: None,
        });
        self.output.push(FinalEvent::Cbg(ReadingEvent {
            time,
            device_time,
            reading,
            annotations,
        }));
    }

    fn handle_smbg(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        reading: GlucoseDraft,
        annotations: Annotations,
    ) {
        if reading.sub_type == Some(SmbgSubType::Manual) {
            if let Some(last) = self.last_smbg {
                if last.sub_type == Some(SmbgSubType::Linked)
                    && last.value == reading.value
                    && millis_between(last.time, time) <= self.config.smbg_dedupe_window_ms
                {
                    log::debug!("Dropping manual entry of linked reading {} at {}", reading.value, time);
                    return;
                }
            }
        }
        self.last_smbg = Some(LastReading {
            time,
            value: reading.value,
            sub_type: reading.sub_type,
        });
        self.output.push(FinalEvent::Smbg(ReadingEvent {
            time,
            device_time,
            reading,
            annotations,
        }));
    }

    fn handle_settings(
        &mut self,
        time: Timestamp,
        device_time: DeviceTime,
        mut settings: PumpSettings,
        annotations: Annotations,
    ) {
        if let Some(previous) = self.settings.as_ref() {
            settings.fill_forward(previous);
        }
        self.output.push(FinalEvent::PumpSettings(SettingsEvent {
            time,
            device_time,
            settings: settings.clone(),
            annotations,
        }));
        self.settings = Some(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::event::{BolusDraft, WizardDraft};
    use crate::timeline::family::{Medtronic, Tandem};
    use crate::timeline::schedule::{BasalSchedule, ScheduleEntry};
    use chrono::{Duration, NaiveDate};

    const MINUTE: i64 = 60 * 1000;
    const HOUR: i64 = 60 * MINUTE;

    fn local(hour: u32, minute: u32) -> DeviceTime {
        NaiveDate::from_ymd_opt(2016, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn draft(hour: u32, minute: u32, kind: DraftKind) -> DraftEvent {
        DraftEvent::at_local(local(hour, minute), 0, kind)
    }

    fn settings(entries: &[(i64, f64)]) -> DraftEvent {
        let schedule = BasalSchedule::new(
            entries
                .iter()
                .map(|&(start, rate)| ScheduleEntry { start, rate })
                .collect(),
        );
        draft(
            0,
            0,
            DraftKind::settings(PumpSettings::new("standard").with_schedule("standard", schedule)),
        )
    }

    fn basals(events: &[FinalEvent]) -> Vec<&Segment> {
        events.iter().filter_map(FinalEvent::as_basal).collect()
    }

    fn run<F: DeviceFamily>(family: F, drafts: Vec<DraftEvent>) -> Vec<FinalEvent> {
        let mut engine = Reconstructor::new(family, DecoderConfig::new());
        for draft in drafts {
            engine.submit(draft).unwrap();
        }
        engine.finalize().unwrap()
    }

    #[test]
    fn test_scheduled_duration_from_next_event() {
        let events = run(
            Tandem,
            vec![
                draft(2, 0, DraftKind::scheduled_basal(0.75, "standard")),
                draft(3, 0, DraftKind::scheduled_basal(0.85, "standard")),
            ],
        );
        let basals = basals(&events);
        assert_eq!(basals.len(), 2);
        assert_eq!(basals[0].rate, Some(0.75));
        assert_eq!(basals[0].device_time, local(2, 0));
        assert_eq!(basals[0].duration, Some(HOUR));

        // No schedule to finish the last one from
        assert_eq!(basals[1].duration, Some(0));
        assert!(basals[1].annotations.contains(annotations::UNKNOWN_DURATION));
    }

    #[test]
    fn test_temp_suppresses_scheduled_rate() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.3)]),
                draft(8, 0, DraftKind::scheduled_basal(1.3, "standard")),
                draft(9, 0, DraftKind::temp_basal(1.0, 30 * MINUTE)),
                draft(9, 30, DraftKind::scheduled_basal(1.3, "standard")),
            ],
        );
        let temp = basals(&events)[1];
        assert_eq!(temp.delivery_type, DeliveryType::Temp);
        assert_eq!(temp.duration, Some(30 * MINUTE));
        assert_eq!(temp.expected_duration, None);

        let suppressed = temp.suppressed.as_ref().unwrap();
        assert_eq!(suppressed.delivery_type, DeliveryType::Scheduled);
        assert_eq!(suppressed.rate, Some(1.3));
        assert_eq!(suppressed.schedule_name.as_deref(), Some("standard"));
    }

    #[test]
    fn test_temp_capped_by_next_event() {
        let events = run(
            Tandem,
            vec![
                draft(9, 0, DraftKind::temp_basal(1.0, HOUR)),
                draft(9, 30, DraftKind::scheduled_basal(1.3, "standard")),
            ],
        );
        let temp = basals(&events)[0];
        assert_eq!(temp.duration, Some(30 * MINUTE));
        assert_eq!(temp.expected_duration, Some(HOUR));
    }

    #[test]
    fn test_temp_ending_early_leaves_annotated_gap() {
        let events = run(
            Tandem,
            vec![
                draft(9, 0, DraftKind::temp_basal(1.0, 30 * MINUTE)),
                draft(10, 0, DraftKind::scheduled_basal(1.3, "standard")),
            ],
        );
        let temp = basals(&events)[0];
        assert_eq!(temp.duration, Some(30 * MINUTE));
        assert!(temp.annotations.contains(annotations::UNKNOWN_DURATION));
    }

    #[test]
    fn test_cancel_closes_temp() {
        let events = run(
            Medtronic,
            vec![
                settings(&[(0, 1.0)]),
                draft(9, 0, DraftKind::temp_basal(2.0, HOUR)),
                draft(9, 20, DraftKind::cancel_temp_basal()),
            ],
        );
        let basals = basals(&events);
        assert_eq!(basals.len(), 2);
        assert_eq!(basals[0].duration, Some(20 * MINUTE));
        assert_eq!(basals[0].expected_duration, Some(HOUR));
        assert_eq!(basals[1].delivery_type, DeliveryType::Scheduled);
        assert_eq!(basals[1].device_time, local(9, 20));
        assert_eq!(basals[1].rate, Some(1.0));
    }

    #[test]
    fn test_cancel_resumes_suppressed_schedule_without_gap() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0)]),
                draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(9, 0, DraftKind::temp_basal(3.0, HOUR)),
                draft(9, 20, DraftKind::cancel_temp_basal()),
                draft(11, 0, DraftKind::scheduled_basal(1.0, "standard")),
            ],
        );
        let basals = basals(&events);
        let types: Vec<DeliveryType> = basals.iter().map(|segment| segment.delivery_type).collect();
        assert_eq!(
            types,
            vec![
                DeliveryType::Scheduled,
                DeliveryType::Temp,
                DeliveryType::Scheduled,
                DeliveryType::Scheduled,
            ]
        );
        for pair in basals.windows(2) {
            assert_eq!(pair[0].end_time(), Some(pair[1].start_time));
        }

        let resumed = basals[2];
        assert_eq!(resumed.device_time, local(9, 20));
        assert_eq!(resumed.duration, Some(100 * MINUTE));
        assert_eq!(resumed.rate, Some(1.0));
        assert!(resumed
            .annotations
            .contains("tandem/basal/fabricated-from-suppressed"));
    }

    #[test]
    fn test_cancel_without_temp_ignored() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0)]),
                draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(9, 0, DraftKind::cancel_temp_basal()),
                draft(10, 0, DraftKind::scheduled_basal(1.0, "standard")),
            ],
        );
        let basals = basals(&events);
        assert_eq!(basals.len(), 2);
        assert_eq!(basals[0].duration, Some(2 * HOUR));
        assert!(basals[0].annotations.is_empty());
    }

    #[test]
    fn test_percent_temp_split_at_schedule_change() {
        let events = run(
            Medtronic,
            vec![
                settings(&[(0, 1.0), (6 * HOUR, 2.0)]),
                draft(5, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(5, 30, DraftKind::percent_temp_basal(0.5, HOUR)),
                draft(6, 30, DraftKind::scheduled_basal(2.0, "standard")),
            ],
        );
        let basals = basals(&events);
        assert_eq!(basals.len(), 4);

        let (first, second) = (basals[1], basals[2]);
        assert_eq!(first.device_time, local(5, 30));
        assert_eq!(first.duration, Some(30 * MINUTE));
        assert_eq!(first.rate, Some(0.5));

        assert_eq!(second.device_time, local(6, 0));
        assert_eq!(second.duration, Some(30 * MINUTE));
        assert_eq!(second.rate, Some(1.0));
        assert!(second
            .annotations
            .contains("medtronic/basal/fabricated-from-schedule"));
        assert_eq!(second.suppressed.as_ref().and_then(|s| s.rate), Some(2.0));
    }

    #[test]
    fn test_no_split_when_scheduled_rate_unchanged() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0), (6 * HOUR, 1.0)]),
                draft(5, 30, DraftKind::temp_basal(0.5, HOUR)),
                draft(6, 30, DraftKind::scheduled_basal(1.0, "standard")),
            ],
        );
        assert_eq!(basals(&events).len(), 2);
    }

    #[test]
    fn test_suspend_over_temp_nests_profile() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 0.8)]),
                draft(8, 0, DraftKind::scheduled_basal(0.8, "standard")),
                draft(9, 0, DraftKind::temp_basal(0.4, 2 * HOUR)),
                draft(9, 30, DraftKind::suspend(None)),
                draft(10, 0, DraftKind::resume(None)),
            ],
        );
        let basals = basals(&events);
        let suspend = basals
            .iter()
            .find(|segment| segment.delivery_type == DeliveryType::Suspend)
            .unwrap();
        let suppressed = suspend.suppressed.as_ref().unwrap();
        assert_eq!(suppressed.delivery_type, DeliveryType::Temp);
        assert_eq!(suppressed.rate, Some(0.4));
        let nested = suppressed.suppressed.as_ref().unwrap();
        assert_eq!(nested.delivery_type, DeliveryType::Scheduled);
        assert_eq!(nested.rate, Some(0.8));

        // Delivery after the resume is the temp that was interrupted
        let restored = basals.last().unwrap();
        assert_eq!(restored.device_time, local(10, 0));
        assert_eq!(restored.delivery_type, DeliveryType::Temp);
        assert!(restored
            .annotations
            .contains("tandem/basal/fabricated-from-suppressed"));
    }

    #[test]
    fn test_resume_after_temp_ran_out_restores_schedule() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0)]),
                draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(9, 0, DraftKind::temp_basal(3.0, 30 * MINUTE)),
                draft(9, 10, DraftKind::suspend(None)),
                draft(10, 0, DraftKind::resume(None)),
                draft(12, 0, DraftKind::scheduled_basal(1.0, "standard")),
            ],
        );
        let basals = basals(&events);
        let restored = basals
            .iter()
            .find(|segment| segment.device_time == local(10, 0))
            .unwrap();
        assert_eq!(restored.delivery_type, DeliveryType::Scheduled);
        assert_eq!(restored.rate, Some(1.0));
        assert_eq!(restored.duration, Some(2 * HOUR));
        assert!(restored
            .annotations
            .contains("tandem/basal/fabricated-from-suppressed"));
        assert!(basals
            .iter()
            .all(|segment| segment.rate != Some(3.0) || segment.device_time == local(9, 0)));
    }

    #[test]
    fn test_resume_within_temp_restores_remaining_duration() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0)]),
                draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(9, 0, DraftKind::temp_basal(3.0, 2 * HOUR)),
                draft(9, 10, DraftKind::suspend(None)),
                draft(10, 0, DraftKind::resume(None)),
                draft(11, 0, DraftKind::scheduled_basal(1.0, "standard")),
            ],
        );
        let basals = basals(&events);
        let restored = basals
            .iter()
            .find(|segment| segment.device_time == local(10, 0))
            .unwrap();
        assert_eq!(restored.delivery_type, DeliveryType::Temp);
        assert_eq!(restored.rate, Some(3.0));
        assert_eq!(restored.duration, Some(HOUR));
        assert_eq!(restored.expected_duration, None);
        assert!(!restored.annotations.contains(annotations::UNKNOWN_DURATION));
        assert_eq!(restored.suppressed.as_ref().and_then(|s| s.rate), Some(1.0));
    }

    #[test]
    fn test_suspend_over_percent_temp_split_at_schedule_change() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0), (6 * HOUR, 2.0)]),
                draft(5, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(5, 10, DraftKind::percent_temp_basal(0.5, 2 * HOUR)),
                draft(5, 30, DraftKind::suspend(None)),
                draft(6, 30, DraftKind::resume(None)),
            ],
        );
        let basals = basals(&events);
        let suspends: Vec<&Segment> = basals
            .iter()
            .copied()
            .filter(|segment| segment.delivery_type == DeliveryType::Suspend)
            .collect();
        assert_eq!(suspends.len(), 2);

        let before = suspends[0];
        assert_eq!(before.device_time, local(5, 30));
        assert_eq!(before.duration, Some(30 * MINUTE));
        let suppressed = before.suppressed.as_ref().unwrap();
        assert_eq!(suppressed.delivery_type, DeliveryType::Temp);
        assert_eq!(suppressed.rate, Some(0.5));
        assert_eq!(suppressed.base_scheduled().and_then(|s| s.rate), Some(1.0));

        let after = suspends[1];
        assert_eq!(after.device_time, local(6, 0));
        assert_eq!(after.duration, Some(30 * MINUTE));
        assert!(after
            .annotations
            .contains("tandem/basal/fabricated-from-schedule"));
        let suppressed = after.suppressed.as_ref().unwrap();
        assert_eq!(suppressed.delivery_type, DeliveryType::Temp);
        assert_eq!(suppressed.rate, Some(1.0));
        let base = suppressed.base_scheduled().unwrap();
        assert_eq!(base.rate, Some(2.0));
        assert!(base
            .annotations
            .contains("tandem/basal/fabricated-from-schedule"));

        // The temp still had 40 minutes to run at the new scheduled rate
        let restored = basals.last().unwrap();
        assert_eq!(restored.device_time, local(6, 30));
        assert_eq!(restored.delivery_type, DeliveryType::Temp);
        assert_eq!(restored.rate, Some(1.0));
        assert_eq!(restored.duration, Some(40 * MINUTE));
        assert_eq!(restored.suppressed.as_ref().and_then(|s| s.rate), Some(2.0));
    }

    #[test]
    fn test_suspend_status_with_alarm_cause() {
        let events = run(
            Tandem,
            vec![
                draft(8, 0, DraftKind::scheduled_basal(0.8, "standard")),
                draft(9, 0, DraftKind::suspend(Some("automatic".into()))),
                draft(9, 0, DraftKind::alarm("occlusion")),
                draft(9, 5, DraftKind::suspend(None)),
                draft(9, 45, DraftKind::resume(None)),
            ],
        );
        let statuses: Vec<&DeviceEvent> = events
            .iter()
            .filter_map(|event| match event {
                FinalEvent::DeviceEvent(device)
                    if matches!(device.detail, DeviceEventDetail::Status { .. }) =>
                {
                    Some(device)
                }
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 1);
        match &statuses[0].detail {
            DeviceEventDetail::Status {
                status,
                duration,
                reason,
                cause,
            } => {
                assert_eq!(*status, PumpStatus::Suspended);
                assert_eq!(*duration, Some(45 * MINUTE));
                assert_eq!(reason.suspended.as_deref(), Some("automatic"));
                assert_eq!(reason.resumed.as_deref(), Some("manual"));
                assert_eq!(cause.as_deref(), Some("occlusion"));
            }
            other => panic!("unexpected detail {:?}", other),
        }
    }

    #[test]
    fn test_unresumed_suspend_is_incomplete() {
        let events = run(Tandem, vec![draft(9, 0, DraftKind::suspend(None))]);
        let status = events
            .iter()
            .find_map(|event| match event {
                FinalEvent::DeviceEvent(device) => Some(device),
                _ => None,
            })
            .unwrap();
        assert!(status.annotations.contains(annotations::INCOMPLETE_TUPLE));
    }

    #[test]
    fn test_bolus_and_wizard_merge_in_either_order() {
        let events = run(
            Tandem,
            vec![
                draft(8, 0, DraftKind::wizard(Some(45.0))),
                draft(8, 0, DraftKind::bolus(4.5)),
                draft(12, 0, DraftKind::bolus(3.0)),
                draft(12, 0, DraftKind::wizard(Some(30.0))),
            ],
        );
        assert_eq!(events.len(), 2);
        for event in &events {
            match event {
                FinalEvent::Wizard(wizard) => assert!(wizard.bolus.is_some()),
                other => panic!("expected wizard, got {}", other.type_name()),
            }
        }
    }

    #[test]
    fn test_zero_bolus_without_expected_dropped() {
        let mut interrupted = BolusDraft::normal(0.0);
        interrupted.expected_normal = Some(2.0);

        let events = run(
            Tandem,
            vec![
                draft(8, 0, DraftKind::bolus(0.0)),
                draft(9, 0, DraftKind::Bolus(interrupted)),
                draft(10, 0, DraftKind::wizard(Some(20.0))),
                draft(10, 0, DraftKind::bolus(0.0)),
                draft(11, 0, DraftKind::wizard(Some(20.0))),
            ],
        );
        let kinds: Vec<&str> = events.iter().map(FinalEvent::type_name).collect();
        // The interrupted bolus and the lone wizard survive
        assert_eq!(kinds, vec!["bolus", "wizard"]);
        assert_eq!(events[1].time().format("%H").to_string(), "11");
    }

    #[test]
    fn test_exchanges_converted() {
        let mut pump = PumpSettings::new("standard");
        pump.units.carb = Some("exchanges".into());
        let wizard = WizardDraft {
            carb_input: Some(3.0),
            insulin_carb_ratio: Some(1.5),
            ..WizardDraft::default()
        };
        let events = run(
            Medtronic,
            vec![
                draft(7, 0, DraftKind::settings(pump)),
                draft(8, 0, DraftKind::Wizard(wizard)),
            ],
        );
        match &events[1] {
            FinalEvent::Wizard(event) => {
                assert_eq!(event.wizard.carb_input, Some(45.0));
                assert_eq!(event.wizard.insulin_carb_ratio, Some(10.0));
            }
            other => panic!("expected wizard, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_old_events_dropped() {
        let old = NaiveDate::from_ymd_opt(2012, 12, 31)
            .unwrap()
            .and_hms_opt(23, 0, 0)
            .unwrap();
        let events = run(
            Tandem,
            vec![
                DraftEvent::at_local(old, 0, DraftKind::smbg(120.0, "mg/dL", None)),
                draft(8, 0, DraftKind::smbg(110.0, "mg/dL", None)),
            ],
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_ordering_violation_is_fatal() {
        let mut engine = Reconstructor::new(Tandem, DecoderConfig::new());
        engine.submit(draft(9, 0, DraftKind::bolus(1.0))).unwrap();

        let err = engine.submit(draft(8, 0, DraftKind::bolus(1.0))).unwrap_err();
        assert!(matches!(err, DecoderError::OrderingViolation { .. }));

        assert!(engine.submit(draft(10, 0, DraftKind::bolus(1.0))).is_err());
        assert!(matches!(
            engine.finalize(),
            Err(DecoderError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn test_missing_schedule_is_fatal() {
        let mut engine = Reconstructor::new(Medtronic, DecoderConfig::new());
        let draft = draft(
            9,
            0,
            DraftKind::Basal(BasalDraft {
                delivery_type: DeliveryType::Scheduled,
                rate: None,
                percent: None,
                duration: None,
                schedule_name: None,
            }),
        );
        assert!(matches!(
            engine.submit(draft),
            Err(DecoderError::MissingContext(_))
        ));
        assert!(engine.finalize().is_err());
    }

    #[test]
    fn test_flat_rate_truncated() {
        let start = draft(8, 0, DraftKind::scheduled_basal(1.0, "standard"));
        let mut later = draft(8, 0, DraftKind::scheduled_basal(1.2, "standard"));
        later.time = later.time + Duration::days(6);
        later.device_time = later.device_time + Duration::days(6);

        let events = run(Tandem, vec![start, later]);
        let first = basals(&events)[0];
        assert_eq!(first.duration, Some(5 * 24 * HOUR));
        assert!(first.annotations.contains("tandem/basal/flat-rate"));
    }

    #[test]
    fn test_final_basal_from_schedule() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 0.8), (6 * HOUR, 1.0)]),
                draft(4, 0, DraftKind::scheduled_basal(0.8, "standard")),
            ],
        );
        let last = basals(&events)[0];
        assert_eq!(last.duration, Some(2 * HOUR));
        assert!(last.annotations.contains(annotations::FINAL_BASAL_FROM_SCHEDULE));

        let events = run(
            Tandem,
            vec![
                settings(&[(0, 0.8)]),
                draft(4, 0, DraftKind::scheduled_basal(0.9, "standard")),
            ],
        );
        let last = basals(&events)[0];
        assert_eq!(last.duration, Some(0));
        assert!(last.annotations.contains("tandem/basal/off-schedule-rate"));
    }

    #[test]
    fn test_same_time_basal_replaces_open_segment() {
        let events = run(
            Tandem,
            vec![
                settings(&[(0, 1.0)]),
                draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")),
                draft(9, 0, DraftKind::scheduled_basal(1.0, "standard")),
            ],
        );
        let basals = basals(&events);
        assert_eq!(basals.len(), 2);
        assert_eq!(basals[0].duration, Some(HOUR));
    }

    #[test]
    fn test_cbg_backfill_repeats_dropped() {
        let drafts = vec![
            draft(8, 0, DraftKind::cbg(140.0, "mg/dL")),
            draft(8, 1, DraftKind::cbg(140.0, "mg/dL")),
            draft(8, 5, DraftKind::cbg(140.0, "mg/dL")),
        ];
        assert_eq!(run(Tandem, drafts.clone()).len(), 2);
        assert_eq!(run(Medtronic, drafts).len(), 3);
    }

    #[test]
    fn test_manual_duplicate_of_linked_smbg_dropped() {
        let events = run(
            Medtronic,
            vec![
                draft(8, 0, DraftKind::smbg(120.0, "mg/dL", Some(SmbgSubType::Linked))),
                draft(8, 10, DraftKind::smbg(120.0, "mg/dL", Some(SmbgSubType::Manual))),
                draft(8, 40, DraftKind::smbg(120.0, "mg/dL", Some(SmbgSubType::Manual))),
            ],
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_settings_fill_forward() {
        let mut first = PumpSettings::new("standard");
        first.bolus_amount_maximum = Some(10.0);
        let events = run(
            Tandem,
            vec![
                draft(7, 0, DraftKind::settings(first)),
                draft(8, 0, DraftKind::settings(PumpSettings::new("weekend"))),
            ],
        );
        match &events[1] {
            FinalEvent::PumpSettings(event) => {
                assert_eq!(event.settings.active_schedule, "weekend");
                assert_eq!(event.settings.bolus_amount_maximum, Some(10.0));
            }
            other => panic!("expected settings, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_output_sorted_and_engine_reusable() {
        let mut engine = Reconstructor::new(Tandem, DecoderConfig::new());
        engine
            .submit(draft(8, 0, DraftKind::scheduled_basal(1.0, "standard")))
            .unwrap();
        engine.submit(draft(8, 30, DraftKind::bolus(2.0))).unwrap();
        engine
            .submit(draft(9, 0, DraftKind::scheduled_basal(1.1, "standard")))
            .unwrap();
        let events = engine.finalize().unwrap();
        let times: Vec<Timestamp> = events.iter().map(FinalEvent::time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);

        // A second device starting earlier than the first one ended
        engine.submit(draft(7, 0, DraftKind::bolus(1.0))).unwrap();
        assert_eq!(engine.finalize().unwrap().len(), 1);
    }
}
