//! Trigger specifications and next-fire resolution.
//!
//! A [`TriggerSpec`] says *when* a job fires. [`resolve_next`] turns a spec
//! plus a reference instant into the concrete next-fire instant, or `None`
//! when the trigger has no further occurrences.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field positions in a recurrence expression.
const DAY_OF_MONTH_FIELD: usize = 3;
const DAY_OF_WEEK_FIELD: usize = 5;

/// Errors raised while building or resolving a trigger.
///
/// All of these are configuration errors: they surface at schedule-creation
/// time and nothing is persisted when they occur.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// The recurrence expression could not be parsed.
    #[error("invalid cycle expression '{expression}': {reason}")]
    InvalidCycleExpression { expression: String, reason: String },

    /// A duration offset was negative.
    #[error("duration offset must be non-negative, got {offset_ms}ms")]
    NegativeDuration { offset_ms: i64 },

    /// The instant computation overflowed the representable range.
    #[error("trigger instant out of range: {reason}")]
    OutOfRange { reason: String },

    /// A date expression could not be evaluated to an instant.
    #[error("date expression '{expression}' could not be evaluated: {reason}")]
    DateEvaluationFailed { expression: String, reason: String },

    /// The trigger produces no occurrence at all.
    #[error("trigger has no upcoming occurrence")]
    NoOccurrence,

    /// A one-shot trigger was asked for a second occurrence.
    #[error("one-shot {kind} trigger was already consumed")]
    OneShotConsumed { kind: TriggerKind },
}

impl TriggerError {
    /// Create an invalid cycle expression error.
    pub fn invalid_cycle(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCycleExpression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create a date evaluation error.
    pub fn date_evaluation_failed(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DateEvaluationFailed {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create an out of range error.
    pub fn out_of_range(reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            reason: reason.into(),
        }
    }
}

/// Result type for trigger operations.
pub type TriggerResult<T> = Result<T, TriggerError>;

/// The three trigger semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fixed offset from creation.
    Duration,
    /// Absolute instant.
    Date,
    /// Recurring field expression.
    Cycle,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duration => write!(f, "duration"),
            Self::Date => write!(f, "date"),
            Self::Cycle => write!(f, "cycle"),
        }
    }
}

/// A validated recurrence expression.
///
/// Six or seven whitespace-separated fields: seconds, minutes, hours,
/// day-of-month, month, day-of-week and an optional year. `?` may stand for
/// either day-of-month or day-of-week, never both.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CycleExpression {
    source: String,
    schedule: Schedule,
}

impl CycleExpression {
    /// Parse and validate an expression.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError::InvalidCycleExpression` if the expression is
    /// malformed.
    pub fn parse(expression: &str) -> TriggerResult<Self> {
        let normalized = normalize_expression(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| TriggerError::invalid_cycle(expression, e.to_string()))?;

        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
        })
    }

    /// The expression as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Smallest matching instant strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Rewrites `?` day wildcards into the form the schedule parser accepts.
fn normalize_expression(expression: &str) -> TriggerResult<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();

    if !(6..=7).contains(&fields.len()) {
        return Err(TriggerError::invalid_cycle(
            expression,
            format!(
                "expected 6 or 7 fields (seconds through day-of-week, optional year), found {}",
                fields.len()
            ),
        ));
    }

    for (position, field) in fields.iter().enumerate() {
        if !field.contains('?') {
            continue;
        }
        let on_day_field = position == DAY_OF_MONTH_FIELD || position == DAY_OF_WEEK_FIELD;
        if !on_day_field || *field != "?" {
            return Err(TriggerError::invalid_cycle(
                expression,
                "'?' is only permitted as the whole day-of-month or day-of-week field",
            ));
        }
    }

    let dom_any = fields.get(DAY_OF_MONTH_FIELD) == Some(&"?");
    let dow_any = fields.get(DAY_OF_WEEK_FIELD) == Some(&"?");
    if dom_any && dow_any {
        return Err(TriggerError::invalid_cycle(
            expression,
            "'?' may be used on day-of-month or day-of-week, not both",
        ));
    }

    Ok(fields
        .iter()
        .map(|field| if *field == "?" { "*" } else { *field })
        .join(" "))
}

impl fmt::Debug for CycleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CycleExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CycleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl PartialEq for CycleExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CycleExpression {}

impl TryFrom<String> for CycleExpression {
    type Error = TriggerError;

    fn try_from(value: String) -> TriggerResult<Self> {
        Self::parse(&value)
    }
}

impl From<CycleExpression> for String {
    fn from(value: CycleExpression) -> Self {
        value.source
    }
}

/// Immutable description of when a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fires once, `offset_ms` after creation.
    Duration { offset_ms: u64 },
    /// Fires once at an absolute instant.
    Date { at: DateTime<Utc> },
    /// Fires at every instant matching the expression.
    Cycle { expression: CycleExpression },
}

impl TriggerSpec {
    /// A duration trigger from a signed millisecond offset.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError::NegativeDuration` for negative offsets.
    pub fn duration_ms(offset_ms: i64) -> TriggerResult<Self> {
        u64::try_from(offset_ms)
            .map(|offset_ms| Self::Duration { offset_ms })
            .map_err(|_| TriggerError::NegativeDuration { offset_ms })
    }

    /// A date trigger.
    #[must_use]
    pub const fn date(at: DateTime<Utc>) -> Self {
        Self::Date { at }
    }

    /// A cycle trigger, validating the expression.
    ///
    /// # Errors
    ///
    /// Returns `TriggerError::InvalidCycleExpression` if the expression is
    /// malformed.
    pub fn cycle(expression: &str) -> TriggerResult<Self> {
        CycleExpression::parse(expression).map(|expression| Self::Cycle { expression })
    }

    /// Which semantics this trigger uses.
    #[must_use]
    pub const fn kind(&self) -> TriggerKind {
        match self {
            Self::Duration { .. } => TriggerKind::Duration,
            Self::Date { .. } => TriggerKind::Date,
            Self::Cycle { .. } => TriggerKind::Cycle,
        }
    }

    /// Whether the trigger re-arms after firing.
    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }
}

/// Resolve the next fire instant of `spec`.
///
/// - Duration: `reference + offset` on the first call, `None` once an
///   occurrence has been consumed (`previous_fire` is set).
/// - Date: the configured instant, clamped to `reference` so that an instant
///   already in the past fires immediately instead of being dropped; `None`
///   once consumed.
/// - Cycle: the smallest matching instant strictly after `previous_fire`, or
///   after `reference` for the first occurrence.
///
/// # Errors
///
/// Returns `TriggerError::OutOfRange` if the offset overflows.
pub fn resolve_next(
    spec: &TriggerSpec,
    reference: DateTime<Utc>,
    previous_fire: Option<DateTime<Utc>>,
) -> TriggerResult<Option<DateTime<Utc>>> {
    match spec {
        TriggerSpec::Duration { offset_ms } => match previous_fire {
            Some(_) => Ok(None),
            None => offset_from(reference, *offset_ms).map(Some),
        },
        TriggerSpec::Date { at } => Ok(match previous_fire {
            Some(_) => None,
            None => Some((*at).max(reference)),
        }),
        TriggerSpec::Cycle { expression } => {
            Ok(expression.next_after(previous_fire.unwrap_or(reference)))
        }
    }
}

/// Next natural occurrence of a recurring trigger after a fire.
///
/// Resolution starts from the stored `previous_fire` but never yields an
/// instant at or before `now`, so an outage produces one catch-up fire
/// rather than a burst.
///
/// # Errors
///
/// Returns `TriggerError::OneShotConsumed` for one-shot triggers.
pub fn resolve_rearm(
    spec: &TriggerSpec,
    previous_fire: DateTime<Utc>,
    now: DateTime<Utc>,
) -> TriggerResult<Option<DateTime<Utc>>> {
    match spec {
        TriggerSpec::Cycle { expression } => Ok(expression.next_after(previous_fire.max(now))),
        other => Err(TriggerError::OneShotConsumed { kind: other.kind() }),
    }
}

fn offset_from(reference: DateTime<Utc>, offset_ms: u64) -> TriggerResult<DateTime<Utc>> {
    let millis = i64::try_from(offset_ms)
        .map_err(|_| TriggerError::out_of_range(format!("offset {offset_ms}ms too large")))?;
    let delta = Duration::try_milliseconds(millis)
        .ok_or_else(|| TriggerError::out_of_range(format!("offset {offset_ms}ms too large")))?;

    reference
        .checked_add_signed(delta)
        .ok_or_else(|| TriggerError::out_of_range(format!("{reference} + {offset_ms}ms")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, h, m, s).single().unwrap()
    }

    #[test]
    fn test_duration_fires_once_at_offset() {
        let spec = TriggerSpec::Duration { offset_ms: 1000 };
        let created = at(10, 0, 0);

        let first = resolve_next(&spec, created, None).unwrap();
        assert_eq!(first, Some(created + Duration::milliseconds(1000)));

        let second = resolve_next(&spec, created, first).unwrap();
        assert_eq!(second, None);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = TriggerSpec::duration_ms(-5).unwrap_err();
        assert_eq!(err, TriggerError::NegativeDuration { offset_ms: -5 });
    }

    #[test]
    fn test_duration_overflow_is_out_of_range() {
        let spec = TriggerSpec::Duration {
            offset_ms: u64::MAX,
        };
        let err = resolve_next(&spec, at(10, 0, 0), None).unwrap_err();
        assert!(matches!(err, TriggerError::OutOfRange { .. }));
    }

    #[test]
    fn test_date_in_future_fires_at_instant() {
        let target = at(12, 0, 0);
        let spec = TriggerSpec::date(target);
        assert_eq!(resolve_next(&spec, at(10, 0, 0), None).unwrap(), Some(target));
        assert_eq!(resolve_next(&spec, at(10, 0, 0), Some(target)).unwrap(), None);
    }

    #[test]
    fn test_date_in_past_fires_immediately() {
        let spec = TriggerSpec::date(at(8, 0, 0));
        let now = at(10, 0, 0);
        assert_eq!(resolve_next(&spec, now, None).unwrap(), Some(now));
    }

    #[test]
    fn test_cycle_sequence_strictly_increasing() {
        let spec = TriggerSpec::cycle("*/4 * * * * ?").unwrap();
        let mut previous = None;
        let mut fires = Vec::new();
        for _ in 0..5 {
            let next = resolve_next(&spec, at(10, 0, 1), previous).unwrap().unwrap();
            fires.push(next);
            previous = Some(next);
        }

        assert_eq!(fires[0], at(10, 0, 4));
        assert!(fires.windows(2).all(|w| w[0] < w[1]));
        assert!(fires.iter().all(|f| f.second() % 4 == 0));
    }

    #[test]
    fn test_cycle_next_is_strictly_after_reference() {
        let spec = TriggerSpec::cycle("0 * * * * ?").unwrap();
        let on_the_minute = at(10, 5, 0);
        let next = resolve_next(&spec, on_the_minute, None).unwrap();
        assert_eq!(next, Some(at(10, 6, 0)));
    }

    #[test]
    fn test_cycle_question_mark_on_day_of_month() {
        assert!(TriggerSpec::cycle("0 0 12 ? * Mon").is_ok());
    }

    #[test]
    fn test_cycle_question_mark_on_both_day_fields_rejected() {
        let err = TriggerSpec::cycle("0 0 12 ? * ?").unwrap_err();
        assert!(matches!(err, TriggerError::InvalidCycleExpression { .. }));
    }

    #[test]
    fn test_cycle_question_mark_on_hour_rejected() {
        let err = TriggerSpec::cycle("0 0 ? * * *").unwrap_err();
        assert!(matches!(err, TriggerError::InvalidCycleExpression { .. }));
    }

    #[test]
    fn test_cycle_wrong_field_count_rejected() {
        let err = TriggerSpec::cycle("*/5 * * *").unwrap_err();
        assert!(err.to_string().contains("expected 6 or 7 fields"));
    }

    #[test]
    fn test_cycle_garbage_rejected() {
        assert!(TriggerSpec::cycle("a b c d e f").is_err());
    }

    #[test]
    fn test_rearm_skips_past_occurrences() {
        let spec = TriggerSpec::cycle("0 * * * * ?").unwrap();
        let stale = at(9, 0, 0);
        let now = at(10, 30, 20);
        let next = resolve_rearm(&spec, stale, now).unwrap();
        assert_eq!(next, Some(at(10, 31, 0)));
    }

    #[test]
    fn test_rearm_one_shot_is_programming_error() {
        let spec = TriggerSpec::Duration { offset_ms: 10 };
        let err = resolve_rearm(&spec, at(10, 0, 0), at(10, 0, 0)).unwrap_err();
        assert_eq!(
            err,
            TriggerError::OneShotConsumed {
                kind: TriggerKind::Duration
            }
        );
    }

    #[test]
    fn test_trigger_spec_serde_keeps_expression() {
        let spec = TriggerSpec::cycle("*/4 * * * * ?").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"cycle\""));
        let back: TriggerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_trigger_spec_serde_rejects_bad_expression() {
        let json = r#"{"kind":"cycle","expression":"nope"}"#;
        assert!(serde_json::from_str::<TriggerSpec>(json).is_err());
    }
}
