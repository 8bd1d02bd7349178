//! Sensor readings as they arrive on the bus.
//!
//! Construction never fails: it keeps whatever the payload carried, including
//! values of the wrong type and timestamps that did not parse. `validate` is
//! the only place that decides whether a reading is usable, and it hands back
//! a typed [`ValidReading`] view. Only that view can be turned into a point.

use crate::error::IngestError;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementFault {
    MissingType,
    ControlCharacterInType,
    NonNumericValue,
    MissingUnit,
}

impl fmt::Display for MeasurementFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementFault::MissingType => write!(f, "measurement type is required"),
            MeasurementFault::ControlCharacterInType => {
                write!(f, "measurement type must not contain control characters")
            }
            MeasurementFault::NonNumericValue => write!(f, "measurement value must be a number"),
            MeasurementFault::MissingUnit => write!(f, "measurement unit is required"),
        }
    }
}

/// One `{type, value, unit}` entry of a reading, stored exactly as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    kind: Value,
    value: Value,
    unit: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidMeasurement<'a> {
    pub kind: &'a str,
    pub value: f64,
    pub unit: &'a str,
}

impl Measurement {
    pub fn new(kind: Value, value: Value, unit: Value) -> Self {
        Self { kind, value, unit }
    }

    /// Pull `type`, `value` and `unit` out of one `data` entry. Anything that is
    /// not an object yields a measurement with every attribute missing.
    pub fn from_json(entry: &Value) -> Self {
        let attr = |name: &str| entry.get(name).cloned().unwrap_or(Value::Null);
        Self::new(attr("type"), attr("value"), attr("unit"))
    }

    /// The `type` attribute if it is a string, valid or not.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_str()
    }

    pub fn validate(&self) -> Result<ValidMeasurement<'_>, MeasurementFault> {
        let kind = non_empty_str(&self.kind).ok_or(MeasurementFault::MissingType)?;
        if has_control(kind) {
            return Err(MeasurementFault::ControlCharacterInType);
        }
        let value = match &self.value {
            Value::Number(n) => n.as_f64().ok_or(MeasurementFault::NonNumericValue)?,
            _ => return Err(MeasurementFault::NonNumericValue),
        };
        if !value.is_finite() {
            return Err(MeasurementFault::NonNumericValue);
        }
        let unit = non_empty_str(&self.unit).ok_or(MeasurementFault::MissingUnit)?;
        Ok(ValidMeasurement { kind, value, unit })
    }
}

fn non_empty_str(v: &Value) -> Option<&str> {
    v.as_str().filter(|s| !s.is_empty())
}

fn has_control(s: &str) -> bool {
    s.chars().any(char::is_control)
}

/// One device's payload at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    device_id: Value,
    at: Result<DateTime<FixedOffset>, String>,
    measurements: Option<Vec<Measurement>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidReading<'a> {
    pub device_id: &'a str,
    pub at: DateTime<FixedOffset>,
    pub measurements: Vec<ValidMeasurement<'a>>,
}

impl Reading {
    /// `at` is parsed here but a failure is only reported by [`Reading::validate`].
    /// `data` that is not an array is kept as "no sequence".
    pub fn new(device_id: Value, at: &Value, data: &Value) -> Self {
        let at = match at {
            Value::String(s) => parse_timestamp(s),
            Value::Null => Err("timestamp is required".to_string()),
            other => Err(format!("timestamp must be a string, got {other}")),
        };
        let measurements = data
            .as_array()
            .map(|items| items.iter().map(Measurement::from_json).collect());
        Self {
            device_id,
            at,
            measurements,
        }
    }

    pub fn from_json(payload: &Value) -> Self {
        let attr = |name: &str| payload.get(name).unwrap_or(&Value::Null);
        Self::new(attr("uid").clone(), attr("at"), attr("data"))
    }

    pub fn measurements(&self) -> &[Measurement] {
        self.measurements.as_deref().unwrap_or_default()
    }

    /// Check the reading and every measurement in order, stopping at the first
    /// violation. Validation does not touch `self`, so repeated calls agree.
    pub fn validate(&self) -> Result<ValidReading<'_>, IngestError> {
        let device_id = non_empty_str(&self.device_id)
            .ok_or_else(|| IngestError::InvalidReading("uid is required".into()))?;
        if has_control(device_id) {
            return Err(IngestError::InvalidReading(
                "uid must not contain control characters".into(),
            ));
        }
        let at = self
            .at
            .as_ref()
            .map_err(|e| IngestError::InvalidReading(format!("invalid timestamp: {e}")))?;
        if at.timestamp_nanos_opt().is_none() {
            return Err(IngestError::InvalidReading(format!(
                "timestamp {at} is outside the storable range"
            )));
        }
        let raw = self
            .measurements
            .as_ref()
            .ok_or_else(|| IngestError::InvalidReading("data must be an array".into()))?;
        if raw.is_empty() {
            return Err(IngestError::InvalidReading(
                "data must contain at least one measurement".into(),
            ));
        }

        let mut measurements = Vec::with_capacity(raw.len());
        for (index, m) in raw.iter().enumerate() {
            let valid = m.validate().map_err(|fault| IngestError::InvalidMeasurement {
                index,
                kind: m.kind().map(str::to_string),
                fault,
            })?;
            measurements.push(valid);
        }

        Ok(ValidReading {
            device_id,
            at: *at,
            measurements,
        })
    }
}

/// Parse an ISO-8601 instant. Offsets may be written `+01:00`, `+0100` or `Z`;
/// date-times without an offset and bare dates are taken as UTC, never the
/// host's local zone.
pub fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt);
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc().fixed_offset());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().fixed_offset());
        }
    }
    Err(format!("cannot parse {s:?} as an ISO-8601 timestamp"))
}

impl ValidReading<'_> {
    pub fn at_utc(&self) -> DateTime<Utc> {
        self.at.with_timezone(&Utc)
    }
}
