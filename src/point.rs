use crate::reading::ValidReading;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const DEFAULT_MEASUREMENT: &str = "environment_data";
pub const DEVICE_TAG: &str = "uid";

/// A time-series point ready for the storage backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub ts: DateTime<Utc>,
}

impl Point {
    /// Render as one line of InfluxDB line protocol with a nanosecond timestamp.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (k, v) in &self.tags {
            let _ = write!(line, ",{}={}", escape_key(k), escape_key(v));
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape_key(k), v))
            .collect();
        let _ = write!(line, " {}", fields.join(","));
        if let Some(ns) = self.ts.timestamp_nanos_opt() {
            let _ = write!(line, " {ns}");
        }
        line
    }
}

fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

/// Backslash-escape `special`, a literal backslash, and write line breaks and
/// tabs as `\n`, `\r`, `\t` so a value can never end the line early.
fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            c if special.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PointBuilder {
    measurement: String,
}

impl Default for PointBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MEASUREMENT)
    }
}

impl PointBuilder {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
        }
    }

    /// One field per measurement, keyed by its type. A type that repeats keeps
    /// the value of its last occurrence.
    pub fn build(&self, reading: &ValidReading<'_>) -> Point {
        let mut tags = BTreeMap::new();
        tags.insert(DEVICE_TAG.to_string(), reading.device_id.to_string());

        let mut fields = BTreeMap::new();
        for m in &reading.measurements {
            fields.insert(m.kind.to_string(), m.value);
        }

        Point {
            measurement: self.measurement.clone(),
            tags,
            fields,
            ts: reading.at_utc(),
        }
    }
}
