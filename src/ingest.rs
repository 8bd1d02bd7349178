use crate::error::IngestError;
use crate::point::{Point, PointBuilder};
use crate::reading::Reading;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Accepts points for storage. `submit` must return without waiting for the
/// backend; durability is the sink's business.
#[cfg_attr(test, mockall::automock)]
pub trait PointSink: Send + Sync {
    fn submit(&self, point: Point) -> Result<(), IngestError>;
}

/// What happened to one message. Every message produces exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Acknowledged {
        uid: String,
        at: DateTime<Utc>,
        fields: usize,
    },
    Rejected(IngestError),
}

impl Outcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Outcome::Acknowledged { .. })
    }
}

pub struct Ingestor {
    sink: Arc<dyn PointSink>,
    builder: PointBuilder,
}

impl Ingestor {
    pub fn new(sink: Arc<dyn PointSink>, builder: PointBuilder) -> Self {
        Self { sink, builder }
    }

    /// Run one payload through parse, shape check, validation, point building
    /// and submission. Failures stay local to this message: they are logged
    /// and returned, never propagated.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Outcome {
        match self.process(payload) {
            Ok((uid, at, fields)) => {
                info!(
                    topic = %topic,
                    uid = %uid,
                    at = %at.to_rfc3339(),
                    fields,
                    completed_at = %Utc::now().to_rfc3339(),
                    "data written"
                );
                Outcome::Acknowledged { uid, at, fields }
            }
            Err(e) => {
                warn!(topic = %topic, kind = e.kind(), error = %e, "message rejected");
                Outcome::Rejected(e)
            }
        }
    }

    fn process(&self, payload: &[u8]) -> Result<(String, DateTime<Utc>, usize), IngestError> {
        let json = parse_payload(payload)?;
        check_shape(&json)?;

        let reading = Reading::from_json(&json);
        let valid = reading.validate()?;
        let point = self.builder.build(&valid);

        let uid = valid.device_id.to_string();
        let at = point.ts;
        let fields = point.fields.len();
        self.sink.submit(point)?;
        Ok((uid, at, fields))
    }
}

fn parse_payload(payload: &[u8]) -> Result<Value, IngestError> {
    let json: Value = serde_json::from_slice(payload)
        .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;
    if !json.is_object() {
        return Err(IngestError::MalformedPayload(
            "payload must be a JSON object".into(),
        ));
    }
    Ok(json)
}

/// The minimum needed before a reading can be constructed: `uid` and `at`
/// present, `data` an array. `null` and `""` count as absent.
fn check_shape(json: &Value) -> Result<(), IngestError> {
    let present = |name: &str| {
        json.get(name)
            .is_some_and(|v| !v.is_null() && v.as_str() != Some(""))
    };
    if !present("uid") {
        return Err(IngestError::MissingRequiredField("uid"));
    }
    if !present("at") {
        return Err(IngestError::MissingRequiredField("at"));
    }
    if !json.get("data").is_some_and(Value::is_array) {
        return Err(IngestError::MissingRequiredField("data"));
    }
    Ok(())
}
