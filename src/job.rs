//! Job definitions shared by producers, workers and the watchdog.
//!
//! A [`Job`] is one unit of document-emission work: a globally unique
//! identity, the pipeline it belongs to ([`JobType`]), the raw row payload
//! forwarded untouched to the worker function, and the originating row
//! reference passed through to the result sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The two browser-automation pipelines driven by the orchestrator.
///
/// The lowercase form returned by [`JobType::as_str`] is used everywhere a
/// type name appears on the wire: queue keys, kill signals, worker names and
/// metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Pre-emission conference of a shipment record against the portal.
    Conference,
    /// Verification and collection of emitted transport documents.
    Emission,
}

impl JobType {
    /// All job types, in scheduling order.
    pub const ALL: [JobType; 2] = [JobType::Conference, JobType::Emission];

    /// Stable lowercase name used in keys, labels and worker names.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Conference => "conference",
            JobType::Emission => "emission",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work flowing through a job queue.
///
/// Jobs are immutable once enqueued: workers read the payload but never
/// mutate or re-serialize a modified copy. The `payload` is an ordered
/// field-name → value map taken verbatim from the source row; the core never
/// interprets it beyond passing it to the worker function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identity for this unit of work.
    ///
    /// The identity is the key of the distributed lock: at most one worker
    /// may process a given identity at any instant.
    pub id: String,
    /// Which pipeline should process this job.
    pub job_type: JobType,
    /// Originating row reference, passed through to the result sink.
    pub row: u64,
    /// Opaque row payload forwarded untouched to the worker function.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// When the producer created this job.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Creates a job with an empty payload.
    pub fn new(id: impl Into<String>, job_type: JobType, row: u64) -> Self {
        Self {
            id: id.into(),
            job_type,
            row,
            payload: Map::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// Attaches the raw row payload.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Convenience accessor for a string-valued payload field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_names() {
        assert_eq!(JobType::Conference.as_str(), "conference");
        assert_eq!(JobType::Emission.to_string(), "emission");
    }

    #[test]
    fn job_type_serde_uses_lowercase() {
        let json = serde_json::to_string(&JobType::Conference).expect("serialize");
        assert_eq!(json, "\"conference\"");

        let parsed: JobType = serde_json::from_str("\"emission\"").expect("deserialize");
        assert_eq!(parsed, JobType::Emission);
    }

    #[test]
    fn job_serialization_roundtrip() {
        let mut payload = Map::new();
        payload.insert("Load number".into(), Value::from("LT-0042"));
        payload.insert("Status".into(), Value::from("DELIVERED"));

        let job = Job::new("3zx-0042", JobType::Conference, 17).with_payload(payload);

        let json = serde_json::to_string(&job).expect("serialize");
        let parsed: Job = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(parsed.id, "3zx-0042");
        assert_eq!(parsed.job_type, JobType::Conference);
        assert_eq!(parsed.row, 17);
        assert_eq!(parsed.field("Load number"), Some("LT-0042"));
    }

    #[test]
    fn payload_preserves_field_order() {
        let mut payload = Map::new();
        for key in ["z", "a", "m"] {
            payload.insert(key.into(), Value::from(key));
        }
        let job = Job::new("j-1", JobType::Emission, 1).with_payload(payload);

        let json = serde_json::to_string(&job).expect("serialize");
        let parsed: Job = serde_json::from_str(&json).expect("deserialize");
        let keys: Vec<&String> = parsed.payload.keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn missing_payload_defaults_to_empty() {
        let json = r#"{"id":"j-2","job_type":"conference","row":3,"enqueued_at":"2025-11-02T12:00:00Z"}"#;
        let parsed: Job = serde_json::from_str(json).expect("deserialize");
        assert!(parsed.payload.is_empty());
        assert_eq!(parsed.field("anything"), None);
    }
}
