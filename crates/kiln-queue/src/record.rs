//! On-disk job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// The persisted form of a job. Carries all necessary, non-redundant
/// information; the dispatch state derived from these records (pending
/// channels, dependant index) lives in memory only and is rebuilt on
/// startup.
///
/// Payloads are kept as raw JSON so the queue never interprets them, and
/// unknown fields are tolerated on read so records written by a newer
/// version stay loadable. Unset timestamps are omitted from the document,
/// which keeps them distinguishable from every valid instant.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Box<RawValue>>,
    pub dependencies: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Deduplicates `ids` and puts them in a deterministic (byte-wise) order.
pub(crate) fn unique_sorted(ids: &[Uuid]) -> Vec<Uuid> {
    let mut out = ids.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}
