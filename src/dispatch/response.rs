//! Interpreting endpoint responses.
//!
//! Event imports answer with a count and per-record failures:
//!
//! ```json
//! { "num_records_imported": 4, "failed_records": [{ "index": 2, "message": "..." }] }
//! ```
//!
//! Profile updates answer with a status flag and no per-record detail:
//!
//! ```json
//! { "status": 1, "error": null }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One rejected record, by position in its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub index: usize,
    #[serde(default)]
    pub message: String,
}

/// Final result of sending one batch, after retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success {
        num_imported: u64,
    },
    PartialFailure {
        num_imported: u64,
        failed: Vec<RecordFailure>,
    },
    Failure {
        error: String,
    },
}

impl DispatchOutcome {
    #[must_use]
    pub fn num_imported(&self) -> u64 {
        match self {
            Self::Success { num_imported } | Self::PartialFailure { num_imported, .. } => {
                *num_imported
            }
            Self::Failure { .. } => 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    #[serde(default)]
    num_records_imported: Option<u64>,
    #[serde(default)]
    failed_records: Vec<RecordFailure>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Fold an event-import response body for a batch of `batch_len` records.
///
/// Works for both success bodies and 400 bodies that carry
/// `failed_records`. Returns `None` if the body has neither a count nor
/// per-record failures.
#[must_use]
pub fn event_outcome(body: &str, batch_len: usize) -> Option<DispatchOutcome> {
    let parsed: EventResponse = serde_json::from_str(body).ok()?;
    let mut failed: Vec<RecordFailure> = parsed
        .failed_records
        .into_iter()
        .filter(|f| f.index < batch_len)
        .collect();
    failed.sort_by_key(|f| f.index);
    failed.dedup_by_key(|f| f.index);

    let imported = match parsed.num_records_imported {
        Some(n) => n,
        None if !failed.is_empty() => (batch_len - failed.len()) as u64,
        None => return None,
    };
    if failed.is_empty() {
        Some(DispatchOutcome::Success {
            num_imported: imported,
        })
    } else {
        Some(DispatchOutcome::PartialFailure {
            num_imported: imported,
            failed,
        })
    }
}

/// Fold a profile-update response. A truthy `status` means the whole batch
/// was applied.
#[must_use]
pub fn profile_outcome(body: &str, batch_len: usize) -> DispatchOutcome {
    match serde_json::from_str::<ProfileResponse>(body) {
        Ok(resp) if truthy(&resp.status) => DispatchOutcome::Success {
            num_imported: batch_len as u64,
        },
        Ok(resp) => DispatchOutcome::Failure {
            error: resp
                .error
                .unwrap_or_else(|| format!("profile update rejected: {body}")),
        },
        Err(_) => DispatchOutcome::Failure {
            error: format!("unreadable profile response: {body}"),
        },
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "1" | "ok" | "true"),
        _ => false,
    }
}
