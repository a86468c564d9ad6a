//! Per-request stats values shared between the recorder and its consumers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status reported when no response head was produced before completion.
pub const DEFAULT_STATUS: u16 = 200;

/// Header map as observed on the wire, keyed by lowercase name
pub type Headers = BTreeMap<String, HeaderField>;

/// A header that appeared once or several times
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

impl HeaderField {
    /// Append another occurrence of the same header
    pub fn push(&mut self, value: String) {
        match self {
            HeaderField::One(first) => {
                let first = std::mem::take(first);
                *self = HeaderField::Many(vec![first, value]);
            }
            HeaderField::Many(values) => values.push(value),
        }
    }

    /// First occurrence
    pub fn first(&self) -> Option<&str> {
        match self {
            HeaderField::One(value) => Some(value),
            HeaderField::Many(values) => values.first().map(String::as_str),
        }
    }
}

/// The one record emitted per completed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResult {
    /// True iff the response finished normally
    pub ok: bool,

    /// Milliseconds from observation to the terminal signal
    pub elapsed_ms: u64,

    pub request: RequestStats,

    pub response: ResponseStats,
}

/// Request side of a [`StatsResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    /// Bytes read from the connection since the previous request on it
    pub bytes: u64,
    pub headers: Headers,
    pub method: String,
    pub path: String,
}

/// Response side of a [`StatsResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStats {
    /// Bytes written to the connection since the previous request on it
    pub bytes: u64,
    pub headers: Headers,
    pub status: u16,
}

/// A repeatable read of an in-flight request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// The request already produced its result
    pub completed: bool,

    /// Milliseconds since observation
    pub elapsed_ms: u64,

    /// Milliseconds since the previous poll (or observation)
    pub elapsed_delta_ms: u64,

    pub request: RequestProgress,

    pub response: ResponseProgress,
}

/// Upload side of a [`ProgressSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestProgress {
    pub bytes: u64,
    pub bytes_delta: u64,
    pub bytes_per_second: f64,

    /// Only known when the request announced its length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_remaining: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

/// Download side of a [`ProgressSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseProgress {
    pub bytes: u64,
    pub bytes_delta: u64,
    pub bytes_per_second: f64,
}
