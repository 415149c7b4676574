//! State reports and the offline backlog.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Epoch values below this are taken as seconds, at or above as milliseconds.
const MILLIS_THRESHOLD: f64 = 1_000_000_000_000.0;

/// One state report as published: `{"time": <ms since epoch>, "data": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRecord {
    pub time: i64,
    pub data: Value,
}

impl StateRecord {
    pub fn new(data: Value, time: impl Into<Timestamp>) -> Self {
        Self {
            time: time.into().millis(),
            data,
        }
    }

    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Epoch milliseconds, built from any of the usual time representations.
///
/// Plain numbers go through [`normalize_timestamp`], so both `1_577_836_800`
/// (seconds) and `1_577_836_800_000` (milliseconds) name the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_secs_f64() * 1000.0,
            Err(before) => -(before.duration().as_secs_f64() * 1000.0),
        };
        Timestamp(millis.round() as i64)
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(time: OffsetDateTime) -> Self {
        Timestamp((time.unix_timestamp_nanos() as f64 / 1_000_000.0).round() as i64)
    }
}

impl From<f64> for Timestamp {
    fn from(value: f64) -> Self {
        Timestamp(normalize_timestamp(value))
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Timestamp(normalize_timestamp(value as f64))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Timestamp(normalize_timestamp(value as f64))
    }
}

/// Converts an epoch value to milliseconds, rounded to the nearest integer.
/// Values below 10^12 are seconds.
pub fn normalize_timestamp(value: f64) -> i64 {
    let millis = if value < MILLIS_THRESHOLD {
        value * 1000.0
    } else {
        value
    };
    millis.round() as i64
}

/// Reports accumulated while disconnected, in call order.
#[derive(Debug, Default)]
pub struct Backlog {
    records: Vec<StateRecord>,
}

impl Backlog {
    pub fn push(&mut self, record: StateRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[StateRecord] {
        &self.records
    }

    /// The whole backlog as one JSON array, oldest first.
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(&self.records).map(Bytes::from)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
