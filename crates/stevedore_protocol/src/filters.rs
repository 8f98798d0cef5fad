//! Typed filter values shared by the filter validator and the export reader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical-key filter mapping. Empty filter sets are represented as
/// `Option<Filters>::None` upstream, never as an empty map.
pub type Filters = BTreeMap<String, FilterValue>;

/// A validated, typed filter value.
///
/// Untagged: variant order matters when deserializing persisted filters.
/// `Date` precedes `Str` so an RFC 3339 string keeps its date typing on
/// the round trip through the job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Int(i64),
    Bool(bool),
    Date(DateTime<Utc>),
    Str(String),
    Range(DateRange),
}

/// Bounds subset for date filters; at least one bound is present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn is_empty(&self) -> bool {
        self.gt.is_none() && self.gte.is_none() && self.lt.is_none() && self.lte.is_none()
    }
}
