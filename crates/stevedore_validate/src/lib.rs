//! Validation for Stevedore.
//!
//! Three concerns: per-record shape/format/reference validation with
//! canonical normalization, the filter/projection validator for exports,
//! and the per-job reference cache that bounds store round trips.

pub mod cache;
pub mod filters;
pub mod records;

pub use cache::ReferenceCache;
pub use filters::{canonicalize_key, parse_filters_json, validate_fields, validate_filters};
pub use records::{validate_record, ValidationOutcome};
