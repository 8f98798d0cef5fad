//! Filter and projection validation.
//!
//! Keys are canonicalized (camelCase split to snake_case, recognized
//! aliases rewritten), then strictly validated against the resource's
//! filter schema. Values are coerced: numeric strings become positive
//! integers, booleans are coerced, strings are trimmed and must be
//! non-empty. Date filters accept an ISO date-time or a `{gt,gte,lt,lte}`
//! subset. An empty result is `None`, never an empty map.

use chrono::{DateTime, Utc};
use serde_json::Value;

use stevedore_protocol::{
    DateRange, ErrorCode, FilterValue, Filters, ResourceKind, TransferError, TransferResult,
};

/// Canonicalize a filter or field key: lowercase snake_case with aliases.
///
/// Idempotent: applying it twice yields the same key.
pub fn canonicalize_key(key: &str) -> String {
    let trimmed = key.trim();
    let mut out = String::with_capacity(trimmed.len() + 4);
    for (i, ch) in trimmed.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    match out.as_str() {
        "tag_list" => "tags".to_string(),
        _ => out,
    }
}

/// Validate raw JSON filter text.
pub fn parse_filters_json(
    resource: ResourceKind,
    raw: &str,
) -> TransferResult<Option<Filters>> {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        TransferError::new(ErrorCode::InvalidFormat, format!("filters are not valid JSON: {e}"))
            .with_field("filters")
    })?;
    validate_filters(resource, &value)
}

/// Validate a pre-parsed filter structure.
pub fn validate_filters(
    resource: ResourceKind,
    value: &Value,
) -> TransferResult<Option<Filters>> {
    let map = match value {
        Value::Null => return Ok(None),
        Value::Object(map) => map,
        _ => {
            return Err(TransferError::new(
                ErrorCode::InvalidType,
                "filters must be a JSON object",
            )
            .with_field("filters"))
        }
    };

    let allowed = resource.filter_keys();
    let mut filters = Filters::new();
    for (raw_key, raw_value) in map {
        let key = canonicalize_key(raw_key);
        if !allowed.contains(&key.as_str()) {
            return Err(TransferError::new(
                ErrorCode::InvalidFormat,
                format!("unknown filter key '{raw_key}' for {resource}"),
            )
            .with_field(key));
        }
        let value = coerce_filter_value(resource, &key, raw_value)?;
        filters.insert(key, value);
    }

    if filters.is_empty() {
        Ok(None)
    } else {
        Ok(Some(filters))
    }
}

/// Validate a field projection list: a comma-separated string or a JSON
/// array of strings. Returns canonical names in input order, deduplicated;
/// `None` when nothing was selected.
pub fn validate_fields(
    resource: ResourceKind,
    value: &Value,
) -> TransferResult<Option<Vec<String>>> {
    let raw_names: Vec<String> = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(items) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => names.push(s.clone()),
                    _ => {
                        return Err(TransferError::new(
                            ErrorCode::InvalidType,
                            "field list entries must be strings",
                        )
                        .with_field("fields"))
                    }
                }
            }
            names
        }
        _ => {
            return Err(TransferError::new(
                ErrorCode::InvalidType,
                "fields must be a comma-separated string or an array of strings",
            )
            .with_field("fields"))
        }
    };

    let allowed = resource.export_fields();
    let mut fields: Vec<String> = Vec::new();
    for raw in raw_names {
        let name = canonicalize_key(&raw);
        if name.is_empty() {
            continue;
        }
        if !allowed.contains(&name.as_str()) {
            return Err(TransferError::new(
                ErrorCode::InvalidFormat,
                format!("unknown field '{}' for {resource}", raw.trim()),
            )
            .with_field("fields"));
        }
        if !fields.contains(&name) {
            fields.push(name);
        }
    }

    if fields.is_empty() {
        Ok(None)
    } else {
        Ok(Some(fields))
    }
}

fn coerce_filter_value(
    resource: ResourceKind,
    key: &str,
    value: &Value,
) -> TransferResult<FilterValue> {
    match key {
        "id" | "author_id" | "article_id" | "user_id" => {
            coerce_positive_int(value).map(FilterValue::Int).ok_or_else(|| {
                TransferError::new(
                    ErrorCode::InvalidType,
                    format!("{key} must be a positive integer"),
                )
                .with_field(key)
            })
        }
        "active" => coerce_bool(value).map(FilterValue::Bool).ok_or_else(|| {
            TransferError::new(ErrorCode::InvalidType, "active must be a boolean")
                .with_field(key)
        }),
        "created_at" | "published_at" => coerce_date_filter(key, value),
        "role" => {
            let role = non_empty_string(value).ok_or_else(|| {
                TransferError::new(ErrorCode::InvalidType, "role must be a non-empty string")
                    .with_field(key)
            })?;
            if !crate::records::USER_ROLES.contains(&role.as_str()) {
                return Err(TransferError::new(
                    ErrorCode::InvalidEnumValue,
                    format!("role must be one of {:?}", crate::records::USER_ROLES),
                )
                .with_field(key));
            }
            Ok(FilterValue::Str(role))
        }
        "status" if resource == ResourceKind::Articles => {
            let status = non_empty_string(value).ok_or_else(|| {
                TransferError::new(ErrorCode::InvalidType, "status must be a non-empty string")
                    .with_field(key)
            })?;
            if !crate::records::ARTICLE_STATUSES.contains(&status.as_str()) {
                return Err(TransferError::new(
                    ErrorCode::InvalidEnumValue,
                    format!("status must be one of {:?}", crate::records::ARTICLE_STATUSES),
                )
                .with_field(key));
            }
            Ok(FilterValue::Str(status))
        }
        _ => {
            // Remaining keys (email, name, slug) are plain strings.
            non_empty_string(value).map(FilterValue::Str).ok_or_else(|| {
                TransferError::new(
                    ErrorCode::InvalidType,
                    format!("{key} must be a non-empty string"),
                )
                .with_field(key)
            })
        }
    }
}

fn coerce_date_filter(key: &str, value: &Value) -> TransferResult<FilterValue> {
    match value {
        Value::String(s) => parse_datetime(s)
            .map(FilterValue::Date)
            .ok_or_else(|| bad_date(key)),
        Value::Object(bounds) => {
            let mut range = DateRange::default();
            for (bound_key, bound_value) in bounds {
                let ts = bound_value
                    .as_str()
                    .and_then(parse_datetime)
                    .ok_or_else(|| bad_date(key))?;
                match bound_key.as_str() {
                    "gt" => range.gt = Some(ts),
                    "gte" => range.gte = Some(ts),
                    "lt" => range.lt = Some(ts),
                    "lte" => range.lte = Some(ts),
                    other => {
                        return Err(TransferError::new(
                            ErrorCode::InvalidFormat,
                            format!("unknown date bound '{other}'; expected gt, gte, lt or lte"),
                        )
                        .with_field(key))
                    }
                }
            }
            if range.is_empty() {
                return Err(TransferError::new(
                    ErrorCode::InvalidFormat,
                    "date filter object needs at least one bound",
                )
                .with_field(key));
            }
            Ok(FilterValue::Range(range))
        }
        _ => Err(bad_date(key)),
    }
}

fn bad_date(key: &str) -> TransferError {
    TransferError::new(
        ErrorCode::InvalidFormat,
        format!("{key} must be an ISO date-time or an object of gt/gte/lt/lte bounds"),
    )
    .with_field(key)
}

pub(crate) fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn coerce_positive_int(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (n > 0).then_some(n)
}

pub(crate) fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn non_empty_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}
