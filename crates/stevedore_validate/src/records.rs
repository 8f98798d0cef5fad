//! Per-record validation and normalization.
//!
//! Strict shape with coercion: unknown keys are rejected, ids coerce from
//! numeric strings, booleans from common encodings. Formats: email regex,
//! kebab-case slug regex, RFC 3339 date-times, length caps (including the
//! 500-word comment body). Cross-field rules and store-backed uniqueness /
//! reference checks run through the per-job [`ReferenceCache`].
//!
//! Every failed rule appends an error; a record therefore surfaces all of
//! its problems in one pass.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::cache::ReferenceCache;
use crate::filters::{canonicalize_key, coerce_bool, coerce_positive_int, parse_datetime};
use stevedore_protocol::{
    ArticleRecord, CommentRecord, ErrorCode, NormalizedRecord, ResourceKind, TransferError,
    TransferResult, UserRecord,
};

pub const USER_ROLES: &[&str] = &["user", "admin"];
pub const ARTICLE_STATUSES: &[&str] = &["draft", "published", "archived"];

const MAX_EMAIL_LEN: usize = 254;
const MAX_NAME_LEN: usize = 100;
const MAX_TITLE_LEN: usize = 200;
const MAX_SLUG_LEN: usize = 100;
const MAX_ARTICLE_BODY_LEN: usize = 100_000;
const MAX_COMMENT_BODY_WORDS: usize = 500;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
}

fn slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap())
}

/// Validator verdict for one source record.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<TransferError>,
    pub normalized: Option<NormalizedRecord>,
    /// True for records with nothing to do (an empty object); skipped
    /// without counting as an error.
    pub skip: bool,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.normalized.is_some()
    }
}

/// Validate one parsed record. The outer `Err` is reserved for store
/// failures during reference checks; rule violations land in
/// [`ValidationOutcome::errors`].
pub async fn validate_record(
    resource: ResourceKind,
    value: &Value,
    index: usize,
    cache: &mut ReferenceCache,
) -> TransferResult<ValidationOutcome> {
    let Some(raw_map) = value.as_object() else {
        return Ok(ValidationOutcome {
            errors: vec![TransferError::new(
                ErrorCode::InvalidRecordStructure,
                "record must be a JSON object",
            )
            .with_value(value.clone())],
            ..ValidationOutcome::default()
        });
    };
    if raw_map.is_empty() {
        return Ok(ValidationOutcome {
            skip: true,
            ..ValidationOutcome::default()
        });
    }

    let map = canonicalize_record_keys(raw_map);
    match resource {
        ResourceKind::Users => validate_user(&map, index, cache).await,
        ResourceKind::Articles => validate_article(&map, index, cache).await,
        ResourceKind::Comments => validate_comment(&map, cache).await,
    }
}

fn canonicalize_record_keys(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (canonicalize_key(key), value.clone()))
        .collect()
}

/// Absent or explicit null; either way there is no usable value.
fn is_absent(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).map_or(true, Value::is_null)
}

struct FieldErrors {
    errors: Vec<TransferError>,
}

impl FieldErrors {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn push(&mut self, code: ErrorCode, field: &str, message: impl Into<String>, value: &Value) {
        self.errors.push(
            TransferError::new(code, message)
                .with_field(field)
                .with_value(value.clone()),
        );
    }

    fn reject_unknown(&mut self, map: &Map<String, Value>, allowed: &[&str]) {
        for (key, value) in map {
            if !allowed.contains(&key.as_str()) {
                self.push(
                    ErrorCode::InvalidFormat,
                    key,
                    format!("unknown field '{key}'"),
                    value,
                );
            }
        }
    }
}

// ----------------------------------------------------------------------
// Field extractors (None = absent, Err recorded in the error list)
// ----------------------------------------------------------------------

fn take_id(map: &Map<String, Value>, key: &str, errs: &mut FieldErrors) -> Option<i64> {
    let value = map.get(key)?;
    if value.is_null() {
        return None;
    }
    match coerce_positive_int(value) {
        Some(id) => Some(id),
        None => {
            errs.push(
                ErrorCode::InvalidType,
                key,
                format!("{key} must be a positive integer"),
                value,
            );
            None
        }
    }
}

fn take_string(
    map: &Map<String, Value>,
    key: &str,
    max_len: usize,
    errs: &mut FieldErrors,
) -> Option<String> {
    let value = map.get(key)?;
    if value.is_null() {
        return None;
    }
    let Some(s) = value.as_str() else {
        errs.push(ErrorCode::InvalidType, key, format!("{key} must be a string"), value);
        return None;
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        errs.push(ErrorCode::ValueTooShort, key, format!("{key} must not be empty"), value);
        return None;
    }
    if trimmed.chars().count() > max_len {
        errs.push(
            ErrorCode::ValueTooLong,
            key,
            format!("{key} exceeds {max_len} characters"),
            value,
        );
        return None;
    }
    Some(trimmed.to_string())
}

fn take_bool(map: &Map<String, Value>, key: &str, errs: &mut FieldErrors) -> Option<bool> {
    let value = map.get(key)?;
    if value.is_null() {
        return None;
    }
    match coerce_bool(value) {
        Some(b) => Some(b),
        None => {
            errs.push(ErrorCode::InvalidType, key, format!("{key} must be a boolean"), value);
            None
        }
    }
}

fn take_datetime(
    map: &Map<String, Value>,
    key: &str,
    errs: &mut FieldErrors,
) -> Option<chrono::DateTime<chrono::Utc>> {
    let value = map.get(key)?;
    if value.is_null() {
        return None;
    }
    let parsed = value.as_str().and_then(parse_datetime);
    if parsed.is_none() {
        errs.push(
            ErrorCode::InvalidFormat,
            key,
            format!("{key} must be an ISO 8601 date-time"),
            value,
        );
    }
    parsed
}

fn take_enum(
    map: &Map<String, Value>,
    key: &str,
    allowed: &[&str],
    errs: &mut FieldErrors,
) -> Option<String> {
    let raw = take_string(map, key, 32, errs)?;
    let lowered = raw.to_ascii_lowercase();
    if allowed.contains(&lowered.as_str()) {
        Some(lowered)
    } else {
        errs.push(
            ErrorCode::InvalidEnumValue,
            key,
            format!("{key} must be one of {allowed:?}"),
            &Value::String(raw),
        );
        None
    }
}

// ----------------------------------------------------------------------
// Per-entity validators
// ----------------------------------------------------------------------

async fn validate_user(
    map: &Map<String, Value>,
    index: usize,
    cache: &mut ReferenceCache,
) -> TransferResult<ValidationOutcome> {
    let mut errs = FieldErrors::new();
    errs.reject_unknown(
        map,
        &["id", "email", "name", "role", "active", "created_at", "updated_at"],
    );

    let id = take_id(map, "id", &mut errs);
    let email = take_string(map, "email", MAX_EMAIL_LEN, &mut errs).and_then(|raw| {
        let lowered = raw.to_lowercase();
        if email_re().is_match(&lowered) {
            Some(lowered)
        } else {
            errs.push(
                ErrorCode::InvalidFormat,
                "email",
                "email is not a valid address",
                &Value::String(raw),
            );
            None
        }
    });
    let name = take_string(map, "name", MAX_NAME_LEN, &mut errs);
    let role = take_enum(map, "role", USER_ROLES, &mut errs);
    let active = take_bool(map, "active", &mut errs);
    let created_at = take_datetime(map, "created_at", &mut errs);
    let updated_at = take_datetime(map, "updated_at", &mut errs);

    // Cross-field: the record must be addressable.
    if id.is_none() && email.is_none() && is_absent(map, "email") && is_absent(map, "id") {
        errs.push(
            ErrorCode::MissingRequiredField,
            "id",
            "user record must have an id or an email",
            &Value::Null,
        );
    }

    // Uniqueness: first record claims the email; the store check allows a
    // match only when the owning id equals the incoming id.
    if let Some(email) = &email {
        if let Some(prior) = cache.claim_email(email, index) {
            errs.errors.push(
                TransferError::new(
                    ErrorCode::DuplicateValue,
                    format!("email already used by record {prior} in this import"),
                )
                .with_field("email")
                .with_value(Value::String(email.clone())),
            );
        } else if let Some(owner) = cache.email_owner(email).await? {
            if id != Some(owner) {
                errs.errors.push(
                    TransferError::new(
                        ErrorCode::DuplicateValue,
                        "email already belongs to another user",
                    )
                    .with_field("email")
                    .with_value(Value::String(email.clone())),
                );
            }
        }
    }

    if !errs.errors.is_empty() {
        return Ok(ValidationOutcome {
            errors: errs.errors,
            ..ValidationOutcome::default()
        });
    }
    Ok(ValidationOutcome {
        normalized: Some(NormalizedRecord::User(UserRecord {
            id,
            email,
            name,
            role,
            active,
            created_at,
            updated_at,
        })),
        ..ValidationOutcome::default()
    })
}

async fn validate_article(
    map: &Map<String, Value>,
    index: usize,
    cache: &mut ReferenceCache,
) -> TransferResult<ValidationOutcome> {
    let mut errs = FieldErrors::new();
    errs.reject_unknown(
        map,
        &[
            "id", "slug", "title", "body", "author_id", "tags", "status", "published_at",
            "created_at", "updated_at",
        ],
    );

    let id = take_id(map, "id", &mut errs);
    let slug = take_string(map, "slug", MAX_SLUG_LEN, &mut errs).and_then(|raw| {
        let lowered = raw.to_lowercase();
        if slug_re().is_match(&lowered) {
            Some(lowered)
        } else {
            errs.push(
                ErrorCode::InvalidFormat,
                "slug",
                "slug must be kebab-case (lowercase letters, digits, dashes)",
                &Value::String(raw),
            );
            None
        }
    });
    let title = take_string(map, "title", MAX_TITLE_LEN, &mut errs);
    let body = take_string(map, "body", MAX_ARTICLE_BODY_LEN, &mut errs);
    let author_id = take_id(map, "author_id", &mut errs);
    let status = take_enum(map, "status", ARTICLE_STATUSES, &mut errs);
    let published_at = take_datetime(map, "published_at", &mut errs);
    let created_at = take_datetime(map, "created_at", &mut errs);
    let updated_at = take_datetime(map, "updated_at", &mut errs);
    let tags = take_tags(map, &mut errs);

    if id.is_none() && slug.is_none() && is_absent(map, "slug") && is_absent(map, "id") {
        errs.push(
            ErrorCode::MissingRequiredField,
            "id",
            "article record must have an id or a slug",
            &Value::Null,
        );
    }

    // Drafts cannot carry a publication timestamp.
    if status.as_deref() == Some("draft") && published_at.is_some() {
        errs.push(
            ErrorCode::InvalidFormat,
            "published_at",
            "draft articles cannot have published_at",
            map.get("published_at").unwrap_or(&Value::Null),
        );
    }

    if let Some(author_id) = author_id {
        if !cache.user_exists(author_id).await? {
            errs.errors.push(
                TransferError::new(
                    ErrorCode::InvalidReference,
                    format!("author {author_id} does not exist"),
                )
                .with_field("author_id"),
            );
        }
    }

    // Slug uniqueness mirrors email uniqueness.
    if let Some(slug) = &slug {
        if let Some(prior) = cache.claim_slug(slug, index) {
            errs.errors.push(
                TransferError::new(
                    ErrorCode::DuplicateValue,
                    format!("slug already used by record {prior} in this import"),
                )
                .with_field("slug")
                .with_value(Value::String(slug.clone())),
            );
        } else if let Some(owner) = cache.slug_owner(slug).await? {
            if id != Some(owner) {
                errs.errors.push(
                    TransferError::new(
                        ErrorCode::DuplicateValue,
                        "slug already belongs to another article",
                    )
                    .with_field("slug")
                    .with_value(Value::String(slug.clone())),
                );
            }
        }
    }

    if !errs.errors.is_empty() {
        return Ok(ValidationOutcome {
            errors: errs.errors,
            ..ValidationOutcome::default()
        });
    }
    Ok(ValidationOutcome {
        normalized: Some(NormalizedRecord::Article(ArticleRecord {
            id,
            slug,
            title,
            body,
            author_id,
            tags,
            status,
            published_at,
            created_at,
            updated_at,
        })),
        ..ValidationOutcome::default()
    })
}

fn take_tags(map: &Map<String, Value>, errs: &mut FieldErrors) -> Option<Vec<String>> {
    let value = map.get("tags")?;
    if value.is_null() {
        return None;
    }
    let Some(items) = value.as_array() else {
        errs.push(ErrorCode::InvalidType, "tags", "tags must be an array of strings", value);
        return None;
    };
    let mut tags: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let Some(raw) = item.as_str() else {
            errs.push(ErrorCode::InvalidType, "tags", "tags must be an array of strings", value);
            return None;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let tag = trimmed.to_string();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    Some(tags)
}

async fn validate_comment(
    map: &Map<String, Value>,
    cache: &mut ReferenceCache,
) -> TransferResult<ValidationOutcome> {
    let mut errs = FieldErrors::new();
    errs.reject_unknown(
        map,
        &["id", "article_id", "user_id", "body", "created_at", "updated_at"],
    );

    let id = take_id(map, "id", &mut errs);
    if id.is_none() && is_absent(map, "id") {
        errs.push(
            ErrorCode::MissingRequiredField,
            "id",
            "comment record must have an id",
            &Value::Null,
        );
    }

    let article_id = take_id(map, "article_id", &mut errs);
    if article_id.is_none() && is_absent(map, "article_id") {
        errs.push(
            ErrorCode::MissingRequiredField,
            "article_id",
            "comment record must have an article_id",
            &Value::Null,
        );
    }
    let user_id = take_id(map, "user_id", &mut errs);
    if user_id.is_none() && is_absent(map, "user_id") {
        errs.push(
            ErrorCode::MissingRequiredField,
            "user_id",
            "comment record must have a user_id",
            &Value::Null,
        );
    }

    let body = take_string(map, "body", usize::MAX, &mut errs);
    match &body {
        Some(text) => {
            if text.split_whitespace().count() > MAX_COMMENT_BODY_WORDS {
                errs.push(
                    ErrorCode::ValueTooLong,
                    "body",
                    format!("comment body exceeds {MAX_COMMENT_BODY_WORDS} words"),
                    &Value::String(text.clone()),
                );
            }
        }
        None => {
            if is_absent(map, "body") {
                errs.push(
                    ErrorCode::MissingRequiredField,
                    "body",
                    "comment record must have a body",
                    &Value::Null,
                );
            }
        }
    }

    let created_at = take_datetime(map, "created_at", &mut errs);
    let updated_at = take_datetime(map, "updated_at", &mut errs);

    if let Some(article_id) = article_id {
        if !cache.article_exists(article_id).await? {
            errs.errors.push(
                TransferError::new(
                    ErrorCode::InvalidReference,
                    format!("article {article_id} does not exist"),
                )
                .with_field("article_id"),
            );
        }
    }
    if let Some(user_id) = user_id {
        if !cache.user_exists(user_id).await? {
            errs.errors.push(
                TransferError::new(
                    ErrorCode::InvalidReference,
                    format!("user {user_id} does not exist"),
                )
                .with_field("user_id"),
            );
        }
    }

    if !errs.errors.is_empty() {
        return Ok(ValidationOutcome {
            errors: errs.errors,
            ..ValidationOutcome::default()
        });
    }
    Ok(ValidationOutcome {
        normalized: Some(NormalizedRecord::Comment(CommentRecord {
            id,
            article_id,
            user_id,
            body,
            created_at,
            updated_at,
        })),
        ..ValidationOutcome::default()
    })
}
