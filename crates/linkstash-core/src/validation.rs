//! # Validation Module
//!
//! Mutation payload validation for linkstash.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Dashboard form (TypeScript)                                  │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE (before any optimistic apply)                    │
//! │  ├── URL normalization: "y.com" → "https://y.com"                      │
//! │  ├── URL must parse with an http(s) scheme and a host                  │
//! │  ├── Empty title on create → URL host name                             │
//! │  └── Only schema fields (title, url) are accepted                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Remote store constraints                                     │
//! │                                                                         │
//! │  A payload rejected here never touches the RecordStore.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use linkstash_core::validation::{normalize_url, prepare_create};
//!
//! assert_eq!(normalize_url("y.com").unwrap(), "https://y.com");
//!
//! let fields = prepare_create(None, "docs.rs").unwrap();
//! assert_eq!(fields["title"], "docs.rs");
//! ```

use serde_json::Value;
use url::Url;

use crate::error::ValidationError;
use crate::types::{Fields, Record, FIELD_TITLE, FIELD_URL};
use crate::{MAX_TITLE_LEN, MAX_URL_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// URL Validators
// =============================================================================

/// Normalizes and validates a bookmark URL.
///
/// ## Rules
/// - Must not be empty
/// - `https://` is prepended when no http(s) scheme is given
/// - Must parse as an absolute URL with a host
/// - Must be at most [`MAX_URL_LEN`] characters after normalization
///
/// ## Example
/// ```rust
/// use linkstash_core::validation::normalize_url;
///
/// assert_eq!(normalize_url("http://a.dev/x").unwrap(), "http://a.dev/x");
/// assert!(normalize_url("").is_err());
/// assert!(normalize_url("not a url").is_err());
/// ```
pub fn normalize_url(input: &str) -> ValidationResult<String> {
    let input = input.trim();

    if input.is_empty() {
        return Err(ValidationError::Required {
            field: FIELD_URL.to_string(),
        });
    }

    let formatted = if input.starts_with("http://") || input.starts_with("https://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };

    if formatted.len() > MAX_URL_LEN {
        return Err(ValidationError::TooLong {
            field: FIELD_URL.to_string(),
            max: MAX_URL_LEN,
        });
    }

    let parsed = Url::parse(&formatted).map_err(|e| ValidationError::InvalidFormat {
        field: FIELD_URL.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::InvalidFormat {
            field: FIELD_URL.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(formatted)
}

/// Returns the host name of an already-normalized URL.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Returns the domain shown on a bookmark card.
///
/// Records written by other clients may lack a scheme, so one is assumed.
/// Returns `None` when the record has no usable URL.
pub fn display_domain(record: &Record) -> Option<String> {
    let url = record.url()?;
    let formatted = if url.starts_with("http") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    host_of(&formatted)
}

// =============================================================================
// Title Validators
// =============================================================================

/// Validates and trims a title.
///
/// ## Rules
/// - Trimmed; may be empty (callers decide the default)
/// - Must be at most [`MAX_TITLE_LEN`] characters
pub fn validate_title(title: &str) -> ValidationResult<String> {
    let title = title.trim();

    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::TooLong {
            field: FIELD_TITLE.to_string(),
            max: MAX_TITLE_LEN,
        });
    }

    Ok(title.to_string())
}

// =============================================================================
// Payload Builders
// =============================================================================

/// Builds the field set for a new bookmark.
///
/// ## User Workflow
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  Dashboard: Add Bookmark                                                │
/// │                                                                         │
/// │  title: ""          url: "docs.rs/tokio"                                │
/// │       │                                                                 │
/// │       ▼                                                                 │
/// │  prepare_create ← THIS FUNCTION                                        │
/// │       │                                                                 │
/// │       ├── url empty / unparsable? → ValidationError                    │
/// │       │                                                                 │
/// │       └── OK → { title: "docs.rs", url: "https://docs.rs/tokio" }      │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub fn prepare_create(title: Option<&str>, url: &str) -> ValidationResult<Fields> {
    let url = normalize_url(url)?;
    let title = validate_title(title.unwrap_or_default())?;

    let title = if title.is_empty() {
        host_of(&url).unwrap_or_else(|| url.clone())
    } else {
        title
    };

    let mut fields = Fields::new();
    fields.insert(FIELD_TITLE.to_string(), Value::String(title));
    fields.insert(FIELD_URL.to_string(), Value::String(url));
    Ok(fields)
}

/// Validates a raw field map for a create.
pub fn validate_create_fields(fields: &Fields) -> ValidationResult<Fields> {
    check_known_fields(fields)?;

    let url = string_field(fields, FIELD_URL)?.ok_or_else(|| ValidationError::Required {
        field: FIELD_URL.to_string(),
    })?;
    let title = string_field(fields, FIELD_TITLE)?;

    prepare_create(title, url)
}

/// Validates the field changes of an edit.
///
/// ## Rules
/// - At least one field must change
/// - Only `title` and `url` may be set, both as strings
/// - `url` is normalized the same way as on create
pub fn prepare_update(changes: &Fields) -> ValidationResult<Fields> {
    if changes.is_empty() {
        return Err(ValidationError::NoChanges);
    }

    check_known_fields(changes)?;

    let mut validated = Fields::new();

    if let Some(title) = string_field(changes, FIELD_TITLE)? {
        validated.insert(
            FIELD_TITLE.to_string(),
            Value::String(validate_title(title)?),
        );
    }

    if let Some(url) = string_field(changes, FIELD_URL)? {
        validated.insert(FIELD_URL.to_string(), Value::String(normalize_url(url)?));
    }

    Ok(validated)
}

fn check_known_fields(fields: &Fields) -> ValidationResult<()> {
    match fields
        .keys()
        .find(|name| name.as_str() != FIELD_TITLE && name.as_str() != FIELD_URL)
    {
        Some(unknown) => Err(ValidationError::UnknownField {
            field: unknown.clone(),
        }),
        None => Ok(()),
    }
}

fn string_field<'a>(fields: &'a Fields, name: &str) -> ValidationResult<Option<&'a str>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ValidationError::InvalidFormat {
            field: name.to_string(),
            reason: "must be a string".to_string(),
        }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
