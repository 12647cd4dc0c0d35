//! Pure per-tool parameter validation and normalization.
//!
//! Runs before any network call: a tool handler that gets an `Err` here must
//! not have touched the upstream client.

use crate::{Error, Livecrawl, Result};
use std::collections::BTreeSet;

pub const DEFAULT_NUM_RESULTS: usize = 3;
pub const DEFAULT_SUBPAGES: usize = 5;
pub const DEFAULT_INCLUDE_TEXT: bool = false;

/// Required non-blank string (`query`, `url`, `instructions`, `task_id`).
pub fn require_str(field: &'static str, value: Option<String>) -> Result<String> {
    let s = value.unwrap_or_default();
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation(field, "must be a non-empty string"));
    }
    Ok(s.to_string())
}

/// Required non-empty list of non-blank URLs, order preserved.
pub fn require_urls(field: &'static str, value: Option<Vec<String>>) -> Result<Vec<String>> {
    let urls = value.unwrap_or_default();
    if urls.is_empty() {
        return Err(Error::validation(field, "must be a non-empty list of URLs"));
    }
    let mut out = Vec::with_capacity(urls.len());
    for u in urls {
        let u = u.trim();
        if u.is_empty() {
            return Err(Error::validation(field, "must not contain empty URLs"));
        }
        out.push(u.to_string());
    }
    Ok(out)
}

pub fn num_results(value: Option<usize>) -> usize {
    value.unwrap_or(DEFAULT_NUM_RESULTS).max(1)
}

pub fn subpage_count(value: Option<usize>) -> usize {
    value.unwrap_or(DEFAULT_SUBPAGES).max(1)
}

pub fn include_text(value: Option<bool>) -> bool {
    value.unwrap_or(DEFAULT_INCLUDE_TEXT)
}

/// Optional livecrawl mode; anything outside {always, preferred, never} is rejected.
pub fn livecrawl(field: &'static str, value: Option<String>) -> Result<Option<Livecrawl>> {
    match value {
        None => Ok(None),
        Some(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            Livecrawl::parse(s).map(Some).ok_or_else(|| {
                Error::validation(field, format!("must be one of always/preferred/never, got `{s}`"))
            })
        }
    }
}

pub fn target_keywords(value: Option<Vec<String>>) -> BTreeSet<String> {
    value
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Structural check on a user-supplied JSON Schema. Full validation is the
/// provider's job; here we only reject shapes that cannot possibly be a
/// schema object.
pub fn output_schema(
    field: &'static str,
    value: Option<serde_json::Value>,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    let Some(v) = value else {
        return Ok(None);
    };
    let serde_json::Value::Object(obj) = v else {
        return Err(Error::validation(field, "must be a JSON Schema object"));
    };
    if let Some(ty) = obj.get("type") {
        let ok = match ty {
            serde_json::Value::String(_) => true,
            serde_json::Value::Array(items) => items.iter().all(|i| i.is_string()),
            _ => false,
        };
        if !ok {
            return Err(Error::validation(
                field,
                "`type` must be a string or an array of strings",
            ));
        }
    }
    Ok(Some(obj))
}
