//! Semantic response comparison: headers, then bodies.
//!
//! Status comparison is a plain equality check done by the job; this module
//! owns the two harder steps. Header comparison is order-insensitive on
//! names but positional on values, with a case-insensitive skip list. Body
//! comparison picks a comparator from the main response's content type:
//! JSON media types compare parse trees (object key order irrelevant, array
//! order significant), everything else compares bytes.

use http::HeaderMap;
use serde_json::Value;

/// Divergence classes, in the order they are checked. First divergence wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonKind {
    Identical,
    StatusDiff,
    HeaderDiff,
    BodyDiff,
}

impl ComparisonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonKind::Identical => "identical",
            ComparisonKind::StatusDiff => "status_diff",
            ComparisonKind::HeaderDiff => "header_diff",
            ComparisonKind::BodyDiff => "body_diff",
        }
    }
}

/// Outcome of the body comparison step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyComparison {
    Equal,
    Different,
    /// A JSON body failed to parse on either side; the comparison is
    /// inconclusive and no divergence is reported.
    Inconclusive,
}

/// Compare two header maps, ignoring names on the skip list
/// (case-insensitive). A name differs when it is present on one side only,
/// its value counts differ, or any positional value differs.
///
/// The returned names are in a deterministic order: main-side encounter
/// order first, then names present only on the test side.
pub fn diff_headers(main: &HeaderMap, test: &HeaderMap, skip_headers: &[String]) -> Vec<String> {
    let skipped = |name: &str| {
        skip_headers
            .iter()
            .any(|skip| skip.eq_ignore_ascii_case(name))
    };

    let mut different = Vec::new();

    for name in main.keys() {
        if skipped(name.as_str()) {
            continue;
        }
        let main_values: Vec<_> = main.get_all(name).iter().collect();
        let test_values: Vec<_> = test.get_all(name).iter().collect();
        if test_values.is_empty()
            || main_values.len() != test_values.len()
            || main_values
                .iter()
                .zip(&test_values)
                .any(|(a, b)| a != b)
        {
            different.push(name.as_str().to_string());
        }
    }

    for name in test.keys() {
        if skipped(name.as_str()) {
            continue;
        }
        if !main.contains_key(name) {
            different.push(name.as_str().to_string());
        }
    }

    different
}

/// Whether the main response's content type selects the JSON comparator.
/// Only the media type is inspected; parameters like `charset` are ignored.
pub fn is_json_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    matches!(media_type.as_str(), "application/json" | "application/ld+json")
}

/// Structural JSON equality: both sides parse, and their parse trees are
/// equal. A parse error on either side is surfaced to the caller.
pub fn json_bytes_equal(a: &[u8], b: &[u8]) -> Result<bool, serde_json::Error> {
    let a: Value = serde_json::from_slice(a)?;
    let b: Value = serde_json::from_slice(b)?;
    Ok(a == b)
}

/// Sentinel written over masked JSON paths.
const MASK_SENTINEL: &str = "useless";

/// Set a dotted path inside a JSON value to the mask sentinel, creating
/// intermediate objects as needed. Numeric segments index into existing
/// arrays; out-of-range indices leave the value untouched.
pub fn mask_json_path(value: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = value;

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();

        match current {
            Value::Array(items) => {
                let Ok(index) = segment.parse::<usize>() else {
                    return;
                };
                let Some(item) = items.get_mut(index) else {
                    return;
                };
                if last {
                    *item = Value::String(MASK_SENTINEL.to_string());
                    return;
                }
                current = item;
            }
            other => {
                // Intermediate non-objects are replaced so the path can
                // always be created.
                if !other.is_object() {
                    *other = Value::Object(serde_json::Map::new());
                }
                let map = match other {
                    Value::Object(map) => map,
                    _ => return,
                };
                if last {
                    map.insert(
                        segment.to_string(),
                        Value::String(MASK_SENTINEL.to_string()),
                    );
                    return;
                }
                current = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
        }
    }
}

/// Compare two response bodies.
///
/// JSON bodies that differ are re-compared after masking the configured
/// paths on both sides, so volatile fields (timestamps, request ids) do not
/// register as divergence.
pub fn compare_bodies(
    content_type: &str,
    main_body: &[u8],
    test_body: &[u8],
    skip_json_paths: &[String],
) -> BodyComparison {
    if !is_json_content_type(content_type) {
        return if main_body == test_body {
            BodyComparison::Equal
        } else {
            BodyComparison::Different
        };
    }

    let (mut main, mut test) = match (
        serde_json::from_slice::<Value>(main_body),
        serde_json::from_slice::<Value>(test_body),
    ) {
        (Ok(main), Ok(test)) => (main, test),
        _ => return BodyComparison::Inconclusive,
    };

    if main == test {
        return BodyComparison::Equal;
    }

    if skip_json_paths.is_empty() {
        return BodyComparison::Different;
    }

    for path in skip_json_paths {
        mask_json_path(&mut main, path);
        mask_json_path(&mut test, path);
    }

    if main == test {
        BodyComparison::Equal
    } else {
        BodyComparison::Different
    }
}
