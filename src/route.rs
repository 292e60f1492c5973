//! Route keys and route pattern matching.
//!
//! A route is the canonical string `METHOD:PATH` identifying a request
//! class. Patterns are authored in the same shape; `METHOD` may be `*` and
//! `PATH` may contain `*` wildcards:
//!
//! - a `*` as the last segment, with no other wildcard in the pattern, is a
//!   trailing wildcard: the request path only needs the pattern's prefix;
//! - a `*` anywhere else matches exactly one non-empty path segment;
//! - `**` is forbidden, as is a path ending in `*` that is not `/*`.
//!
//! Patterns are compiled and validated once at config load; matching at
//! request time is allocation-free. Path matching is case-sensitive, methods
//! are compared after uppercasing the request side.

use std::fmt;

/// Format an HTTP method and path into the canonical route key.
pub fn route_key(method: &str, path: &str) -> String {
    format!("{}:{}", method.to_uppercase(), path)
}

/// Split a route string into its method and path components. A string
/// without a `:` separator is treated as a path pattern for any method.
pub fn split_route(route: &str) -> (&str, &str) {
    match route.split_once(':') {
        Some((method, path)) => (method, path),
        None => ("*", route),
    }
}

/// One `/`-separated element of a compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// Compiled form of a path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathMatcher {
    /// No wildcards: request path must equal the pattern exactly.
    Exact(String),
    /// `P/*` with no other wildcard: request path must start with `P`.
    Prefix(String),
    /// Segment-by-segment comparison with single-segment wildcards.
    Segments(Vec<Segment>),
}

/// A compiled route pattern. Retains the literal string for logs and config
/// echo; matching uses the pre-segmented form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    method: Option<String>,
    path: PathMatcher,
}

impl RoutePattern {
    /// Compile and validate a pattern. Returns a human-readable reason on
    /// malformed input; callers treat that as fatal.
    pub fn compile(pattern: &str) -> Result<Self, String> {
        let (method, path) = split_route(pattern);

        if method.is_empty() {
            return Err("method part is empty".to_string());
        }
        let method = if method == "*" {
            None
        } else {
            if !method.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(format!("method '{method}' must be uppercase or '*'"));
            }
            Some(method.to_string())
        };

        if path.is_empty() {
            return Err("path part is empty".to_string());
        }
        if !path.starts_with('/') && path != "*" {
            return Err("path must start with '/' or be the lone token '*'".to_string());
        }
        if path.contains("**") {
            return Err("'**' wildcards are not supported".to_string());
        }
        if path.ends_with('*') && !path.ends_with("/*") && path != "*" {
            return Err("a path may only end in a whole-segment '/*' wildcard".to_string());
        }

        let segments: Vec<Segment> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "*" {
                    Ok(Segment::Wildcard)
                } else if s.contains('*') {
                    Err(format!("'*' must be a whole segment, found '{s}'"))
                } else {
                    Ok(Segment::Literal(s.to_string()))
                }
            })
            .collect::<Result<_, _>>()?;

        let wildcard_count = segments
            .iter()
            .filter(|s| matches!(s, Segment::Wildcard))
            .count();

        // A trailing "/*" only acts as a prefix match when it is the sole
        // wildcard; otherwise every segment must line up.
        let path = if path.ends_with("/*") && wildcard_count == 1 {
            PathMatcher::Prefix(path[..path.len() - 2].to_string())
        } else if wildcard_count == 0 {
            PathMatcher::Exact(path.to_string())
        } else {
            PathMatcher::Segments(segments)
        };

        Ok(Self {
            raw: pattern.to_string(),
            method,
            path,
        })
    }

    /// The pattern as authored.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern matches a request `(method, path)` pair. The
    /// method is uppercased on the request side; paths are case-sensitive.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(want) = &self.method {
            if !method.eq_ignore_ascii_case(want) {
                return false;
            }
        }
        match &self.path {
            PathMatcher::Exact(p) => path == p,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Segments(segments) => {
                let mut request = path.split('/').filter(|s| !s.is_empty());
                for segment in segments {
                    let Some(got) = request.next() else {
                        return false;
                    };
                    match segment {
                        Segment::Wildcard => {}
                        Segment::Literal(want) => {
                            if got != want {
                                return false;
                            }
                        }
                    }
                }
                request.next().is_none()
            }
        }
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
