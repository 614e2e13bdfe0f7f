//! Path normalization for L1 bucket keys.
//!
//! Rules declare paths in several dialects (literal paths, `{name}` and
//! `:name` parameters, regex fragments). Normalization collapses every
//! dynamic segment into `*` so that a declared pattern and an incoming
//! concrete path land in the same index bucket:
//!
//! ```text
//! /api/users/123        => /api/users/*
//! ^/api/users/\d+$      => /api/users/*
//! /api/orders/{id}      => /api/orders/*
//! /api/users/:userId    => /api/users/*
//! ```

use std::sync::OnceLock;

use regex::Regex;

/// `{name}` and `:name` path parameters.
static PARAM_RE: OnceLock<Regex> = OnceLock::new();

/// Runs of two or more `/*` segments.
static STAR_RUN_RE: OnceLock<Regex> = OnceLock::new();

fn param_regex() -> &'static Regex {
    PARAM_RE.get_or_init(|| Regex::new(r"\{[^}]+\}|:\w+").unwrap())
}

fn star_run_regex() -> &'static Regex {
    STAR_RUN_RE.get_or_init(|| Regex::new(r"(/\*){2,}").unwrap())
}

/// Characters that mark a path segment as a regex fragment.
const REGEX_META: &[char] = &['+', '*', '?', '[', ']', '{', '}', '\\'];

/// Collapse the dynamic parts of a path into `*`.
///
/// Transformations, in order:
/// 1. strip a leading `^` and trailing `$`
/// 2. replace `{name}` and `:name` parameters with `*`
/// 3. replace any segment containing regex metacharacters with `*`
/// 4. replace purely-numeric segments with `*`
/// 5. collapse runs of `/*` into a single `/*`
///
/// The result is idempotent and never panics, even on invalid regex input.
pub fn normalize_path(path: &str) -> String {
    let path = path.strip_prefix('^').unwrap_or(path);
    let path = path.strip_suffix('$').unwrap_or(path);

    let path = param_regex().replace_all(path, "*");

    let normalized = path
        .split('/')
        .map(normalize_segment)
        .collect::<Vec<_>>()
        .join("/");

    star_run_regex().replace_all(&normalized, "/*").into_owned()
}

fn normalize_segment(segment: &str) -> &str {
    if segment.contains(REGEX_META) {
        return "*";
    }
    if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
        return "*";
    }
    segment
}
