//! Dotted path lookup into step data.
//!
//! Paths look like `fetch.body.items.0.title`: object keys and array
//! indices separated by dots. When resolving against execution data the
//! first segment names a step in `step_io_data`.

use serde_json::{Map, Value};

/// Follows `path` inside `value`. An empty path returns `value` itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Splits `step.rest.of.path` into `("step", "rest.of.path")`.
pub fn split_head(path: &str) -> (&str, &str) {
    match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    }
}

/// Resolves a path whose first segment is a key of `data`, falling back to
/// looking the whole path up in `fallback` (typically the trigger payload).
pub fn resolve<'a>(
    data: &'a Map<String, Value>,
    fallback: Option<&'a Value>,
    path: &str,
) -> Option<&'a Value> {
    let (head, rest) = split_head(path);
    if let Some(root) = data.get(head) {
        if let Some(found) = lookup(root, rest) {
            return Some(found);
        }
    }
    fallback.and_then(|value| lookup(value, path))
}
