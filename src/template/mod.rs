//! Hand-written template engine resolving `{{ path.to.value | filter:arg }}`
//! expressions and the legacy `$a.b` form against a [`TemplateScope`].
//!
//! Kept dependency-free on purpose: the source system's own authors chose a
//! small hand-rolled parser over a general templating crate, and nothing
//! in this stack needs more than path lookups, a pipe-separated filter
//! chain and a handful of literal kinds.

mod lexer;
mod filters;

use serde_json::Value;
use std::collections::HashMap;

pub use filters::apply_filter;

/// Root names a `TemplateScope` may carry. Reserved: a lookup whose first
/// path segment isn't one of these (or isn't populated for this call) never
/// resolves.
pub const RESERVED_ROOTS: &[&str] =
    &["shared", "steps", "run", "parameters", "step", "stepParameters", "fanout", "item"];

#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    roots: HashMap<String, Value>,
}

impl TemplateScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, name: &str, value: Value) -> Self {
        self.roots.insert(name.to_string(), value);
        self
    }

    pub fn set_root(&mut self, name: &str, value: Value) {
        self.roots.insert(name.to_string(), value);
    }

    pub fn root(&self, name: &str) -> Option<&Value> {
        self.roots.get(name)
    }
}

/// One failed lookup recorded for the caller. `path` is the dotted lookup
/// attempted, `expression` is the raw source text of the expression that
/// referenced it.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedReference {
    pub path: String,
    pub expression: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionTracker {
    pub issues: Vec<UnresolvedReference>,
}

impl ResolutionTracker {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    fn record(&mut self, path: &str, expression: &str) {
        self.issues.push(UnresolvedReference { path: path.to_string(), expression: expression.to_string() });
    }
}

/// Looks up a dotted path against the scope's roots. The first segment must
/// name a populated root; later segments walk object keys / array indices.
/// Implements the legacy `.output -> .result` retry and the `files[]`
/// unwrap described for resolved object values.
pub fn lookup_path(path: &str, scope: &TemplateScope) -> Option<Value> {
    let value = lookup_path_raw(path, scope).or_else(|| {
        if let Some(stripped) = path.strip_suffix(".output") {
            lookup_path_raw(&format!("{stripped}.result"), scope)
        } else if path == "output" {
            lookup_path_raw("result", scope)
        } else {
            None
        }
    })?;
    Some(unwrap_files(value))
}

fn unwrap_files(value: Value) -> Value {
    if let Value::Object(ref map) = value {
        if let Some(Value::Array(files)) = map.get("files") {
            return Value::Array(files.clone());
        }
    }
    value
}

fn lookup_path_raw(path: &str, scope: &TemplateScope) -> Option<Value> {
    let mut segments = path.split('.');
    let root_name = segments.next()?;
    let mut current = scope.root(root_name)?.clone();
    for segment in segments {
        current = index_into(&current, segment)?;
    }
    Some(current)
}

fn index_into(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(segment).cloned(),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

/// Resolves every `{{ }}`/`$a.b` expression inside a string.
///
/// A whole-string single expression preserves the resolved value's type
/// (object/array survive); anything with surrounding or mixed text is
/// rendered through a stringifier. Unresolved lookups substitute `null` in
/// whole-string mode and `""` in mixed-text mode, and are recorded on
/// `tracker`.
pub fn resolve_string(input: &str, scope: &TemplateScope, tracker: &mut ResolutionTracker) -> Value {
    let modern = lexer::find_modern_expressions(input);
    if !modern.is_empty() {
        if modern.len() == 1 && modern[0].0 == 0 && modern[0].1 == input.len() {
            return resolve_expression(&modern[0].2, scope, tracker).unwrap_or(Value::Null);
        }
        let mut out = String::with_capacity(input.len());
        let mut cursor = 0;
        for (start, end, expr) in &modern {
            out.push_str(&input[cursor..*start]);
            let resolved = resolve_expression(expr, scope, tracker);
            out.push_str(&stringify(resolved.unwrap_or(Value::Null)));
            cursor = *end;
        }
        out.push_str(&input[cursor..]);
        return Value::String(out);
    }

    if let Some((start, end, path)) = lexer::find_legacy_expression(input) {
        if start == 0 && end == input.len() {
            return lookup_path(&path, scope).unwrap_or_else(|| {
                tracker.record(&path, input);
                Value::Null
            });
        }
        let resolved = lookup_path(&path, scope).unwrap_or_else(|| {
            tracker.record(&path, input);
            Value::Null
        });
        let mut out = String::with_capacity(input.len());
        out.push_str(&input[..start]);
        out.push_str(&stringify(resolved));
        out.push_str(&input[end..]);
        return Value::String(out);
    }

    Value::String(input.to_string())
}

/// Resolves one `{{ ... }}` body: a base lookup/literal followed by zero or
/// more `| filter:arg,arg` stages, evaluated left to right.
fn resolve_expression(expr: &str, scope: &TemplateScope, tracker: &mut ResolutionTracker) -> Option<Value> {
    let stages = lexer::split_pipeline(expr);
    let base_expr = stages[0].trim();
    let mut current = lexer::parse_literal(base_expr).or_else(|| {
        let resolved = lookup_path(base_expr, scope);
        if resolved.is_none() {
            tracker.record(base_expr, expr);
        }
        resolved
    });

    for stage in &stages[1..] {
        let (name, args) = lexer::parse_filter(stage);
        current = apply_filter(&name, current, &args, scope);
    }
    current
}

fn stringify(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(&other).unwrap_or_default(),
    }
}

/// Recursively resolves every string leaf of a JSON value. Values with no
/// `{{ }}`/`$a.b` content are returned unchanged (round-trip law).
pub fn resolve_json_templates(value: &Value, scope: &TemplateScope, tracker: &mut ResolutionTracker) -> Value {
    match value {
        Value::String(s) => resolve_string(s, scope, tracker),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_json_templates(v, scope, tracker)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_json_templates(v, scope, tracker)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with_parameters(value: Value) -> TemplateScope {
        TemplateScope::new().with_root("parameters", value)
    }

    #[test]
    fn whole_string_expression_preserves_type() {
        let scope = scope_with_parameters(json!({"items": [1, 2, 3]}));
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("{{ parameters.items }}", &scope, &mut tracker);
        assert_eq!(resolved, json!([1, 2, 3]));
        assert!(!tracker.has_issues());
    }

    #[test]
    fn unresolved_whole_string_is_null_with_issue() {
        let scope = TemplateScope::new();
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("{{ unknown.value }}", &scope, &mut tracker);
        assert_eq!(resolved, Value::Null);
        assert_eq!(tracker.issues.len(), 1);
    }

    #[test]
    fn default_filter_only_fires_on_null_or_empty() {
        let scope = TemplateScope::new();
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("{{ unknown.value | default:'x' }}", &scope, &mut tracker);
        assert_eq!(resolved, json!("x"));
    }

    #[test]
    fn mixed_text_stringifies_objects() {
        let scope = scope_with_parameters(json!({"name": "a"}));
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("hello {{ parameters.name }}!", &scope, &mut tracker);
        assert_eq!(resolved, json!("hello a!"));
    }

    #[test]
    fn legacy_dollar_path_resolves() {
        let scope = scope_with_parameters(json!({"x": 42}));
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("$parameters.x", &scope, &mut tracker);
        assert_eq!(resolved, json!(42));
    }

    #[test]
    fn unchanged_value_round_trips() {
        let scope = TemplateScope::new();
        let mut tracker = ResolutionTracker::default();
        let v = json!({"a": 1, "b": [1, 2, "plain"]});
        let resolved = resolve_json_templates(&v, &scope, &mut tracker);
        assert_eq!(resolved, v);
        assert!(!tracker.has_issues());
    }

    #[test]
    fn output_alias_retries_as_result() {
        let scope = TemplateScope::new().with_root("steps", json!({"a": {"result": {"value": 1}}}));
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("{{ steps.a.output }}", &scope, &mut tracker);
        assert_eq!(resolved, json!({"value": 1}));
    }

    #[test]
    fn files_array_unwrapped() {
        let scope = TemplateScope::new().with_root("steps", json!({"a": {"result": {"files": [1, 2]}}}));
        let mut tracker = ResolutionTracker::default();
        let resolved = resolve_string("{{ steps.a.result }}", &scope, &mut tracker);
        assert_eq!(resolved, json!([1, 2]));
    }
}
