use serde_json::Value;

use super::{lexer, lookup_path, TemplateScope};

/// Resolves one filter argument token: a quoted/numeric/bool/null literal,
/// or a path looked up against the scope.
fn resolve_arg(token: &str, scope: &TemplateScope) -> Option<Value> {
    lexer::parse_literal(token).or_else(|| lookup_path(token, scope))
}

fn is_empty(value: &Option<Value>) -> bool {
    match value {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

/// Applies one named filter stage. Unsupported filters and filters invoked
/// with the wrong argument shape fail silently, passing the input through
/// unchanged (the caller's `ResolutionTracker` already captured the base
/// lookup failure, if any).
pub fn apply_filter(name: &str, current: Option<Value>, args: &[String], scope: &TemplateScope) -> Option<Value> {
    match name {
        "default" => {
            if is_empty(&current) {
                args.first().and_then(|a| resolve_arg(a, scope))
            } else {
                current
            }
        }
        "slice" => {
            let start: usize = args.first().and_then(|a| a.trim().parse().ok()).unwrap_or(0);
            let length: Option<usize> = args.get(1).and_then(|a| a.trim().parse().ok());
            match current {
                Some(Value::String(s)) => {
                    let chars: Vec<char> = s.chars().collect();
                    let end = length.map(|l| (start + l).min(chars.len())).unwrap_or(chars.len());
                    if start >= chars.len() {
                        Some(Value::String(String::new()))
                    } else {
                        Some(Value::String(chars[start..end].iter().collect()))
                    }
                }
                Some(Value::Array(items)) => {
                    let end = length.map(|l| (start + l).min(items.len())).unwrap_or(items.len());
                    if start >= items.len() {
                        Some(Value::Array(Vec::new()))
                    } else {
                        Some(Value::Array(items[start..end].to_vec()))
                    }
                }
                other => other,
            }
        }
        "replace" => {
            let find = args.first().and_then(|a| lexer::parse_literal(a));
            let replacement = args.get(1).and_then(|a| lexer::parse_literal(a));
            match (current, find, replacement) {
                (Some(Value::String(s)), Some(Value::String(find)), Some(Value::String(replacement))) => {
                    Some(Value::String(s.replace(&find, &replacement)))
                }
                (other, _, _) => other,
            }
        }
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slice_string() {
        let scope = TemplateScope::new();
        let out = apply_filter("slice", Some(json!("hello world")), &["0".into(), "5".into()], &scope);
        assert_eq!(out, Some(json!("hello")));
    }

    #[test]
    fn replace_string() {
        let scope = TemplateScope::new();
        let out = apply_filter("replace", Some(json!("a-b-c")), &["'-'".into(), "'_'".into()], &scope);
        assert_eq!(out, Some(json!("a_b_c")));
    }

    #[test]
    fn unsupported_filter_passes_through() {
        let scope = TemplateScope::new();
        let out = apply_filter("uppercase", Some(json!("a")), &[], &scope);
        assert_eq!(out, Some(json!("a")));
    }
}
