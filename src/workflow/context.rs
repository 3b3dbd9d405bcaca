//! Run context: the variables a workflow run carries between stages, and
//! `{{ path }}` interpolation against them.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{clog_warn, Error, Result};

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("static variable pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext {
    vars: Map<String, Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: Map<String, Value>) -> Self {
        Self { vars }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Look up a dotted path. Numeric segments index into arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.vars.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate objects. A scalar in the
    /// way is replaced by an object.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::Validation(format!("invalid variable path: {:?}", path)));
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| Error::Validation("empty variable path".into()))?;
        let mut map = &mut self.vars;
        for segment in parents {
            let entry = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = entry
                .as_object_mut()
                .ok_or_else(|| Error::invalid_state("context path is not an object"))?;
        }
        map.insert(last.to_string(), value);
        Ok(())
    }

    /// Replace every `{{ path }}` with the value at `path`. Strings are
    /// inserted as-is, other values as JSON. Unknown paths are left
    /// verbatim.
    pub fn interpolate(&self, template: &str) -> String {
        VAR_RE
            .replace_all(template, |caps: &Captures| match self.get(&caps[1]) {
                Some(value) => value_to_text(value),
                None => {
                    clog_warn!("Unknown variable in template: {}", &caps[1]);
                    caps[0].to_string()
                }
            })
            .into_owned()
    }

    /// Interpolate every string inside `value`. A string that is exactly
    /// one `{{ path }}` takes the referenced value with its type intact.
    pub fn render(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(caps) = VAR_RE.captures(s.trim()) {
                    if caps[0].len() == s.trim().len() {
                        if let Some(found) = self.get(&caps[1]) {
                            return found.clone();
                        }
                    }
                }
                Value::String(self.interpolate(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Fold the changes `child` made relative to `base` into `self`.
    /// Objects are merged key by key so sibling writes under the same
    /// namespace both survive.
    pub fn merge_changes(&mut self, base: &RunContext, child: &RunContext) {
        merge_maps(&mut self.vars, &base.vars, &child.vars);
    }
}

fn merge_maps(target: &mut Map<String, Value>, base: &Map<String, Value>, child: &Map<String, Value>) {
    let empty = Map::new();
    for (key, value) in child {
        let before = base.get(key);
        if before == Some(value) {
            continue;
        }
        if let (Value::Object(after), Some(Value::Object(slot))) = (value, target.get_mut(key)) {
            let before = match before {
                Some(Value::Object(b)) => b,
                _ => &empty,
            };
            merge_maps(slot, before, after);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new();
        ctx.set("run.id", json!("r-1")).unwrap();
        ctx.set("plan.response", json!("three steps")).unwrap();
        ctx.set("files", json!(["a.rs", "b.rs"])).unwrap();
        ctx.set("count", json!(2)).unwrap();
        ctx
    }

    #[test]
    fn test_dotted_get_and_set() {
        let ctx = ctx();
        assert_eq!(ctx.get("run.id"), Some(&json!("r-1")));
        assert_eq!(ctx.get("files.1"), Some(&json!("b.rs")));
        assert_eq!(ctx.get("plan.missing"), None);
        assert_eq!(ctx.get("count.x"), None);
    }

    #[test]
    fn test_set_replaces_scalar_parent() {
        let mut ctx = ctx();
        ctx.set("count.inner", json!(true)).unwrap();
        assert_eq!(ctx.get("count.inner"), Some(&json!(true)));
        assert!(ctx.set("a..b", json!(1)).is_err());
    }

    #[test]
    fn test_interpolation() {
        let ctx = ctx();
        assert_eq!(
            ctx.interpolate("Run {{ run.id }}: {{plan.response}} over {{ count }} files"),
            "Run r-1: three steps over 2 files"
        );
        assert_eq!(ctx.interpolate("{{ files }}"), r#"["a.rs","b.rs"]"#);
    }

    #[test]
    fn test_unknown_variable_left_verbatim() {
        assert_eq!(
            ctx().interpolate("Hello {{ nobody.home }}!"),
            "Hello {{ nobody.home }}!"
        );
    }

    #[test]
    fn test_render_keeps_types_for_whole_references() {
        let ctx = ctx();
        let rendered = ctx.render(&json!({
            "items": "{{ files }}",
            "label": "n={{ count }}",
            "nested": ["{{ count }}"]
        }));
        assert_eq!(
            rendered,
            json!({"items": ["a.rs", "b.rs"], "label": "n=2", "nested": [2]})
        );
    }

    #[test]
    fn test_merge_changes_keeps_sibling_writes() {
        let base = ctx();
        let mut left = base.clone();
        left.set("review.lint", json!("ok")).unwrap();
        let mut right = base.clone();
        right.set("review.tests", json!("ok")).unwrap();
        right.set("count", json!(3)).unwrap();

        let mut merged = base.clone();
        merged.merge_changes(&base, &left);
        merged.merge_changes(&base, &right);

        assert_eq!(merged.get("review.lint"), Some(&json!("ok")));
        assert_eq!(merged.get("review.tests"), Some(&json!("ok")));
        assert_eq!(merged.get("count"), Some(&json!(3)));
        assert_eq!(merged.get("plan.response"), Some(&json!("three steps")));
    }
}
