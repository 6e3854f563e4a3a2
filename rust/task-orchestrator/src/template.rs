//! Template engine adapter (C2): evaluates `{{ … }}` expressions over a
//! variables map, recursing through maps/lists with an optional per-key
//! filter. Backed by `handlebars`, matching the teacher's prompt-rendering
//! stack (`taskdaemon`'s `prompts::loader` uses the same crate for the same
//! job: render a small expression language over a JSON-shaped context).
//!
//! The core never treats a template's *output* as executable: rendered
//! strings are data, sanitized at the sink, never re-interpreted as code.

use handlebars::Handlebars;
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};

/// External contract consumed by the orchestration core. Implementations
/// may wrap any expression language; this crate ships a `handlebars`-backed
/// default (`HandlebarsEngine`).
pub trait TemplateEngine: Send + Sync {
    /// True iff `s` contains a `{{ … }}` expression.
    fn has_template(&self, s: &str) -> bool;

    /// Recursively substitute templates in strings inside `v` (scalars,
    /// maps, lists); non-template values pass through unchanged.
    fn parse_any(&self, v: &Value, vars: &Value) -> Result<Value>;

    /// Like `parse_any`, but does not descend into subtrees whose top-level
    /// key satisfies `should_skip`. Used to defer `outputs` rendering.
    fn parse_map_with_filter(
        &self,
        m: &Map<String, Value>,
        vars: &Value,
        should_skip: &dyn Fn(&str) -> bool,
    ) -> Result<Value>;

    /// As `parse_any`, additionally re-parsing rendered strings that look
    /// like JSON (object/array/number/bool/null) back into typed values.
    fn parse_with_json_handling(&self, v: &Value, vars: &Value) -> Result<Value>;
}

/// Default `handlebars`-backed implementation.
pub struct HandlebarsEngine {
    registry: Handlebars<'static>,
}

impl std::fmt::Debug for HandlebarsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlebarsEngine").finish_non_exhaustive()
    }
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        register_helpers(&mut registry);
        Self { registry }
    }
}

impl HandlebarsEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self, template: &str, vars: &Value) -> Result<String> {
        self.registry
            .render_template(template, vars)
            .map_err(OrchestratorError::from)
    }
}

fn register_helpers(registry: &mut Handlebars<'static>) {
    handlebars::handlebars_helper!(eq: |a: Value, b: Value| a == b);
    handlebars::handlebars_helper!(ne: |a: Value, b: Value| a != b);
    handlebars::handlebars_helper!(add: |*args: f64| args.iter().sum::<f64>());
    registry.register_helper("eq", Box::new(eq));
    registry.register_helper("ne", Box::new(ne));
    registry.register_helper("add", Box::new(add));
}

impl TemplateEngine for HandlebarsEngine {
    fn has_template(&self, s: &str) -> bool {
        s.contains("{{")
    }

    fn parse_any(&self, v: &Value, vars: &Value) -> Result<Value> {
        match v {
            Value::String(s) => {
                if self.has_template(s) {
                    Ok(Value::String(self.render(s, vars)?))
                } else {
                    Ok(v.clone())
                }
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.parse_any(item, vars)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, val) in map {
                    out.insert(k.clone(), self.parse_any(val, vars)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn parse_map_with_filter(
        &self,
        m: &Map<String, Value>,
        vars: &Value,
        should_skip: &dyn Fn(&str) -> bool,
    ) -> Result<Value> {
        let mut out = Map::with_capacity(m.len());
        for (k, v) in m {
            if should_skip(k) {
                out.insert(k.clone(), v.clone());
            } else {
                out.insert(k.clone(), self.parse_any(v, vars)?);
            }
        }
        Ok(Value::Object(out))
    }

    fn parse_with_json_handling(&self, v: &Value, vars: &Value) -> Result<Value> {
        match v {
            Value::String(s) if self.has_template(s) => {
                let rendered = self.render(s, vars)?;
                Ok(serde_json::from_str(&rendered).unwrap_or(Value::String(rendered)))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.parse_with_json_handling(item, vars)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, val) in map {
                    out.insert(k.clone(), self.parse_with_json_handling(val, vars)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

/// True iff a template body's free variables reference the `tasks` bag,
/// meaning its evaluation must be deferred until the enclosing parent's
/// children are all terminal (spec §9 "Deferred template evaluation").
#[must_use]
pub fn references_tasks(v: &Value) -> bool {
    match v {
        Value::String(s) => s.contains("tasks.") || s.contains("tasks ") || s.contains("tasks)"),
        Value::Array(items) => items.iter().any(references_tasks),
        Value::Object(map) => map.values().any(references_tasks),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn has_template_detects_expression() {
        let engine = HandlebarsEngine::new();
        assert!(engine.has_template("hello {{ name }}"));
        assert!(!engine.has_template("hello name"));
    }

    #[test]
    fn parse_any_substitutes_scalar() {
        let engine = HandlebarsEngine::new();
        let vars = json!({ "name": "world" });
        let out = engine
            .parse_any(&Value::String("hello {{ name }}".into()), &vars)
            .unwrap();
        assert_eq!(out, Value::String("hello world".into()));
    }

    #[test]
    fn parse_any_recurses_into_map_and_list() {
        let engine = HandlebarsEngine::new();
        let vars = json!({ "x": "1", "y": "2" });
        let input = json!({ "a": "{{ x }}", "b": ["{{ y }}", "literal"] });
        let out = engine.parse_any(&input, &vars).unwrap();
        assert_eq!(out["a"], json!("1"));
        assert_eq!(out["b"][0], json!("2"));
        assert_eq!(out["b"][1], json!("literal"));
    }

    #[test]
    fn parse_map_with_filter_skips_marked_keys() {
        let engine = HandlebarsEngine::new();
        let vars = json!({ "x": "rendered" });
        let mut map = Map::new();
        map.insert("outputs".to_string(), json!({ "y": "{{ x }}" }));
        map.insert("env".to_string(), json!({ "z": "{{ x }}" }));
        let out = engine
            .parse_map_with_filter(&map, &vars, &|k| k == "outputs")
            .unwrap();
        assert_eq!(out["outputs"]["y"], json!("{{ x }}"));
        assert_eq!(out["env"]["z"], json!("rendered"));
    }

    #[test]
    fn parse_with_json_handling_reparses_object_output() {
        let engine = HandlebarsEngine::new();
        let vars = json!({ "payload": "ignored" });
        let mut map = Map::new();
        map.insert("inner".to_string(), json!(42));
        let tpl = "{{ json_inline }}";
        // Simulate a template rendering to a JSON object literal.
        let rendered = serde_json::to_string(&Value::Object(map)).unwrap();
        let engine_vars = json!({ "json_inline": rendered });
        let out = engine
            .parse_with_json_handling(&Value::String(tpl.into()), &engine_vars)
            .unwrap();
        assert_eq!(out["inner"], json!(42));
    }

    #[test]
    fn references_tasks_detects_dotted_path() {
        assert!(references_tasks(&json!("{{ add tasks.a.output.n tasks.b.output.n }}")));
        assert!(!references_tasks(&json!("{{ add item index }}")));
    }

    #[test]
    fn eq_helper_drives_condition_rendering() {
        let engine = HandlebarsEngine::new();
        let vars = json!({ "signal": { "kind": "ready" } });
        let out = engine
            .render("{{#if (eq signal.kind \"ready\")}}true{{else}}false{{/if}}", &vars)
            .unwrap();
        assert_eq!(out, "true");
    }
}
