//! Built-in `core.*` actions handled by the engine without an executor call.

use serde_json::{Map, Value};

use crate::template::filters::to_text;
use crate::template::{resolve_variable_path, Bindings, TemplateResolver};

use super::context::ExecutionContext;
use super::step_runner::StepError;

pub const CORE_PREFIX: &str = "core.";

/// Reserved binding used to run a filter pipeline over an arbitrary value.
const PIPELINE_VALUE: &str = "__value";

pub fn is_builtin(action: &str) -> bool {
    action.starts_with(CORE_PREFIX)
}

/// Run a built-in action. `inputs` are raw; each built-in resolves what it
/// needs so `core.format` can keep its template intact.
pub(crate) fn run(
    action: &str,
    step_id: &str,
    inputs: &Map<String, Value>,
    ctx: &mut ExecutionContext,
    resolver: &TemplateResolver,
) -> Result<Value, StepError> {
    let fail = |message: String| StepError::Builtin {
        action: action.to_string(),
        message,
    };

    match action {
        "core.set" => {
            let resolved = resolve_inputs(step_id, inputs, ctx, resolver)?;
            for (k, v) in &resolved {
                ctx.set_variable(k.clone(), v.clone());
            }
            Ok(Value::Object(resolved))
        }
        "core.transform" => {
            let resolved = resolve_inputs(step_id, inputs, ctx, resolver)?;
            let value = resolved.get("value").cloned().unwrap_or(Value::Null);
            match resolved.get("filters") {
                None | Some(Value::Null) => Ok(value),
                Some(Value::String(pipeline)) => {
                    let scope = Bindings::new(&*ctx).with(PIPELINE_VALUE, value);
                    resolver
                        .evaluate(&format!("{PIPELINE_VALUE} | {pipeline}"), &scope)
                        .map_err(|e| fail(e.to_string()))
                }
                Some(Value::Array(calls)) => {
                    let calls: Vec<String> = calls.iter().map(to_text).collect();
                    resolver
                        .apply_filters(value, &calls, &*ctx)
                        .map_err(|e| fail(e.to_string()))
                }
                Some(_) => Err(fail("'filters' must be a string or an array".to_string())),
            }
        }
        "core.extract" => {
            let resolved = resolve_inputs(step_id, inputs, ctx, resolver)?;
            let from = resolved.get("from").cloned().unwrap_or(Value::Null);
            if let Some(paths) = resolved.get("paths") {
                let Value::Object(paths) = paths else {
                    return Err(fail("'paths' must be an object".to_string()));
                };
                let extracted: Map<String, Value> = paths
                    .iter()
                    .map(|(name, path)| (name.clone(), resolve_variable_path(&to_text(path), &from)))
                    .collect();
                return Ok(Value::Object(extracted));
            }
            match resolved.get("path") {
                Some(path) => Ok(resolve_variable_path(&to_text(path), &from)),
                None => Err(fail("requires 'path' or 'paths'".to_string())),
            }
        }
        "core.format" => {
            let template = match inputs.get("template") {
                Some(Value::String(t)) => t.clone(),
                Some(_) => return Err(fail("'template' must be a string".to_string())),
                None => return Err(fail("requires 'template'".to_string())),
            };
            let data = match inputs.get("data") {
                Some(raw) => resolver
                    .resolve_deep(raw, &*ctx)
                    .map_err(|source| StepError::Template {
                        step_id: step_id.to_string(),
                        source,
                    })?,
                None => Value::Null,
            };

            let mut scope = Bindings::new(&*ctx);
            if let Value::Object(map) = &data {
                for (k, v) in map {
                    scope.set(k.clone(), v.clone());
                }
            }
            scope.set("data", data);
            resolver
                .render(&template, &scope)
                .map(Value::String)
                .map_err(|e| fail(e.to_string()))
        }
        _ => Err(StepError::ActionExecution {
            step_id: step_id.to_string(),
            action: action.to_string(),
            message: "unknown built-in action".to_string(),
        }),
    }
}

fn resolve_inputs(
    step_id: &str,
    inputs: &Map<String, Value>,
    ctx: &ExecutionContext,
    resolver: &TemplateResolver,
) -> Result<Map<String, Value>, StepError> {
    let mut resolved = Map::with_capacity(inputs.len());
    for (k, v) in inputs {
        let value = resolver.resolve_deep(v, ctx).map_err(|source| StepError::Template {
            step_id: step_id.to_string(),
            source,
        })?;
        resolved.insert(k.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("builtins", Uuid::now_v7(), Map::new());
        ctx.set_variable("name", json!("  Ada Lovelace  "));
        ctx.set_variable(
            "payload",
            json!({ "user": { "id": 7, "tags": ["a", "b"] }, "ok": true }),
        );
        ctx
    }

    fn inputs(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("inputs must be an object"),
        }
    }

    #[test]
    fn test_core_set_writes_variables() {
        let mut ctx = ctx();
        let resolver = TemplateResolver::new();
        let out = run(
            "core.set",
            "s",
            &inputs(json!({ "greeting": "hi {{ name | trim }}", "n": 3 })),
            &mut ctx,
            &resolver,
        )
        .unwrap();
        assert_eq!(out["greeting"], json!("hi Ada Lovelace"));
        assert_eq!(ctx.get_variable("n"), Some(&json!(3)));
    }

    #[test]
    fn test_core_transform_array_and_string_pipelines() {
        let mut ctx = ctx();
        let resolver = TemplateResolver::new();
        let out = run(
            "core.transform",
            "t",
            &inputs(json!({ "value": "{{ name }}", "filters": ["trim", "upper", "truncate(3, '')"] })),
            &mut ctx,
            &resolver,
        )
        .unwrap();
        assert_eq!(out, json!("ADA"));

        let out = run(
            "core.transform",
            "t",
            &inputs(json!({ "value": [3, 1, 2], "filters": "sort | first" })),
            &mut ctx,
            &resolver,
        )
        .unwrap();
        assert_eq!(out, json!(1));
    }

    #[test]
    fn test_core_extract_single_and_many() {
        let mut ctx = ctx();
        let resolver = TemplateResolver::new();
        let out = run(
            "core.extract",
            "e",
            &inputs(json!({ "from": "{{ payload }}", "path": "user.tags[1]" })),
            &mut ctx,
            &resolver,
        )
        .unwrap();
        assert_eq!(out, json!("b"));

        let out = run(
            "core.extract",
            "e",
            &inputs(json!({ "from": "{{ payload }}", "paths": { "id": "user.id", "missing": "nope" } })),
            &mut ctx,
            &resolver,
        )
        .unwrap();
        assert_eq!(out, json!({ "id": 7, "missing": null }));
    }

    #[test]
    fn test_core_format_uses_data_bindings() {
        let mut ctx = ctx();
        let resolver = TemplateResolver::new();
        let out = run(
            "core.format",
            "f",
            &inputs(json!({
                "template": "{% for t in tags %}#{{ t }}{% if loop.last %}{% else %} {% endif %}{% endfor %} by {{ who }}",
                "data": { "tags": "{{ payload.user.tags }}", "who": "{{ name | trim }}" }
            })),
            &mut ctx,
            &resolver,
        )
        .unwrap();
        assert_eq!(out, json!("#a #b by Ada Lovelace"));
    }

    #[test]
    fn test_unknown_builtin() {
        let mut ctx = ctx();
        let err = run("core.nope", "x", &Map::new(), &mut ctx, &TemplateResolver::new()).unwrap_err();
        assert!(matches!(err, StepError::ActionExecution { .. }));
    }
}
