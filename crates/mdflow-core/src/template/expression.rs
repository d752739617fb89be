//! JEXL evaluator for template expressions that are not plain paths or
//! literals: comparisons, boolean operators, arithmetic.
//!
//! Scope values are always passed as a context object, never interpolated
//! into the expression string.

use serde_json::{json, Value};

use super::is_truthy;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with a few transforms pre-registered.
///
/// The template filter pipeline handles `|` before JEXL ever sees the
/// expression, so these transforms are only reachable from expressions
/// that call them explicitly inside parentheses.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// JEXL produces every number as a float; integral results are
    /// normalized back to integers so `{{ a + 1 }}` stays `2`, not `2.0`.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map(normalize_numbers)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression and coerce the result with template truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|v| is_truthy(&v))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn integral floats back into integers, recursively.
pub fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => number_value(f),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

/// JSON number for `f`, integral when possible.
pub fn number_value(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
        json!(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_and_boolean_operators() {
        let eval = WorkflowEvaluator::new();
        let ctx = json!({ "count": 5, "name": "mdflow", "flag": false });

        assert!(eval.evaluate_bool("count > 3", &ctx).unwrap());
        assert!(!eval.evaluate_bool("count > 10", &ctx).unwrap());
        assert!(eval.evaluate_bool("name == 'mdflow' && count < 6", &ctx).unwrap());
        assert!(eval.evaluate_bool("flag || count == 5", &ctx).unwrap());
    }

    #[test]
    fn test_arithmetic_normalizes_integers() {
        let eval = WorkflowEvaluator::new();
        let ctx = json!({ "a": 10, "b": 20 });
        assert_eq!(eval.evaluate_value("a + b", &ctx).unwrap(), json!(30));
        assert_eq!(eval.evaluate_value("a / 4", &ctx).unwrap(), json!(2.5));
    }

    #[test]
    fn test_non_object_context_rejected() {
        let eval = WorkflowEvaluator::new();
        let err = eval.evaluate_value("1 + 1", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn test_malformed_expression_errors() {
        let eval = WorkflowEvaluator::new();
        assert!(eval.evaluate_value("a + (b", &json!({})).is_err());
    }

    #[test]
    fn test_normalize_numbers_recursive() {
        let v = normalize_numbers(json!({ "x": [1.0, 2.5], "y": 3.0 }));
        assert_eq!(v, json!({ "x": [1, 2.5], "y": 3 }));
    }
}
