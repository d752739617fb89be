//! Template and expression resolution for workflow values.
//!
//! - A string that is exactly one `{{ expr }}` token, with no surrounding
//!   text, resolves to the native value of `expr` (object, array, number, ...).
//! - Any other mix of text and tokens renders to a string; each token is
//!   stringified (`null` -> empty, objects/arrays -> compact JSON).
//! - `{% for %}` and `{% if %}` blocks always render to a string.
//!
//! Expressions are a head (literal, variable path, or JEXL expression)
//! followed by a left-to-right `| filter(args)` pipeline.

pub mod blocks;
pub mod expression;
pub mod filters;
pub mod path;

use serde_json::{json, Map, Value};

use self::blocks::{Node, Segment};
use self::expression::{ExpressionError, WorkflowEvaluator};
use self::filters::{to_text, FilterRegistry};
use self::path::{lookup_segments, parse_path, PathSegment};

pub use self::path::resolve_variable_path;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("filter '{filter}' failed: {message}")]
    FilterFailed { filter: String, message: String },

    #[error("malformed expression '{expr}': {message}")]
    Malformed { expr: String, message: String },

    #[error("unterminated template tag near '{0}'")]
    Unterminated(String),

    #[error("template block error: {0}")]
    Block(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

fn malformed(expr: &str, message: impl Into<String>) -> TemplateError {
    TemplateError::Malformed {
        expr: expr.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Named values visible to templates.
pub trait ScopeSource {
    /// Value bound to a root name, if any.
    fn lookup(&self, name: &str) -> Option<Value>;

    /// Every visible name flattened into one JSON object, for JEXL.
    fn snapshot(&self) -> Value;
}

impl ScopeSource for Value {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }

    fn snapshot(&self) -> Value {
        match self {
            Value::Object(_) => self.clone(),
            _ => json!({}),
        }
    }
}

/// Local names layered over a parent scope. Loop variables, reducer
/// accumulators and block bindings live here so they never leak into the
/// parent.
pub struct Bindings<'a> {
    parent: &'a dyn ScopeSource,
    locals: Map<String, Value>,
}

impl<'a> Bindings<'a> {
    pub fn new(parent: &'a dyn ScopeSource) -> Self {
        Self {
            parent,
            locals: Map::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn locals(&self) -> &Map<String, Value> {
        &self.locals
    }
}

impl ScopeSource for Bindings<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.locals
            .get(name)
            .cloned()
            .or_else(|| self.parent.lookup(name))
    }

    fn snapshot(&self) -> Value {
        let mut base = self.parent.snapshot();
        if let Value::Object(map) = &mut base {
            for (k, v) in &self.locals {
                map.insert(k.clone(), v.clone());
            }
        }
        base
    }
}

// ---------------------------------------------------------------------------
// Truthiness
// ---------------------------------------------------------------------------

/// `null`, `false`, `0`, `""`, `"false"`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// TemplateResolver
// ---------------------------------------------------------------------------

/// Resolves templates against a scope using a filter registry.
#[derive(Debug, Clone, Default)]
pub struct TemplateResolver {
    filters: FilterRegistry,
}

impl TemplateResolver {
    /// A resolver with every built-in filter.
    pub fn new() -> Self {
        Self {
            filters: FilterRegistry::with_builtins(),
        }
    }

    pub fn with_filters(filters: FilterRegistry) -> Self {
        Self { filters }
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Add or replace a filter.
    pub fn register_filter<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.filters.register(name, filter);
    }

    /// Resolve a template string.
    ///
    /// Only a string that is one token with nothing around it, not even
    /// whitespace, keeps the native type; `" {{ items }}"` renders as text.
    pub fn resolve(&self, template: &str, scope: &dyn ScopeSource) -> Result<Value, TemplateError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(Value::String(template.to_string()));
        }

        let segments = blocks::tokenize(template)?;
        if let [Segment::Expr(expr)] = segments.as_slice() {
            return self.evaluate(expr, scope);
        }

        let nodes = blocks::parse_nodes(&segments)?;
        let mut out = String::new();
        self.render_nodes(&nodes, scope, &mut out)?;
        Ok(Value::String(out))
    }

    /// Resolve a value: strings are resolved, everything else is cloned.
    pub fn resolve_value(&self, value: &Value, scope: &dyn ScopeSource) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve(s, scope),
            other => Ok(other.clone()),
        }
    }

    /// Resolve every string leaf inside arrays and objects.
    pub fn resolve_deep(&self, value: &Value, scope: &dyn ScopeSource) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_deep(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k.clone(), self.resolve_deep(v, scope)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Render a template to a string regardless of its shape.
    pub fn render(&self, template: &str, scope: &dyn ScopeSource) -> Result<String, TemplateError> {
        Ok(match self.resolve(template, scope)? {
            Value::String(s) => s,
            other => to_text(&other),
        })
    }

    /// Resolve a condition. A bare string without `{{` is treated as an
    /// expression, so `count > 3` and `{{ count > 3 }}` are equivalent.
    pub fn evaluate_condition(&self, condition: &Value, scope: &dyn ScopeSource) -> Result<bool, TemplateError> {
        let value = match condition {
            Value::String(s) if !s.contains("{{") && !s.contains("{%") => self.evaluate(s, scope)?,
            other => self.resolve_deep(other, scope)?,
        };
        Ok(is_truthy(&value))
    }

    /// Evaluate an expression, wrapping bare strings as if in `{{ }}`.
    pub fn evaluate_expression(&self, expression: &Value, scope: &dyn ScopeSource) -> Result<Value, TemplateError> {
        match expression {
            Value::String(s) if !s.contains("{{") && !s.contains("{%") => self.evaluate(s, scope),
            other => self.resolve_deep(other, scope),
        }
    }

    /// Apply a list of filter calls (e.g. `["trim", "truncate(5)"]`) to a value.
    pub fn apply_filters(
        &self,
        value: Value,
        calls: &[String],
        scope: &dyn ScopeSource,
    ) -> Result<Value, TemplateError> {
        let mut value = value;
        for (i, call) in calls.iter().enumerate() {
            value = self.apply_filter_call(value, call, i + 1 == calls.len(), scope)?;
        }
        Ok(value)
    }

    /// Evaluate one expression with its filter pipeline.
    pub fn evaluate(&self, expr: &str, scope: &dyn ScopeSource) -> Result<Value, TemplateError> {
        let parts = split_pipeline(expr)?;
        let Some((head, calls)) = parts.split_first() else {
            return Err(malformed(expr, "empty expression"));
        };

        let mut value = self.evaluate_head(head, scope)?;
        for (i, call) in calls.iter().enumerate() {
            value = self.apply_filter_call(value, call, i + 1 == calls.len(), scope)?;
        }
        Ok(value)
    }

    fn apply_filter_call(
        &self,
        value: Value,
        call: &str,
        is_last: bool,
        scope: &dyn ScopeSource,
    ) -> Result<Value, TemplateError> {
        let (name, args_src, tail) = parse_filter_call(call)?;
        if tail.is_some() && !is_last {
            return Err(malformed(call, "only the last filter may be followed by an operator"));
        }

        let filter = self
            .filters
            .get(name)
            .ok_or_else(|| TemplateError::UnknownFilter(name.to_string()))?;

        let args = args_src
            .iter()
            .map(|arg| self.evaluate(arg, scope))
            .collect::<Result<Vec<_>, _>>()?;

        let filtered = filter(&value, &args).map_err(|message| TemplateError::FilterFailed {
            filter: name.to_string(),
            message,
        })?;

        match tail {
            // `items | length > 0`: the operator applies to the filtered value.
            Some(tail) => {
                let bound = Bindings::new(scope).with(PIPE_BINDING, filtered);
                let context = bound.snapshot();
                Ok(WorkflowEvaluator::new().evaluate_value(&format!("{PIPE_BINDING} {tail}"), &context)?)
            }
            None => Ok(filtered),
        }
    }

    fn evaluate_head(&self, head: &str, scope: &dyn ScopeSource) -> Result<Value, TemplateError> {
        let head = head.trim();
        if head.is_empty() {
            return Err(malformed(head, "empty expression"));
        }

        if let Some(literal) = parse_literal(head) {
            return Ok(literal);
        }

        if let Some(segments) = parse_path(head) {
            return Ok(lookup_in_scope(scope, &segments));
        }

        let context = scope.snapshot();
        Ok(WorkflowEvaluator::new().evaluate_value(head, &context)?)
    }

    fn render_nodes(&self, nodes: &[Node<'_>], scope: &dyn ScopeSource, out: &mut String) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Expr(e) => out.push_str(&to_text(&self.evaluate(e, scope)?)),
                Node::If { branches, otherwise } => {
                    let mut taken = false;
                    for (condition, body) in branches {
                        if is_truthy(&self.evaluate(condition, scope)?) {
                            self.render_nodes(body, scope, out)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.render_nodes(otherwise, scope, out)?;
                    }
                }
                Node::For { targets, iterable, body } => {
                    let items = self.evaluate(iterable, scope)?;
                    let rows: Vec<Vec<Value>> = match items {
                        Value::Null => Vec::new(),
                        Value::Array(items) => items.into_iter().map(|item| vec![item]).collect(),
                        Value::Object(map) if targets.len() == 2 => map
                            .into_iter()
                            .map(|(k, v)| vec![Value::String(k), v])
                            .collect(),
                        Value::Object(map) => map.into_iter().map(|(k, _)| vec![Value::String(k)]).collect(),
                        other => {
                            return Err(TemplateError::Block(format!(
                                "for loop over '{iterable}' expects an array or object, got {other}"
                            )));
                        }
                    };

                    let length = rows.len();
                    for (index, row) in rows.into_iter().enumerate() {
                        let mut frame = Bindings::new(scope).with(
                            "loop",
                            json!({
                                "index": index,
                                "index1": index + 1,
                                "first": index == 0,
                                "last": index + 1 == length,
                                "length": length,
                            }),
                        );
                        for (target, value) in targets.iter().zip(row) {
                            frame.set(*target, value);
                        }
                        self.render_nodes(body, &frame, out)?;
                    }
                }
            }
        }
        Ok(())
    }
}

const PIPE_BINDING: &str = "__pipe";

fn lookup_in_scope(scope: &dyn ScopeSource, segments: &[PathSegment]) -> Value {
    let Some((PathSegment::Key(root), rest)) = segments.split_first() else {
        return Value::Null;
    };
    match scope.lookup(root) {
        Some(root_value) => lookup_segments(&root_value, rest)
            .cloned()
            .unwrap_or(Value::Null),
        None => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Expression syntax helpers
// ---------------------------------------------------------------------------

/// Byte offsets of `target` at nesting depth 0 outside quotes.
fn top_level_positions(src: &str, target: u8) -> Result<Vec<usize>, TemplateError> {
    let bytes = src.as_bytes();
    let mut positions = Vec::new();
    let mut quote: Option<u8> = None;
    let mut depth: i32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth -= 1,
                _ if b == target && depth == 0 => positions.push(i),
                _ => {}
            },
        }
        i += 1;
    }

    if quote.is_some() {
        return Err(malformed(src, "unterminated string literal"));
    }
    Ok(positions)
}

fn split_at_positions<'s>(src: &'s str, positions: &[usize]) -> Vec<&'s str> {
    let mut parts = Vec::with_capacity(positions.len() + 1);
    let mut start = 0;
    for &p in positions {
        parts.push(src[start..p].trim());
        start = p + 1;
    }
    parts.push(src[start..].trim());
    parts
}

/// Split `a | f(x) | g` into `["a", "f(x)", "g"]`; `||` is left alone.
fn split_pipeline(expr: &str) -> Result<Vec<&str>, TemplateError> {
    let bytes = expr.as_bytes();
    let pipes: Vec<usize> = top_level_positions(expr, b'|')?
        .into_iter()
        .filter(|&p| bytes.get(p + 1) != Some(&b'|') && (p == 0 || bytes[p - 1] != b'|'))
        .collect();
    let parts = split_at_positions(expr, &pipes);
    if parts.iter().any(|p| p.is_empty()) {
        return Err(malformed(expr, "empty pipeline segment"));
    }
    Ok(parts)
}

/// Split `name(args) tail` into its pieces.
fn parse_filter_call(call: &str) -> Result<(&str, Vec<&str>, Option<&str>), TemplateError> {
    let call = call.trim();
    let name_end = call
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(call.len());
    let name = &call[..name_end];
    if name.is_empty() {
        return Err(malformed(call, "expected a filter name"));
    }

    let rest = call[name_end..].trim_start();
    let (args, tail) = if let Some(inner) = rest.strip_prefix('(') {
        let close = matching_paren(inner).ok_or_else(|| malformed(call, "unbalanced parentheses"))?;
        let arg_src = &inner[..close];
        let args = if arg_src.trim().is_empty() {
            Vec::new()
        } else {
            let commas = top_level_positions(arg_src, b',')?;
            split_at_positions(arg_src, &commas)
        };
        (args, inner[close + 1..].trim())
    } else {
        (Vec::new(), rest)
    };

    Ok((name, args, (!tail.is_empty()).then_some(tail)))
}

/// Offset of the `)` closing an already-consumed `(`.
fn matching_paren(src: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => depth += 1,
                b')' if depth == 0 => return Some(i),
                b')' => depth -= 1,
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Quoted strings, numbers, booleans and null.
fn parse_literal(src: &str) -> Option<Value> {
    match src {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" | "undefined" => return Some(Value::Null),
        _ => {}
    }

    let bytes = src.as_bytes();
    let first = *bytes.first()?;
    if first == b'"' || first == b'\'' {
        return parse_quoted(src, first);
    }

    let numeric = bytes
        .iter()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'));
    if numeric && (first.is_ascii_digit() || first == b'-') {
        if let Ok(i) = src.parse::<i64>() {
            return Some(json!(i));
        }
        if let Ok(f) = src.parse::<f64>() {
            return serde_json::Number::from_f64(f).map(Value::Number);
        }
    }
    None
}

fn parse_quoted(src: &str, quote: u8) -> Option<Value> {
    let inner = src.get(1..src.len().checked_sub(1)?)?;
    if src.len() < 2 || src.as_bytes()[src.len() - 1] != quote {
        return None;
    }

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            c if c as u32 == quote as u32 => return None,
            c => out.push(c),
        }
    }
    Some(Value::String(out))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Value {
        json!({
            "data": { "name": "mdflow", "tags": ["a", "b"] },
            "x": 1,
            "items": [1, 2, 3],
            "user": { "profile": { "name": "Ada" } },
            "empty": [],
            "text": "hello world"
        })
    }

    #[test]
    fn test_single_expression_preserves_type() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("{{ data }}", &s).unwrap(), s["data"]);
        assert_eq!(r.resolve("{{x}}", &s).unwrap(), json!(1));
        assert_eq!(r.resolve("{{ user.profile.name }}", &s).unwrap(), json!("Ada"));
        assert_eq!(r.resolve("{{ items[1] }}", &s).unwrap(), json!(2));
    }

    #[test]
    fn test_mixed_template_stringifies() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("a {{x}} b", &s).unwrap(), json!("a 1 b"));
        assert_eq!(r.resolve("{{ x }}{{ x }}", &s).unwrap(), json!("11"));
        assert_eq!(
            r.resolve("tags={{ data.tags }}", &s).unwrap(),
            json!("tags=[\"a\",\"b\"]")
        );
        assert_eq!(r.resolve("[{{ missing }}]", &s).unwrap(), json!("[]"));
    }

    #[test]
    fn test_padded_expression_renders_as_text() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("  {{ items }}  ", &s).unwrap(), json!("  [1,2,3]  "));
        assert_eq!(r.resolve("{{ x }}\n", &s).unwrap(), json!("1\n"));
        assert_eq!(r.resolve("{{ items }}", &s).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_plain_string_untouched() {
        let r = TemplateResolver::new();
        assert_eq!(r.resolve("no templates here", &scope()).unwrap(), json!("no templates here"));
    }

    #[test]
    fn test_unresolved_variable_is_null() {
        let r = TemplateResolver::new();
        assert_eq!(r.resolve("{{ nope }}", &scope()).unwrap(), Value::Null);
        assert_eq!(r.resolve("{{ data.nope.deeper }}", &scope()).unwrap(), Value::Null);
    }

    #[test]
    fn test_literals() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("{{ 'single' }}", &s).unwrap(), json!("single"));
        assert_eq!(r.resolve("{{ \"hi\" }}", &s).unwrap(), json!("hi"));
        assert_eq!(r.resolve("{{ 42 }}", &s).unwrap(), json!(42));
        assert_eq!(r.resolve("{{ -1.5 }}", &s).unwrap(), json!(-1.5));
        assert_eq!(r.resolve("{{ true }}", &s).unwrap(), json!(true));
        assert_eq!(r.resolve("{{ null }}", &s).unwrap(), Value::Null);
    }

    #[test]
    fn test_filter_pipeline() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("{{ text | upper }}", &s).unwrap(), json!("HELLO WORLD"));
        assert_eq!(
            r.resolve("{{ text | truncate(5) | upper }}", &s).unwrap(),
            json!("HELLO...")
        );
        assert_eq!(r.resolve("{{ items | join('-') }}", &s).unwrap(), json!("1-2-3"));
        assert_eq!(r.resolve("{{ missing | default('n/a') }}", &s).unwrap(), json!("n/a"));
        assert_eq!(r.resolve("{{ items | length }}", &s).unwrap(), json!(3));
        assert_eq!(
            r.resolve("{{ text | replace('world', data.name) }}", &s).unwrap(),
            json!("hello mdflow")
        );
    }

    #[test]
    fn test_filter_followed_by_operator() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("{{ items | length > 2 }}", &s).unwrap(), json!(true));
        assert_eq!(r.resolve("{{ empty | length > 0 }}", &s).unwrap(), json!(false));
    }

    #[test]
    fn test_unknown_filter_errors() {
        let r = TemplateResolver::new();
        let err = r.resolve("{{ x | frobnicate }}", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownFilter(name) if name == "frobnicate"));
    }

    #[test]
    fn test_boolean_or_is_not_a_pipe() {
        let r = TemplateResolver::new();
        let s = scope();
        assert_eq!(r.resolve("{{ x == 2 || x == 1 }}", &s).unwrap(), json!(true));
        assert_eq!(r.resolve("{{ x > 0 && items[0] == 1 }}", &s).unwrap(), json!(true));
    }

    #[test]
    fn test_arithmetic_expression() {
        let r = TemplateResolver::new();
        let s = json!({ "a": 10, "b": 20 });
        assert_eq!(r.resolve("{{ a + b }}", &s).unwrap(), json!(30));
    }

    #[test]
    fn test_resolve_deep() {
        let r = TemplateResolver::new();
        let s = scope();
        let input = json!({
            "channel": "#general",
            "text": "Hi {{ data.name }}",
            "payload": "{{ data }}",
            "list": ["{{ x }}", 5, true],
            "nested": { "count": "{{ items | length }}" }
        });
        let resolved = r.resolve_deep(&input, &s).unwrap();
        assert_eq!(resolved["channel"], json!("#general"));
        assert_eq!(resolved["text"], json!("Hi mdflow"));
        assert_eq!(resolved["payload"], s["data"]);
        assert_eq!(resolved["list"], json!([1, 5, true]));
        assert_eq!(resolved["nested"]["count"], json!(3));
    }

    #[test]
    fn test_for_block_with_loop_metadata() {
        let r = TemplateResolver::new();
        let out = r
            .resolve(
                "{% for i in items %}{{ loop.index }}:{{ i }}{% if loop.last %}.{% else %},{% endif %}{% endfor %}",
                &scope(),
            )
            .unwrap();
        assert_eq!(out, json!("0:1,1:2,2:3."));
    }

    #[test]
    fn test_for_block_over_object_pairs() {
        let r = TemplateResolver::new();
        let s = json!({ "env": { "a": 1, "b": 2 } });
        let out = r.resolve("{% for k, v in env %}{{ k }}={{ v }};{% endfor %}", &s).unwrap();
        assert_eq!(out, json!("a=1;b=2;"));
    }

    #[test]
    fn test_block_bindings_do_not_leak() {
        let r = TemplateResolver::new();
        let out = r
            .resolve("{% for x in items %}{% endfor %}{{ x }}", &scope())
            .unwrap();
        assert_eq!(out, json!("1"));
    }

    #[test]
    fn test_if_elif_else() {
        let r = TemplateResolver::new();
        let t = "{% if x > 5 %}big{% elif x == 1 %}one{% else %}other{% endif %}";
        assert_eq!(r.resolve(t, &scope()).unwrap(), json!("one"));
        assert_eq!(r.resolve(t, &json!({ "x": 9 })).unwrap(), json!("big"));
        assert_eq!(r.resolve(t, &json!({ "x": 3 })).unwrap(), json!("other"));
    }

    #[test]
    fn test_malformed_block_errors() {
        let r = TemplateResolver::new();
        assert!(r.resolve("{% if x %}never closed", &scope()).is_err());
        assert!(r.resolve("{{ x ", &scope()).is_err());
    }

    #[test]
    fn test_bindings_overlay() {
        let r = TemplateResolver::new();
        let base = scope();
        let frame = Bindings::new(&base).with("item", json!({ "id": 7 })).with("x", json!(99));
        assert_eq!(r.resolve("{{ item.id }}", &frame).unwrap(), json!(7));
        assert_eq!(r.resolve("{{ x }}", &frame).unwrap(), json!(99));
        assert_eq!(r.resolve("{{ x + item.id }}", &frame).unwrap(), json!(106));
        assert_eq!(r.resolve("{{ x }}", &base).unwrap(), json!(1));
    }

    #[test]
    fn test_conditions() {
        let r = TemplateResolver::new();
        let s = scope();
        assert!(r.evaluate_condition(&json!("{{ x == 1 }}"), &s).unwrap());
        assert!(r.evaluate_condition(&json!("x == 1"), &s).unwrap());
        assert!(!r.evaluate_condition(&json!("{{ empty }}"), &s).unwrap());
        assert!(!r.evaluate_condition(&json!(false), &s).unwrap());
        assert!(r.evaluate_condition(&json!(true), &s).unwrap());
    }

    #[test]
    fn test_truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!("false"), json!([]), json!({})] {
            assert!(!is_truthy(&falsy), "{falsy} should be falsy");
        }
        for truthy in [json!(true), json!(1), json!("0"), json!([0]), json!({ "a": null })] {
            assert!(is_truthy(&truthy), "{truthy} should be truthy");
        }
    }

    #[test]
    fn test_custom_filter() {
        let mut r = TemplateResolver::new();
        r.register_filter("shout", |v, _| Ok(json!(format!("{}!", to_text(v)))));
        assert_eq!(r.resolve("{{ data.name | shout }}", &scope()).unwrap(), json!("mdflow!"));
    }

    #[test]
    fn test_apply_filters_list() {
        let r = TemplateResolver::new();
        let out = r
            .apply_filters(json!("  Hello  "), &["trim".to_string(), "lower".to_string()], &scope())
            .unwrap();
        assert_eq!(out, json!("hello"));
    }
}
