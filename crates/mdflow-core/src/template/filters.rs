//! Template filters: `{{ value | name(arg, ...) }}`.
//!
//! A filter receives the piped value and its already-evaluated arguments and
//! returns a new value, or an error message. The registry is open: callers
//! can add filters with [`FilterRegistry::register`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};

use super::expression::number_value;
use super::is_truthy;
use super::path::resolve_variable_path;

/// A filter implementation.
pub type FilterFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync>;

/// Named filters available to the template pipeline.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl FilterRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// A registry with every built-in filter registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        register_string_filters(&mut registry);
        register_regex_filters(&mut registry);
        register_collection_filters(&mut registry);
        register_date_filters(&mut registry);
        register_type_filters(&mut registry);
        register_json_filters(&mut registry);
        register_logic_filters(&mut registry);
        register_math_filters(&mut registry);
        registry
    }

    /// Add or replace a filter.
    pub fn register<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    pub fn get(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.filters.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// String form used when a filter expects text.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn arg_text(args: &[Value], index: usize, default: &str) -> String {
    args.get(index)
        .map(to_text)
        .unwrap_or_else(|| default.to_string())
}

fn require_array<'a>(value: &'a Value, filter: &str) -> Result<&'a Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("{filter} expects an array, got {}", type_name(value)))
}

fn require_object<'a>(value: &'a Value, filter: &str) -> Result<&'a Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{filter} expects an object, got {}", type_name(value)))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key names from either variadic string arguments or a single array argument.
fn key_args(args: &[Value]) -> Vec<String> {
    match args {
        [Value::Array(items)] => items.iter().map(to_text).collect(),
        _ => args.iter().map(to_text).collect(),
    }
}

/// Total order across JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))
}

// ---------------------------------------------------------------------------
// String
// ---------------------------------------------------------------------------

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn register_string_filters(r: &mut FilterRegistry) {
    r.register("upper", |v, _| Ok(json!(to_text(v).to_uppercase())));
    r.register("lower", |v, _| Ok(json!(to_text(v).to_lowercase())));
    r.register("capitalize", |v, _| Ok(json!(capitalize(&to_text(v)))));
    r.register("title", |v, _| {
        let titled: Vec<String> = to_text(v).split(' ').map(capitalize).collect();
        Ok(json!(titled.join(" ")))
    });
    r.register("trim", |v, _| Ok(json!(to_text(v).trim())));
    r.register("slug", |v, _| {
        let mut slug = String::new();
        for c in to_text(v).to_lowercase().chars() {
            if c.is_alphanumeric() {
                slug.push(c);
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        Ok(json!(slug.trim_matches('-')))
    });
    r.register("prefix", |v, args| {
        Ok(json!(format!("{}{}", arg_text(args, 0, ""), to_text(v))))
    });
    r.register("suffix", |v, args| {
        Ok(json!(format!("{}{}", to_text(v), arg_text(args, 0, ""))))
    });
    r.register("truncate", |v, args| {
        let text = to_text(v);
        let max = args
            .first()
            .and_then(to_number)
            .ok_or("truncate requires a length")? as usize;
        let ellipsis = arg_text(args, 1, "...");
        if text.chars().count() <= max {
            return Ok(json!(text));
        }
        let cut: String = text.chars().take(max).collect();
        Ok(json!(cut + &ellipsis))
    });
    r.register("replace", |v, args| {
        let from = args.first().map(to_text).ok_or("replace requires a search string")?;
        let to = arg_text(args, 1, "");
        Ok(json!(to_text(v).replace(&from, &to)))
    });
    r.register("split", |v, args| {
        let sep = arg_text(args, 0, ",");
        let text = to_text(v);
        if text.is_empty() {
            return Ok(json!([]));
        }
        let parts: Vec<&str> = text.split(sep.as_str()).collect();
        Ok(json!(parts))
    });
    r.register("default", |v, args| {
        let fallback = args.first().cloned().unwrap_or(Value::Null);
        let use_falsy = args.get(1).is_some_and(is_truthy);
        let missing = if use_falsy { !is_truthy(v) } else { v.is_null() };
        Ok(if missing { fallback } else { v.clone() })
    });
}

// ---------------------------------------------------------------------------
// Regex
// ---------------------------------------------------------------------------

fn register_regex_filters(r: &mut FilterRegistry) {
    r.register("match", |v, args| {
        let re = compile_regex(&arg_text(args, 0, ""))?;
        Ok(json!(re.is_match(&to_text(v))))
    });
    r.register("notMatch", |v, args| {
        let re = compile_regex(&arg_text(args, 0, ""))?;
        Ok(json!(!re.is_match(&to_text(v))))
    });
    r.register("regexReplace", |v, args| {
        let re = compile_regex(&arg_text(args, 0, ""))?;
        let replacement = arg_text(args, 1, "");
        Ok(json!(re.replace_all(&to_text(v), replacement.as_str()).into_owned()))
    });
}

// ---------------------------------------------------------------------------
// Arrays and objects
// ---------------------------------------------------------------------------

fn register_collection_filters(r: &mut FilterRegistry) {
    r.register("first", |v, _| {
        Ok(match v {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            Value::String(s) => s.chars().next().map(|c| json!(c.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        })
    });
    r.register("last", |v, _| {
        Ok(match v {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            Value::String(s) => s.chars().last().map(|c| json!(c.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        })
    });
    r.register("length", |v, _| {
        let len = match v {
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => 0,
        };
        Ok(json!(len))
    });
    r.register("join", |v, args| {
        let sep = arg_text(args, 0, ",");
        let items = require_array(v, "join")?;
        let parts: Vec<String> = items.iter().map(to_text).collect();
        Ok(json!(parts.join(&sep)))
    });
    r.register("reverse", |v, _| {
        Ok(match v {
            Value::Array(items) => Value::Array(items.iter().rev().cloned().collect()),
            Value::String(s) => json!(s.chars().rev().collect::<String>()),
            other => other.clone(),
        })
    });
    r.register("sort", |v, args| {
        let mut items = require_array(v, "sort")?.clone();
        match args.first().map(to_text) {
            Some(key) => items.sort_by(|a, b| {
                compare_values(&resolve_variable_path(&key, a), &resolve_variable_path(&key, b))
            }),
            None => items.sort_by(compare_values),
        }
        Ok(Value::Array(items))
    });
    r.register("unique", |v, _| {
        let mut seen: Vec<Value> = Vec::new();
        for item in require_array(v, "unique")? {
            if !seen.contains(item) {
                seen.push(item.clone());
            }
        }
        Ok(Value::Array(seen))
    });
    r.register("flatten", |v, _| {
        let mut flat = Vec::new();
        for item in require_array(v, "flatten")? {
            match item {
                Value::Array(inner) => flat.extend(inner.iter().cloned()),
                other => flat.push(other.clone()),
            }
        }
        Ok(Value::Array(flat))
    });
    r.register("keys", |v, _| {
        let keys: Vec<&String> = require_object(v, "keys")?.keys().collect();
        Ok(json!(keys))
    });
    r.register("values", |v, _| {
        Ok(Value::Array(require_object(v, "values")?.values().cloned().collect()))
    });
    r.register("pick", |v, args| {
        let map = require_object(v, "pick")?;
        let picked: Map<String, Value> = key_args(args)
            .into_iter()
            .filter_map(|k| map.get(&k).map(|val| (k, val.clone())))
            .collect();
        Ok(Value::Object(picked))
    });
    r.register("omit", |v, args| {
        let mut map = require_object(v, "omit")?.clone();
        for key in key_args(args) {
            map.remove(&key);
        }
        Ok(Value::Object(map))
    });
    r.register("merge", |v, args| {
        let mut base = match v {
            Value::Null => Map::new(),
            other => require_object(other, "merge")?.clone(),
        };
        for arg in args {
            if let Value::Object(extra) = arg {
                for (k, val) in extra {
                    base.insert(k.clone(), val.clone());
                }
            }
        }
        Ok(Value::Object(base))
    });
    r.register("path", |v, args| {
        let path = args.first().map(to_text).ok_or("path requires a path string")?;
        Ok(resolve_variable_path(&path, v))
    });
    r.register("pluck", |v, args| {
        let key = args.first().map(to_text).ok_or("pluck requires a key")?;
        let plucked = require_array(v, "pluck")?
            .iter()
            .map(|item| resolve_variable_path(&key, item))
            .collect();
        Ok(Value::Array(plucked))
    });
    r.register("count", |v, args| {
        let count = match (v, args.first()) {
            (Value::Array(items), Some(needle)) => items.iter().filter(|i| *i == needle).count(),
            (Value::Array(items), None) => items.len(),
            (Value::Object(map), _) => map.len(),
            (Value::String(s), Some(needle)) => s.matches(to_text(needle).as_str()).count(),
            (Value::String(s), None) => s.chars().count(),
            _ => 0,
        };
        Ok(json!(count))
    });
    r.register("sum", |v, args| {
        let key = args.first().map(to_text);
        let total: f64 = require_array(v, "sum")?
            .iter()
            .filter_map(|item| match &key {
                Some(k) => to_number(&resolve_variable_path(k, item)),
                None => to_number(item),
            })
            .sum();
        Ok(number_value(total))
    });
    r.register("groupBy", |v, args| {
        let key = args.first().map(to_text).ok_or("groupBy requires a key")?;
        let mut groups = Map::new();
        for item in require_array(v, "groupBy")? {
            let group = to_text(&resolve_variable_path(&key, item));
            if let Value::Array(bucket) = groups.entry(group).or_insert_with(|| json!([])) {
                bucket.push(item.clone());
            }
        }
        Ok(Value::Object(groups))
    });
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parsed date plus whether the input carried a time component.
fn parse_date(value: &Value) -> Result<(DateTime<Utc>, bool), String> {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("now") => Ok((Utc::now(), true)),
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok((dt.with_timezone(&Utc), true));
            }
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| format!("unrecognized date '{s}'"))?;
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| format!("unrecognized date '{s}'"))?;
            Ok((Utc.from_utc_datetime(&midnight), false))
        }
        Value::Number(n) => {
            let secs = n.as_i64().ok_or("date timestamps must be integral seconds")?;
            let dt = Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("timestamp {secs} out of range"))?;
            Ok((dt, true))
        }
        Value::Null => Ok((Utc::now(), true)),
        other => Err(format!("cannot interpret {} as a date", type_name(other))),
    }
}

fn format_date(dt: DateTime<Utc>, with_time: bool) -> Value {
    if with_time {
        json!(dt.to_rfc3339())
    } else {
        json!(dt.format("%Y-%m-%d").to_string())
    }
}

fn shift_days(value: &Value, args: &[Value], sign: i64) -> Result<Value, String> {
    let (dt, with_time) = parse_date(value)?;
    let days = args.first().and_then(to_number).unwrap_or(0.0) as i64;
    let shifted = days
        .checked_mul(sign)
        .and_then(Duration::try_days)
        .and_then(|delta| dt.checked_add_signed(delta))
        .ok_or("date shift out of range")?;
    Ok(format_date(shifted, with_time))
}

fn register_date_filters(r: &mut FilterRegistry) {
    r.register("date", |v, args| {
        let (dt, _) = parse_date(v)?;
        let fmt = arg_text(args, 0, "%Y-%m-%d");
        let mut out = String::new();
        write!(out, "{}", dt.format(&fmt)).map_err(|_| format!("invalid date format '{fmt}'"))?;
        Ok(json!(out))
    });
    r.register("addDays", |v, args| shift_days(v, args, 1));
    r.register("subtractDays", |v, args| shift_days(v, args, -1));
}

// ---------------------------------------------------------------------------
// Type checks
// ---------------------------------------------------------------------------

fn register_type_filters(r: &mut FilterRegistry) {
    r.register("is_array", |v, _| Ok(json!(v.is_array())));
    r.register("is_object", |v, _| Ok(json!(v.is_object())));
    r.register("is_string", |v, _| Ok(json!(v.is_string())));
    r.register("is_number", |v, _| Ok(json!(v.is_number())));
    r.register("is_null", |v, _| Ok(json!(v.is_null())));
    r.register("is_empty", |v, _| {
        let empty = match v {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        Ok(json!(empty))
    });
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn register_json_filters(r: &mut FilterRegistry) {
    let to_json = |v: &Value, args: &[Value]| {
        let pretty = args.first().is_some_and(is_truthy);
        let text = if pretty {
            serde_json::to_string_pretty(v)
        } else {
            serde_json::to_string(v)
        };
        text.map(Value::String).map_err(|e| e.to_string())
    };
    r.register("toJson", to_json);
    r.register("json", to_json);

    let parse_json = |v: &Value, _: &[Value]| match v {
        Value::String(s) => serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}")),
        other => Ok(other.clone()),
    };
    r.register("parseJson", parse_json);
    r.register("fromJson", parse_json);
}

// ---------------------------------------------------------------------------
// Logic
// ---------------------------------------------------------------------------

fn register_logic_filters(r: &mut FilterRegistry) {
    r.register("ternary", |v, args| {
        let chosen = if is_truthy(v) { args.first() } else { args.get(1) };
        Ok(chosen.cloned().unwrap_or(Value::Null))
    });
    r.register("and", |v, args| {
        Ok(json!(is_truthy(v) && args.iter().all(is_truthy)))
    });
    r.register("or", |v, args| {
        Ok(json!(is_truthy(v) || args.iter().any(is_truthy)))
    });
    r.register("not", |v, _| Ok(json!(!is_truthy(v))));
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

fn numeric(value: &Value, filter: &str) -> Result<f64, String> {
    to_number(value).ok_or_else(|| format!("{filter} expects a number, got {}", type_name(value)))
}

fn extreme(v: &Value, args: &[Value], filter: &str, pick: fn(f64, f64) -> f64) -> Result<Value, String> {
    let candidates: Vec<f64> = match v {
        Value::Array(items) => items.iter().filter_map(to_number).collect(),
        other => std::iter::once(numeric(other, filter)?)
            .chain(args.iter().filter_map(to_number))
            .collect(),
    };
    Ok(candidates
        .into_iter()
        .reduce(pick)
        .map(number_value)
        .unwrap_or(Value::Null))
}

fn register_math_filters(r: &mut FilterRegistry) {
    r.register("round", |v, args| {
        let n = numeric(v, "round")?;
        let digits = args.first().and_then(to_number).unwrap_or(0.0) as i32;
        let factor = 10f64.powi(digits);
        Ok(number_value((n * factor).round() / factor))
    });
    r.register("floor", |v, _| Ok(number_value(numeric(v, "floor")?.floor())));
    r.register("ceil", |v, _| Ok(number_value(numeric(v, "ceil")?.ceil())));
    r.register("abs", |v, _| Ok(number_value(numeric(v, "abs")?.abs())));
    r.register("min", |v, args| extreme(v, args, "min", f64::min));
    r.register("max", |v, args| extreme(v, args, "max", f64::max));
}
