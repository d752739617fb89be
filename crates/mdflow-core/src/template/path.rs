//! Dotted/bracket variable paths: `user.profile.name`, `items[0]`, `data["key"]`.

use serde_json::Value;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse a path into segments. Returns `None` for anything that is not a
/// plain path (operators, calls, literals), so callers can fall back to
/// full expression evaluation.
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    let mut expect_ident = true;

    while i < chars.len() {
        let c = chars[i];
        if c == '[' {
            let close = find_bracket_close(&chars, i)?;
            let inner: String = chars[i + 1..close].iter().collect();
            let inner = inner.trim();
            if let Some(key) = strip_quotes(inner) {
                segments.push(PathSegment::Key(key.to_string()));
            } else {
                segments.push(PathSegment::Index(inner.parse().ok()?));
            }
            i = close + 1;
            expect_ident = false;
        } else if c == '.' {
            if expect_ident {
                return None;
            }
            i += 1;
            expect_ident = true;
            if i >= chars.len() {
                return None;
            }
        } else if is_ident_start(c) || (c.is_ascii_digit() && !segments.is_empty()) {
            if !expect_ident {
                return None;
            }
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            match ident.parse::<usize>() {
                Ok(index) => segments.push(PathSegment::Index(index)),
                Err(_) => segments.push(PathSegment::Key(ident)),
            }
            expect_ident = false;
        } else {
            return None;
        }
    }

    match segments.first() {
        Some(PathSegment::Key(_)) => Some(segments),
        _ => None,
    }
}

/// Walk `segments` into `value`.
pub fn lookup_segments<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a bare path string against a value, without template syntax.
///
/// Missing segments and malformed paths resolve to `Value::Null`.
pub fn resolve_variable_path(path: &str, value: &Value) -> Value {
    match parse_path(path) {
        Some(segments) => lookup_segments(value, &segments)
            .cloned()
            .unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn find_bracket_close(chars: &[char], open: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[open + 1..].iter().enumerate() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ']' => return Some(open + 1 + offset),
            None => {}
        }
    }
    None
}

fn strip_quotes(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' || first == b'\'') && first == last {
            return Some(&s[1..s.len() - 1]);
        }
    }
    None
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
