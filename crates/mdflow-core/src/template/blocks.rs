//! Template tokenizer and block parser.
//!
//! Splits a template into literal text, `{{ expression }}` tokens and
//! `{% tag %}` tokens, then folds the tags into a tree of `for` and `if`
//! blocks. Rendering lives in the resolver, which owns the filter table.

use super::TemplateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
    Tag(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node<'a> {
    Text(&'a str),
    Expr(&'a str),
    For {
        targets: Vec<&'a str>,
        iterable: &'a str,
        body: Vec<Node<'a>>,
    },
    If {
        branches: Vec<(&'a str, Vec<Node<'a>>)>,
        otherwise: Vec<Node<'a>>,
    },
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Split a template into segments. Closing delimiters inside quoted
/// strings do not end a token.
pub(crate) fn tokenize(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut pos = 0;

    while pos < template.len() {
        let rest = &template[pos..];
        let next = match (rest.find("{{"), rest.find("{%")) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(offset) = next else {
            segments.push(Segment::Text(rest));
            break;
        };

        if offset > 0 {
            segments.push(Segment::Text(&rest[..offset]));
        }

        let open = pos + offset;
        let is_tag = template[open..].starts_with("{%");
        let close_delim = if is_tag { "%}" } else { "}}" };
        let body_start = open + 2;
        let close = find_close(&template[body_start..], close_delim)
            .ok_or_else(|| TemplateError::Unterminated(snippet(&template[open..])))?;
        let inner = template[body_start..body_start + close].trim();

        if is_tag {
            segments.push(Segment::Tag(inner));
        } else {
            segments.push(Segment::Expr(inner));
        }
        pos = body_start + close + 2;
    }

    Ok(segments)
}

fn find_close(src: &str, delim: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let delim = delim.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if bytes[i..].starts_with(delim) => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn snippet(s: &str) -> String {
    s.chars().take(40).collect()
}

// ---------------------------------------------------------------------------
// Block parser
// ---------------------------------------------------------------------------

pub(crate) fn parse_nodes<'a>(segments: &[Segment<'a>]) -> Result<Vec<Node<'a>>, TemplateError> {
    let mut parser = Parser { segments, pos: 0 };
    let (nodes, stop) = parser.parse_until(&[])?;
    match stop {
        Some(tag) => Err(TemplateError::Block(format!("unexpected tag '{tag}'"))),
        None => Ok(nodes),
    }
}

struct Parser<'s, 'a> {
    segments: &'s [Segment<'a>],
    pos: usize,
}

fn keyword(tag: &str) -> &str {
    tag.split_whitespace().next().unwrap_or("")
}

fn tag_argument<'a>(tag: &'a str, kw: &str) -> &'a str {
    tag[kw.len()..].trim()
}

impl<'s, 'a> Parser<'s, 'a> {
    /// Parse nodes until a tag whose keyword is in `stops`; returns that tag.
    fn parse_until(&mut self, stops: &[&str]) -> Result<(Vec<Node<'a>>, Option<&'a str>), TemplateError> {
        let mut nodes = Vec::new();

        while self.pos < self.segments.len() {
            let segment = self.segments[self.pos].clone();
            self.pos += 1;
            match segment {
                Segment::Text(t) => nodes.push(Node::Text(t)),
                Segment::Expr(e) => nodes.push(Node::Expr(e)),
                Segment::Tag(tag) => {
                    let kw = keyword(tag);
                    if stops.contains(&kw) {
                        return Ok((nodes, Some(tag)));
                    }
                    match kw {
                        "for" => nodes.push(self.parse_for(tag)?),
                        "if" => nodes.push(self.parse_if(tag)?),
                        _ => return Err(TemplateError::Block(format!("unexpected tag '{tag}'"))),
                    }
                }
            }
        }

        Ok((nodes, None))
    }

    fn parse_for(&mut self, tag: &'a str) -> Result<Node<'a>, TemplateError> {
        let header = tag_argument(tag, "for");
        let (targets, iterable) = header
            .split_once(" in ")
            .ok_or_else(|| TemplateError::Block(format!("malformed for tag '{tag}'")))?;
        let targets: Vec<&str> = targets.split(',').map(str::trim).collect();
        if targets.is_empty() || targets.len() > 2 || targets.iter().any(|t| t.is_empty()) {
            return Err(TemplateError::Block(format!("malformed for tag '{tag}'")));
        }

        let (body, stop) = self.parse_until(&["endfor"])?;
        if stop.is_none() {
            return Err(TemplateError::Block(format!("'{tag}' is missing endfor")));
        }

        Ok(Node::For {
            targets,
            iterable: iterable.trim(),
            body,
        })
    }

    fn parse_if(&mut self, tag: &'a str) -> Result<Node<'a>, TemplateError> {
        let mut branches = Vec::new();
        let mut condition = tag_argument(tag, "if");
        let mut otherwise = Vec::new();

        loop {
            if condition.is_empty() {
                return Err(TemplateError::Block(format!("missing condition in '{tag}'")));
            }
            let (body, stop) = self.parse_until(&["elif", "else", "endif"])?;
            branches.push((condition, body));

            match stop.map(|s| (keyword(s), s)) {
                Some(("elif", s)) => condition = tag_argument(s, "elif"),
                Some(("else", _)) => {
                    let (body, stop) = self.parse_until(&["endif"])?;
                    if stop.is_none() {
                        return Err(TemplateError::Block(format!("'{tag}' is missing endif")));
                    }
                    otherwise = body;
                    break;
                }
                Some(_) => break,
                None => return Err(TemplateError::Block(format!("'{tag}' is missing endif"))),
            }
        }

        Ok(Node::If { branches, otherwise })
    }
}
