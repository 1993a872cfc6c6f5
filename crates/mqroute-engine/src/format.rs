//! Field formatter: `{key}` substitution over transform data.
//!
//! Supported replacement field grammar:
//! ```text
//! "{" name ( "." key | "[" key "]" )* [ "!" ("s" | "j") ] [ ":" spec ] "}"
//! spec := [[fill]align][0][width][.precision][type]    align: < > ^ =   type: s d f x
//! ```
//! `{{` and `}}` are literal braces. `!j` serializes the value as JSON first,
//! so `{payload!j}` embeds JSON-escaped text. The JSON layout is the one
//! Python's `json.dumps` produces: `", "` and `": "` separators and non-ASCII
//! escaped as `\uXXXX`.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use thiserror::Error;

use mqroute_core::types::TransformData;

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("single '{0}' encountered in format string")]
    UnbalancedBrace(char),
    #[error("empty replacement field")]
    EmptyField,
    #[error("missing key '{0}'")]
    MissingKey(String),
    #[error("unknown conversion '!{0}'")]
    BadConversion(String),
    #[error("invalid format spec '{spec}' for value {value}")]
    BadSpec { spec: String, value: String },
}

/// Substitute every replacement field of `template` from `data`.
pub fn format(template: &str, data: &TransformData) -> Result<String, FormatError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    field.push(c);
                }
                if !closed {
                    return Err(FormatError::UnbalancedBrace('{'));
                }
                out.push_str(&render_field(&field, data)?);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(FormatError::UnbalancedBrace('}')),
            c => out.push(c),
        }
    }

    Ok(out)
}

fn render_field(field: &str, data: &TransformData) -> Result<String, FormatError> {
    let (head, spec) = match field.split_once(':') {
        Some((head, spec)) => (head, Some(spec)),
        None => (field, None),
    };
    let (name, conversion) = match head.split_once('!') {
        Some((name, conv)) => (name, Some(conv)),
        None => (head, None),
    };
    if name.is_empty() {
        return Err(FormatError::EmptyField);
    }

    let value = lookup(name, data)?;
    let value = match conversion {
        None => value.clone(),
        Some("s") => Value::String(value_text(value)),
        Some("j") => Value::String(json_dumps(value)),
        Some(other) => return Err(FormatError::BadConversion(other.to_string())),
    };

    match spec {
        None | Some("") => Ok(value_text(&value)),
        Some(spec) => apply_spec(&value, spec),
    }
}

/// Resolve `a.b[c][0]` against the data map.
fn lookup<'a>(name: &str, data: &'a TransformData) -> Result<&'a Value, FormatError> {
    let missing = || FormatError::MissingKey(name.to_string());
    let first_end = name.find(['.', '[']).unwrap_or(name.len());
    let mut current = data.get(&name[..first_end]).ok_or_else(missing)?;

    let mut rest = &name[first_end..];
    while !rest.is_empty() {
        let (key, remainder) = if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(missing)?;
            (&after[..close], &after[close + 1..])
        } else if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            (&after[..end], &after[end..])
        } else {
            return Err(missing());
        };

        current = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(missing)?;
        rest = remainder;
    }

    Ok(current)
}

/// Spaced separators, ASCII-only output.
struct DumpsFormatter;

impl Formatter for DumpsFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Serialize `value` the way `json.dumps` does with default arguments.
pub fn json_dumps(value: &Value) -> String {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, DumpsFormatter);
    if value.serialize(&mut serializer).is_err() {
        return value.to_string();
    }
    // Only ASCII is ever written.
    String::from_utf8_lossy(&out).into_owned()
}

/// Plain-text rendering of a value: strings verbatim, everything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Spec {
    fill: char,
    align: Option<char>,
    width: usize,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Option<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut fill = ' ';
    let mut align = None;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        fill = chars[0];
        align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        align = Some(chars[0]);
        i = 1;
    }

    if chars.get(i) == Some(&'0') {
        if align.is_none() {
            fill = '0';
            align = Some('=');
        }
        i += 1;
    }

    let start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    let width = if i > start {
        chars[start..i].iter().collect::<String>().parse().ok()?
    } else {
        0
    };

    let mut precision = None;
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            return None;
        }
        precision = Some(chars[start..i].iter().collect::<String>().parse().ok()?);
    }

    let kind = match chars.get(i) {
        Some(c @ ('s' | 'd' | 'f' | 'x')) => {
            i += 1;
            Some(*c)
        }
        _ => None,
    };

    if i != chars.len() {
        return None;
    }
    Some(Spec { fill, align, width, precision, kind })
}

fn apply_spec(value: &Value, raw: &str) -> Result<String, FormatError> {
    let bad = || FormatError::BadSpec {
        spec: raw.to_string(),
        value: value.to_string(),
    };
    let spec = parse_spec(raw).ok_or_else(bad)?;

    let (body, numeric) = match (value, spec.kind) {
        (Value::String(s), None | Some('s')) => {
            let text = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            };
            (text, false)
        }
        (Value::Number(n), Some('d')) => (n.as_i64().ok_or_else(bad)?.to_string(), true),
        (Value::Number(n), Some('x')) => (format!("{:x}", n.as_i64().ok_or_else(bad)?), true),
        (Value::Number(n), Some('f')) => {
            let f = n.as_f64().ok_or_else(bad)?;
            (format!("{:.*}", spec.precision.unwrap_or(6), f), true)
        }
        (Value::Number(n), None) => match spec.precision {
            Some(p) => (format!("{:.*}", p, n.as_f64().ok_or_else(bad)?), true),
            None => (n.to_string(), true),
        },
        (other, None) if spec.precision.is_none() => (other.to_string(), false),
        _ => return Err(bad()),
    };

    Ok(pad(&body, &spec, numeric))
}

fn pad(body: &str, spec: &Spec, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body.to_string();
    }
    let gap = spec.width - len;
    let fill = |n: usize| std::iter::repeat_n(spec.fill, n).collect::<String>();
    let align = spec.align.unwrap_or(if numeric { '>' } else { '<' });

    match align {
        '<' => format!("{body}{}", fill(gap)),
        '^' => format!("{}{body}{}", fill(gap / 2), fill(gap - gap / 2)),
        '=' => match body.strip_prefix('-') {
            Some(digits) => format!("-{}{digits}", fill(gap)),
            None => format!("{}{body}", fill(gap)),
        },
        _ => format!("{}{body}", fill(gap)),
    }
}

/// Shorten `s` for log lines: trimmed, at most `limit` characters plus `...`.
pub fn truncate(s: &str, limit: usize) -> String {
    let s = s.trim();
    if s.chars().count() > limit {
        let head: String = s.chars().take(limit).collect();
        format!("{}...", head.trim())
    } else {
        s.to_string()
    }
}
