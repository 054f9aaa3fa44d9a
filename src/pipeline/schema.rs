//! Schema enforcement for parsed model data.
//!
//! Keeps only declared fields, coerces values to their declared kind and
//! records which fields survived (verified) and which were dropped. Past
//! this point the data map holds only schema-conformant values.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Number, Value};
use tracing::debug;

use super::agents::{AgentSpec, FieldKind};

/// Schema-conformant data plus the enforcement record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Enforced {
    pub data: Map<String, Value>,
    pub verified_fields: Vec<String>,
    pub dropped_fields: Vec<String>,
}

/// Enforce an agent's field schema on parsed data.
///
/// Unknown fields and values that cannot be coerced are dropped. Null or
/// blank values are omitted without being counted as dropped.
pub fn enforce(spec: &AgentSpec, data: Map<String, Value>) -> Enforced {
    let mut out = Enforced::default();

    for (name, value) in data {
        let Some(field) = spec.field(&name) else {
            debug!(agent_id = %spec.id, field = %name, "Dropping undeclared field");
            out.dropped_fields.push(name);
            continue;
        };
        if is_blank(&value) {
            continue;
        }
        match coerce(field.kind, &value) {
            Some(v) => {
                out.verified_fields.push(name.clone());
                out.data.insert(name, v);
            }
            None => {
                debug!(agent_id = %spec.id, field = %name, value = %value, "Dropping uncoercible value");
                out.dropped_fields.push(name);
            }
        }
    }

    out.verified_fields.sort();
    out.dropped_fields.sort();
    out
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let t = s.trim();
            t.is_empty() || t == "-" || t.eq_ignore_ascii_case("null") || t.eq_ignore_ascii_case("n/a")
        }
        _ => false,
    }
}

/// Coerce a value to a field kind.
pub fn coerce(kind: FieldKind, value: &Value) -> Option<Value> {
    match kind {
        FieldKind::Number => coerce_number(value).and_then(number_value),
        FieldKind::Text => coerce_text(value).map(Value::String),
        FieldKind::Date => match value {
            Value::String(s) => parse_date(s).map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
            _ => None,
        },
        FieldKind::List => coerce_list(value),
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_swedish_number(s),
        _ => None,
    }
}

/// Integral values stay integers in the JSON output.
fn number_value(n: f64) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Some(Value::Number(Number::from(n as i64)))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            (!collapsed.is_empty()).then_some(collapsed)
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_list(value: &Value) -> Option<Value> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items
            .iter()
            .filter(|v| !is_blank(v))
            .map(|v| match v {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other.clone(),
            })
            .collect(),
        Value::String(s) => vec![Value::String(s.trim().to_string())],
        Value::Number(_) | Value::Object(_) => vec![value.clone()],
        _ => return None,
    };
    (!items.is_empty()).then_some(Value::Array(items))
}

/// Parse amounts as written in Swedish reports.
///
/// Handles space or dot thousands separators, decimal comma, parentheses or
/// minus signs (ASCII, U+2212, en dash) for negatives and `kr`/`tkr`/`mkr`
/// units.
pub fn parse_swedish_number(s: &str) -> Option<f64> {
    let mut text = s.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = text[1..text.len() - 1].trim().to_string();
    }

    let mut multiplier = 1.0;
    for (suffix, factor) in [
        ("mkr", 1_000_000.0),
        ("msek", 1_000_000.0),
        ("tkr", 1_000.0),
        ("ksek", 1_000.0),
        ("sek", 1.0),
        ("kr", 1.0),
        (":-", 1.0),
        ("%", 1.0),
    ] {
        if let Some(stripped) = text.strip_suffix(suffix) {
            multiplier = factor;
            text = stripped.trim_end().trim_end_matches('.').trim_end().to_string();
            break;
        }
    }

    for sign in ['-', '\u{2212}', '\u{2013}'] {
        if let Some(stripped) = text.strip_prefix(sign) {
            negative = !negative;
            text = stripped.trim_start().to_string();
            break;
        }
    }

    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{00A0}' && *c != '\u{202F}' && *c != '\'')
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '.') {
        return None;
    }

    let normalized = normalize_separators(&digits)?;
    let value: f64 = normalized.parse().ok()?;
    let value = value * multiplier;
    Some(if negative { -value } else { value })
}

/// Reduce thousands/decimal separators to a plain `1234.5` form.
fn normalize_separators(digits: &str) -> Option<String> {
    let commas = digits.matches(',').count();
    let dots = digits.matches('.').count();
    match (commas, dots) {
        (0, 0) => Some(digits.to_string()),
        (0, 1) => Some(digits.to_string()),
        (1, 0) => Some(digits.replace(',', ".")),
        (0, _) => Some(digits.replace('.', "")),
        (_, 0) => Some(digits.replace(',', "")),
        _ => {
            let last_comma = digits.rfind(',')?;
            let last_dot = digits.rfind('.')?;
            if last_comma > last_dot {
                Some(digits.replace('.', "").replace(',', "."))
            } else {
                Some(digits.replace(',', ""))
            }
        }
    }
}

/// Parse a date in any common Swedish or ISO notation.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let text = s.trim();
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d.%m.%Y", "%d/%m/%Y", "%Y.%m.%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, format) {
            return Some(d);
        }
    }
    parse_written_date(text)
}

/// "31 december 2023" style dates with Swedish or English month names.
fn parse_written_date(text: &str) -> Option<NaiveDate> {
    static WRITTEN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^(\d{1,2})\s+([a-zåäö]+)\.?\s+(\d{4})$").expect("valid regex")
    });
    let caps = WRITTEN_RE.captures(text)?;
    let day: u32 = caps.get(1)?.as_str().parse().ok()?;
    let month = month_number(&caps.get(2)?.as_str().to_lowercase())?;
    let year: i32 = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [(&str, &str); 12] = [
        ("januari", "january"),
        ("februari", "february"),
        ("mars", "march"),
        ("april", "april"),
        ("maj", "may"),
        ("juni", "june"),
        ("juli", "july"),
        ("augusti", "august"),
        ("september", "september"),
        ("oktober", "october"),
        ("november", "november"),
        ("december", "december"),
    ];
    MONTHS
        .iter()
        .position(|(sv, en)| {
            *sv == name || *en == name || (name.len() >= 3 && (sv.starts_with(name) || en.starts_with(name)))
        })
        .map(|i| i as u32 + 1)
}
