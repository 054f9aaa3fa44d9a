//! Model response parsing.
//!
//! Turns raw model text into a field map plus claimed evidence pages.
//! Tolerates thinking preambles, code fences, prose around the JSON, page
//! references written as text ("sida 3", "page 4-5") and responses that put
//! fields at the top level instead of under `data`.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::error::ParseError;

/// Longest page range accepted from a single "3-7" style reference.
const MAX_RANGE_SPAN: u32 = 50;

/// Structured content of one model response, before schema enforcement.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub data: Map<String, Value>,
    /// Claimed evidence pages as the model wrote them, deduplicated, in order.
    pub evidence_pages: Vec<u32>,
}

/// Strip model-specific artifacts from raw output.
///
/// Handles `<think>...</think>` blocks, Gemma `<unusedN>thought` prefixes
/// and stray `<unusedN>` tokens.
pub fn sanitize_model_output(raw: &str) -> String {
    static THINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    static UNUSED_TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

    let mut text = THINK_RE.replace_all(raw, "").to_string();

    if let Some(idx) = text.find("<unused") {
        if let Some(thought_offset) = text[idx..].find("thought\n") {
            text = text[idx + thought_offset + 8..].to_string();
        }
    }

    text = UNUSED_TOKEN_RE.replace_all(&text, "").to_string();
    text.trim().to_string()
}

/// Extract a JSON object from response text.
/// Handles code fences and text before/after the JSON.
pub fn extract_json_block(response: &str) -> Result<&str, ParseError> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') {
                return Ok(block);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return Ok(&trimmed[start..=end]);
        }
    }

    Err(ParseError::NoJson)
}

/// Parse a raw model response into data and claimed evidence.
pub fn parse_response(raw: &str) -> Result<ParsedResponse, ParseError> {
    let cleaned = sanitize_model_output(raw);
    let block = extract_json_block(&cleaned)?;
    let value: Value = serde_json::from_str(block).map_err(|e| ParseError::Json(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ParseError::NotAnObject);
    };

    let evidence_value = ["evidence_pages", "evidence", "pages"]
        .iter()
        .find_map(|k| object.remove(*k))
        .unwrap_or(Value::Null);
    let evidence_pages = parse_evidence(evidence_value);

    let data = match object.remove("data") {
        Some(Value::Object(data)) => data,
        Some(Value::Null) | None => object,
        Some(_) => return Err(ParseError::NotAnObject),
    };

    Ok(ParsedResponse {
        data,
        evidence_pages,
    })
}

#[derive(Deserialize)]
struct EvidenceList(#[serde(deserialize_with = "deserialize_flexible_pages")] Vec<u32>);

fn parse_evidence(value: Value) -> Vec<u32> {
    if value.is_null() {
        return Vec::new();
    }
    let mut pages = serde_json::from_value::<EvidenceList>(value)
        .map(|l| l.0)
        .unwrap_or_default();
    let mut seen = std::collections::HashSet::new();
    pages.retain(|p| seen.insert(*p));
    pages
}

/// Accepts integers, numeric strings, "sida 3"/"page 3"/"s. 3" and ranges
/// like "4-5", either as an array or a single value.
fn deserialize_flexible_pages<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct FlexiblePages;

    impl<'de> de::Visitor<'de> for FlexiblePages {
        type Value = Vec<u32>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("page numbers as integers or strings like \"sida 3\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Vec<u32>, E> {
            Ok(u32::try_from(v).into_iter().filter(|p| *p > 0).collect())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Vec<u32>, E> {
            Ok(u32::try_from(v).into_iter().filter(|p| *p > 0).collect())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Vec<u32>, E> {
            if v.fract() == 0.0 && v >= 1.0 && v <= u32::MAX as f64 {
                Ok(vec![v as u32])
            } else {
                Ok(Vec::new())
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u32>, E> {
            Ok(pages_from_text(v))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<u32>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut result = Vec::new();
            while let Some(val) = seq.next_element::<Value>()? {
                match val {
                    Value::Number(n) => {
                        if let Some(p) = n
                            .as_u64()
                            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
                            .and_then(|p| u32::try_from(p).ok())
                            .filter(|p| *p > 0)
                        {
                            result.push(p);
                        }
                    }
                    Value::String(s) => result.extend(pages_from_text(&s)),
                    _ => {}
                }
            }
            Ok(result)
        }
    }

    deserializer.deserialize_any(FlexiblePages)
}

/// Page numbers mentioned in a textual reference.
fn pages_from_text(s: &str) -> Vec<u32> {
    static PAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)\s*(?:[-–]\s*(\d+))?").expect("valid regex"));

    let mut pages = Vec::new();
    for caps in PAGE_RE.captures_iter(s) {
        let Some(start) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
            continue;
        };
        let end = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(start);
        if start == 0 {
            continue;
        }
        if end >= start && end - start <= MAX_RANGE_SPAN {
            pages.extend(start..=end);
        } else {
            pages.push(start);
        }
    }
    pages
}
