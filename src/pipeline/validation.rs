//! Tolerant multi-tier comparison of extracted values.
//!
//! Numbers: exact, rounded (within ±1 unit and inside the relative band),
//! tolerant (within the relative band or the absolute epsilon, whichever is
//! wider), else mismatch. Near zero the absolute epsilon alone decides.
//! Strings are case- and whitespace-normalized with a fuzzy similarity
//! fallback. Dates are compared after normalization. Lists ignore order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::{parse_date, parse_swedish_number};
use super::types::{is_populated, MatchTier, ValidationOutcome};

/// Differences below this are float noise.
const EXACT_EPSILON: f64 = 1e-9;

/// Width of the "rounded" tier in value units.
const ROUNDING_UNIT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    /// Relative band, e.g. 0.01 for 1%.
    pub relative: f64,
    /// Absolute band for values near zero.
    pub absolute_epsilon: f64,
    /// Minimum normalized Levenshtein similarity for a fuzzy string match.
    pub string_similarity: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            relative: 0.01,
            absolute_epsilon: 0.5,
            string_similarity: 0.85,
        }
    }
}

/// Tier and numeric deviation for one comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub tier: MatchTier,
    pub deviation: Option<f64>,
}

impl Comparison {
    fn tier(tier: MatchTier) -> Self {
        Self {
            tier,
            deviation: None,
        }
    }
}

// ═══════════════════════════════════════════
// Comparators
// ═══════════════════════════════════════════

pub fn compare_numbers(expected: f64, actual: f64, tolerance: &Tolerance) -> Comparison {
    let diff = (actual - expected).abs();
    let deviation = if expected.abs() > EXACT_EPSILON {
        diff / expected.abs()
    } else {
        diff
    };
    let relative_band = tolerance.relative * expected.abs();
    let near_zero = relative_band < tolerance.absolute_epsilon;
    let band = relative_band.max(tolerance.absolute_epsilon);

    let tier = if diff < EXACT_EPSILON {
        MatchTier::Exact
    } else if !near_zero && diff <= ROUNDING_UNIT && diff <= relative_band {
        MatchTier::Rounded
    } else if diff <= band {
        MatchTier::Tolerant
    } else {
        MatchTier::Mismatch
    };
    Comparison {
        tier,
        deviation: Some(deviation),
    }
}

/// Lowercase, trimmed, internal whitespace collapsed, trailing punctuation dropped.
pub fn normalize_string(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_matches(|c: char| matches!(c, '.' | ',' | ';' | ':'))
        .trim()
        .to_string()
}

pub fn compare_strings(expected: &str, actual: &str, tolerance: &Tolerance) -> Comparison {
    let e = normalize_string(expected);
    let a = normalize_string(actual);
    if e == a {
        return Comparison::tier(MatchTier::Exact);
    }
    let similarity = strsim::normalized_levenshtein(&e, &a);
    let tier = if similarity >= tolerance.string_similarity {
        MatchTier::Tolerant
    } else {
        MatchTier::Mismatch
    };
    Comparison::tier(tier)
}

/// Order-independent list comparison. Exact when the normalized multisets
/// agree; tolerant when every element pairs with a passing counterpart.
pub fn compare_lists(expected: &[Value], actual: &[Value], tolerance: &Tolerance) -> Comparison {
    let mut e_keys: Vec<String> = expected.iter().map(canonical).collect();
    let mut a_keys: Vec<String> = actual.iter().map(canonical).collect();
    e_keys.sort();
    a_keys.sort();
    if e_keys == a_keys {
        return Comparison {
            tier: MatchTier::Exact,
            deviation: Some(0.0),
        };
    }

    let mut unused: Vec<&Value> = actual.iter().collect();
    let mut matched = 0usize;
    for e in expected {
        if let Some(pos) = unused
            .iter()
            .position(|a| compare_values(e, Some(a), tolerance).tier.is_pass())
        {
            unused.remove(pos);
            matched += 1;
        }
    }
    let largest = expected.len().max(actual.len()).max(1);
    let deviation = 1.0 - matched as f64 / largest as f64;
    let tier = if matched == expected.len() && expected.len() == actual.len() {
        MatchTier::Tolerant
    } else {
        MatchTier::Mismatch
    };
    Comparison {
        tier,
        deviation: Some(deviation),
    }
}

fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => normalize_string(s),
        Value::Number(n) => n
            .as_f64()
            .map(|f| format!("{f}"))
            .unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_swedish_number(s),
        _ => None,
    }
}

/// Compare any two JSON values with the appropriate comparator.
pub fn compare_values(expected: &Value, actual: Option<&Value>, tolerance: &Tolerance) -> Comparison {
    let Some(actual) = actual.filter(|v| is_populated(v)) else {
        return Comparison::tier(MatchTier::Missing);
    };

    match (expected, actual) {
        (Value::Array(e), Value::Array(a)) => compare_lists(e, a, tolerance),
        (Value::Array(e), scalar) => compare_lists(e, std::slice::from_ref(scalar), tolerance),
        (scalar, Value::Array(a)) => compare_lists(std::slice::from_ref(scalar), a, tolerance),
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(expected), as_number(actual)) {
            (Some(e), Some(a)) => compare_numbers(e, a, tolerance),
            _ => Comparison::tier(MatchTier::Mismatch),
        },
        (Value::String(e), Value::String(a)) => {
            if let (Some(de), Some(da)) = (parse_date(e), parse_date(a)) {
                return Comparison::tier(if de == da { MatchTier::Exact } else { MatchTier::Mismatch });
            }
            if let (Some(ne), Some(na)) = (parse_swedish_number(e), parse_swedish_number(a)) {
                return compare_numbers(ne, na, tolerance);
            }
            compare_strings(e, a, tolerance)
        }
        (e, a) => Comparison::tier(if canonical(e) == canonical(a) {
            MatchTier::Exact
        } else {
            MatchTier::Mismatch
        }),
    }
}

// ═══════════════════════════════════════════
// Ground-truth validation
// ═══════════════════════════════════════════

/// Flatten nested objects to dotted paths. Arrays are leaves.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(v, path, out);
            }
        }
        other if !prefix.is_empty() => {
            out.insert(prefix, other.clone());
        }
        _ => {}
    }
}

pub struct Validator {
    tolerance: Tolerance,
}

impl Validator {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    pub fn compare(&self, expected: &Value, actual: Option<&Value>) -> Comparison {
        compare_values(expected, actual, &self.tolerance)
    }

    /// Compare every non-null expected field against an extracted record.
    ///
    /// A ground-truth path like `financial.revenue` falls back to `revenue`
    /// when the record has no value at the full path.
    pub fn validate(&self, ground_truth: &Value, record: &Map<String, Value>) -> Vec<ValidationOutcome> {
        let flat_record = flatten(&Value::Object(record.clone()));
        flatten(ground_truth)
            .into_iter()
            .filter(|(_, expected)| !expected.is_null())
            .map(|(path, expected)| {
                let actual = lookup_path(&flat_record, &path);
                let comparison = self.compare(&expected, actual);
                ValidationOutcome {
                    field_path: path,
                    expected,
                    actual: actual.cloned(),
                    tier: comparison.tier,
                    deviation: comparison.deviation,
                }
            })
            .collect()
    }
}

fn lookup_path<'a>(record: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut candidate = path;
    loop {
        if let Some(v) = record.get(candidate) {
            return Some(v);
        }
        match candidate.split_once('.') {
            Some((_, rest)) => candidate = rest,
            None => return None,
        }
    }
}

/// Fraction of outcomes in a passing tier. `None` when there are none.
pub fn pass_rate(outcomes: &[ValidationOutcome]) -> Option<f64> {
    if outcomes.is_empty() {
        return None;
    }
    let passed = outcomes.iter().filter(|o| o.tier.is_pass()).count();
    Some(passed as f64 / outcomes.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tol(relative: f64) -> Tolerance {
        Tolerance {
            relative,
            ..Tolerance::default()
        }
    }

    #[test]
    fn numeric_tiers() {
        let t = Tolerance::default();
        assert_eq!(compare_numbers(1000.0, 1000.0, &t).tier, MatchTier::Exact);
        assert_eq!(compare_numbers(1000.0, 1001.0, &t).tier, MatchTier::Rounded);
        assert_eq!(compare_numbers(1000.0, 1008.0, &t).tier, MatchTier::Tolerant);
        assert_eq!(compare_numbers(1000.0, 1020.0, &t).tier, MatchTier::Mismatch);
    }

    #[test]
    fn one_unit_on_small_values_is_not_rounding() {
        let t = Tolerance::default();
        assert_eq!(compare_numbers(2.0, 3.0, &t).tier, MatchTier::Mismatch);
        assert_eq!(compare_numbers(0.0, 1.0, &t).tier, MatchTier::Mismatch);
        assert_eq!(compare_numbers(0.0, 0.4, &t).tier, MatchTier::Tolerant);
        assert_eq!(compare_numbers(2.0, 2.4, &t).tier, MatchTier::Tolerant);
        let c = compare_values(&json!(2.0), Some(&json!("3,0 %")), &t);
        assert_eq!(c.tier, MatchTier::Mismatch);
        assert!(!c.tier.is_pass());
    }

    #[test]
    fn conflict_example_depends_on_tolerance() {
        let one = compare_numbers(1000.0, 1050.0, &tol(0.01));
        assert_eq!(one.tier, MatchTier::Mismatch);
        assert!((one.deviation.unwrap() - 0.05).abs() < 1e-12);
        assert_eq!(compare_numbers(1000.0, 1050.0, &tol(0.05)).tier, MatchTier::Tolerant);
    }

    #[test]
    fn near_zero_uses_absolute_epsilon() {
        let t = Tolerance {
            absolute_epsilon: 5.0,
            ..Tolerance::default()
        };
        assert_eq!(compare_numbers(0.0, 3.0, &t).tier, MatchTier::Tolerant);
        assert_eq!(compare_numbers(0.0, 6.0, &t).tier, MatchTier::Mismatch);
    }

    #[test]
    fn strings_normalize_and_fuzzy_match() {
        let t = Tolerance::default();
        assert_eq!(compare_strings("Anna Svensson", "  anna   SVENSSON.", &t).tier, MatchTier::Exact);
        assert_eq!(compare_strings("Brf Solbacken", "Brf Solbaken", &t).tier, MatchTier::Tolerant);
        assert_eq!(compare_strings("Stockholm", "Göteborg", &t).tier, MatchTier::Mismatch);
    }

    #[test]
    fn dates_compare_after_normalization() {
        let t = Tolerance::default();
        let c = compare_values(&json!("2023-12-31"), Some(&json!("31 december 2023")), &t);
        assert_eq!(c.tier, MatchTier::Exact);
        let c = compare_values(&json!("2023-12-31"), Some(&json!("2022-12-31")), &t);
        assert_eq!(c.tier, MatchTier::Mismatch);
    }

    #[test]
    fn lists_ignore_order() {
        let t = Tolerance::default();
        let c = compare_values(&json!(["Erik Lind", "Anna Svensson"]), Some(&json!(["anna svensson", "Erik Lind"])), &t);
        assert_eq!(c.tier, MatchTier::Exact);
        let c = compare_values(&json!(["Erik Lind", "Anna Svensson"]), Some(&json!(["Anna Svenson", "Erik Lind"])), &t);
        assert_eq!(c.tier, MatchTier::Tolerant);
        let c = compare_values(&json!(["Erik Lind", "Anna Svensson"]), Some(&json!(["Erik Lind"])), &t);
        assert_eq!(c.tier, MatchTier::Mismatch);
        assert!((c.deviation.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn missing_and_mixed_types() {
        let t = Tolerance::default();
        assert_eq!(compare_values(&json!(5), None, &t).tier, MatchTier::Missing);
        assert_eq!(compare_values(&json!(5), Some(&json!(null)), &t).tier, MatchTier::Missing);
        assert_eq!(compare_values(&json!(1234567), Some(&json!("1 234 567 kr")), &t).tier, MatchTier::Exact);
        assert_eq!(compare_values(&json!(5), Some(&json!("fem")), &t).tier, MatchTier::Mismatch);
    }

    #[test]
    fn validate_against_nested_ground_truth() {
        let v = Validator::new(Tolerance::default());
        let truth = json!({
            "financial": { "revenue": 1000, "total_assets": 5000 },
            "chairman": "Anna Svensson",
            "auditor": null
        });
        let mut record = Map::new();
        record.insert("revenue".into(), json!(1000));
        record.insert("chairman".into(), json!("anna svensson"));

        let outcomes = v.validate(&truth, &record);
        assert_eq!(outcomes.len(), 3);
        let by_path: BTreeMap<_, _> = outcomes.iter().map(|o| (o.field_path.as_str(), o.tier)).collect();
        assert_eq!(by_path["financial.revenue"], MatchTier::Exact);
        assert_eq!(by_path["financial.total_assets"], MatchTier::Missing);
        assert_eq!(by_path["chairman"], MatchTier::Exact);
        assert_eq!(pass_rate(&outcomes), Some(2.0 / 3.0));
        assert_eq!(pass_rate(&[]), None);
    }

    #[test]
    fn flatten_paths() {
        let flat = flatten(&json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"}));
        assert_eq!(flat.len(), 3);
        assert_eq!(flat["a.b"], json!(1));
        assert_eq!(flat["a.c"], json!([1, 2]));
    }
}
