//! Archetype detection and aggregate quality scoring.
//!
//! `overall_score` is always derived from coverage, evidence ratio and
//! validation pass rate with fixed weights; it is never assigned directly.

use std::collections::{BTreeMap, BTreeSet};

use super::agents::AgentRoster;
use super::linker::LinkReport;
use super::types::{AgentId, Archetype, ExtractionResult, QualityMetrics, ValidationOutcome};
use super::validation::pass_rate;

const COVERAGE_WEIGHT: f64 = 0.5;
const EVIDENCE_WEIGHT: f64 = 0.2;
const PASS_RATE_WEIGHT: f64 = 0.3;

/// Documents at or below both limits are simple.
const SIMPLE_MAX_PAGES: u32 = 8;
const SIMPLE_MAX_SECTIONS: usize = 4;

/// Documents at or above either limit are complex.
const COMPLEX_MIN_PAGES: u32 = 25;
const COMPLEX_MIN_SECTIONS: usize = 12;

pub fn classify_archetype(page_count: u32, section_count: usize) -> Archetype {
    if page_count >= COMPLEX_MIN_PAGES || section_count >= COMPLEX_MIN_SECTIONS {
        Archetype::Complex
    } else if page_count <= SIMPLE_MAX_PAGES && section_count <= SIMPLE_MAX_SECTIONS {
        Archetype::Simple
    } else {
        Archetype::Standard
    }
}

/// Weighted combination, bounded to [0, 1].
pub fn overall_score(coverage: f64, evidence_ratio: f64, validation_pass_rate: f64) -> f64 {
    let raw = COVERAGE_WEIGHT * coverage + EVIDENCE_WEIGHT * evidence_ratio + PASS_RATE_WEIGHT * validation_pass_rate;
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Populated applicable fields over applicable fields; 0 when nothing applies.
pub fn coverage(applicable: &BTreeSet<String>, populated: &BTreeSet<String>) -> f64 {
    if applicable.is_empty() {
        return 0.0;
    }
    let hit = applicable.intersection(populated).count();
    (hit as f64 / applicable.len() as f64).clamp(0.0, 1.0)
}

/// Successful results citing verified, non-empty evidence over successful results.
pub fn evidence_ratio<'a>(results: impl IntoIterator<Item = &'a ExtractionResult>) -> f64 {
    let (mut successful, mut evidenced) = (0usize, 0usize);
    for r in results.into_iter().filter(|r| r.is_success()) {
        successful += 1;
        if r.evidence_verified && !r.evidence_pages.is_empty() {
            evidenced += 1;
        }
    }
    if successful == 0 {
        0.0
    } else {
        evidenced as f64 / successful as f64
    }
}

/// Compute quality metrics for one run.
///
/// With ground-truth outcomes the pass rate is their passing fraction;
/// without, it is the cross-agent agreement rate.
pub fn score(
    roster: &AgentRoster,
    archetype: Archetype,
    pass1: &BTreeMap<AgentId, ExtractionResult>,
    pass2: &BTreeMap<AgentId, ExtractionResult>,
    links: &LinkReport,
    validation: &[ValidationOutcome],
) -> QualityMetrics {
    let applicable = roster.applicable_fields(archetype);
    let populated: BTreeSet<String> = pass1
        .values()
        .chain(pass2.values())
        .filter(|r| r.is_success())
        .flat_map(|r| r.data.keys().filter(|k| r.field(k).is_some()).cloned())
        .collect();

    let coverage = coverage(&applicable, &populated);
    let evidence_ratio = evidence_ratio(pass1.values().chain(pass2.values()));
    let validation_pass_rate = pass_rate(validation).unwrap_or_else(|| links.agreement_rate());

    QualityMetrics {
        archetype,
        applicable_fields: applicable.len(),
        populated_fields: applicable.intersection(&populated).count(),
        coverage,
        evidence_ratio,
        validation_pass_rate,
        overall_score: overall_score(coverage, evidence_ratio, validation_pass_rate),
        linked_fields: links.linked,
        conflicts: links.conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ExtractionStatus, MatchTier};
    use serde_json::json;

    fn success(agent: &str, fields: &[(&str, serde_json::Value)], verified: bool) -> ExtractionResult {
        let mut r = ExtractionResult::failed(agent.into(), [1].into_iter().collect(), String::new());
        r.status = ExtractionStatus::Success;
        r.error = None;
        for (k, v) in fields {
            r.data.insert(k.to_string(), v.clone());
        }
        if verified {
            r.evidence_pages = [1].into_iter().collect();
            r.evidence_verified = true;
        }
        r
    }

    #[test]
    fn archetype_boundaries() {
        assert_eq!(classify_archetype(8, 4), Archetype::Simple);
        assert_eq!(classify_archetype(9, 4), Archetype::Standard);
        assert_eq!(classify_archetype(8, 5), Archetype::Standard);
        assert_eq!(classify_archetype(25, 1), Archetype::Complex);
        assert_eq!(classify_archetype(10, 12), Archetype::Complex);
    }

    #[test]
    fn overall_score_bounded_and_deterministic() {
        assert_eq!(overall_score(1.0, 1.0, 1.0), 1.0);
        assert_eq!(overall_score(0.0, 0.0, 0.0), 0.0);
        assert!((overall_score(0.5, 0.5, 0.5) - 0.5).abs() < 1e-12);
        assert_eq!(overall_score(5.0, 5.0, 5.0), 1.0);
        assert_eq!(overall_score(f64::NAN, 0.0, 0.0), 0.0);
    }

    #[test]
    fn coverage_is_monotone_in_populated_fields() {
        let applicable: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let mut populated = BTreeSet::new();
        let mut last = coverage(&applicable, &populated);
        assert_eq!(last, 0.0);
        for f in ["a", "x", "b", "c", "d"] {
            populated.insert(f.to_string());
            let now = coverage(&applicable, &populated);
            assert!(now >= last);
            assert!((0.0..=1.0).contains(&now));
            last = now;
        }
        assert_eq!(last, 1.0);
        assert_eq!(coverage(&BTreeSet::new(), &populated), 0.0);
    }

    #[test]
    fn evidence_ratio_counts_successes_only() {
        let mut failed = success("loans", &[], true);
        failed.status = ExtractionStatus::Failed;
        let results = vec![
            success("financial", &[], true),
            success("governance", &[], false),
            failed,
        ];
        assert_eq!(evidence_ratio(&results), 0.5);
        assert_eq!(evidence_ratio(&Vec::<ExtractionResult>::new()), 0.0);
    }

    #[test]
    fn score_prefers_ground_truth_pass_rate() {
        let roster = AgentRoster::annual_report();
        let pass2: BTreeMap<_, _> = [success("financial", &[("revenue", json!(1)), ("bogus", json!(2))], true)]
            .into_iter()
            .map(|r| (r.agent_id.clone(), r))
            .collect();
        let links = LinkReport::default();

        let no_truth = score(&roster, Archetype::Simple, &BTreeMap::new(), &pass2, &links, &[]);
        assert_eq!(no_truth.validation_pass_rate, 1.0);
        assert_eq!(no_truth.populated_fields, 1);
        assert!(no_truth.coverage > 0.0 && no_truth.coverage < 1.0);
        assert_eq!(no_truth.evidence_ratio, 1.0);

        let outcome = ValidationOutcome {
            field_path: "revenue".into(),
            expected: json!(2),
            actual: Some(json!(1)),
            tier: MatchTier::Mismatch,
            deviation: Some(0.5),
        };
        let with_truth = score(&roster, Archetype::Simple, &BTreeMap::new(), &pass2, &links, &[outcome]);
        assert_eq!(with_truth.validation_pass_rate, 0.0);
        assert!(with_truth.overall_score < no_truth.overall_score);
        assert_eq!(
            with_truth.overall_score,
            overall_score(with_truth.coverage, with_truth.evidence_ratio, 0.0)
        );
    }
}
