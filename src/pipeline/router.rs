//! Section-to-agent routing by content.
//!
//! Every section heading is scored against each agent's weighted keyword
//! profile. Position and note numbering never enter the score, so
//! "Not 4 Driftkostnader" and "Not 11 Driftkostnader" route identically.
//! Sections nobody claims go to the fallback agent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::agents::{AgentRoster, AgentSpec};
use super::types::{AgentId, AgentTask, RoutingDecision, Section};

/// Tunable acceptance rules for multi-agent assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// An agent receives a section when its score exceeds this.
    pub acceptance_threshold: f32,
    /// Keep only the best-scoring agents per section. `None` keeps all.
    pub max_agents_per_section: Option<usize>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.5,
            max_agents_per_section: None,
        }
    }
}

/// Tasks plus the per-section decisions that produced them.
#[derive(Debug, Clone)]
pub struct RoutingPlan {
    /// One task per routed agent, in roster order.
    pub tasks: Vec<AgentTask>,
    pub decisions: Vec<RoutingDecision>,
}

impl RoutingPlan {
    pub fn task(&self, agent_id: &str) -> Option<&AgentTask> {
        self.tasks.iter().find(|t| t.agent_id.as_str() == agent_id)
    }
}

pub struct SectionRouter {
    roster: Arc<AgentRoster>,
    policy: RoutingPolicy,
}

impl SectionRouter {
    pub fn new(roster: Arc<AgentRoster>, policy: RoutingPolicy) -> Self {
        Self { roster, policy }
    }

    /// Agents accepted for one section, best score first.
    pub fn assign(&self, section: &Section) -> RoutingDecision {
        let normalized = normalize_text(&section.heading);
        let mut accepted: Vec<(AgentId, f32, usize)> = self
            .roster
            .agents()
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.fallback)
            .map(|(rank, a)| (a.id.clone(), score_heading(a, &normalized), rank))
            .filter(|(_, score, _)| *score > self.policy.acceptance_threshold && *score > 0.0)
            .collect();

        accepted.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
        if let Some(max) = self.policy.max_agents_per_section {
            accepted.truncate(max.max(1));
        }

        if accepted.is_empty() {
            return match self.roster.fallback() {
                Some(fallback) => {
                    debug!(heading = %section.heading, agent_id = %fallback.id, "Section routed to fallback agent");
                    RoutingDecision {
                        heading: section.heading.clone(),
                        assigned: vec![(fallback.id.clone(), 0.0)],
                        fallback: true,
                    }
                }
                None => {
                    warn!(heading = %section.heading, "No agent accepts section and no fallback configured");
                    RoutingDecision {
                        heading: section.heading.clone(),
                        assigned: Vec::new(),
                        fallback: false,
                    }
                }
            };
        }

        RoutingDecision {
            heading: section.heading.clone(),
            assigned: accepted.into_iter().map(|(id, score, _)| (id, score)).collect(),
            fallback: false,
        }
    }

    /// Route every section and merge assignments into one task per agent.
    pub fn route(&self, sections: &[Section], schema_version: &str) -> RoutingPlan {
        let mut headings: BTreeMap<AgentId, Vec<String>> = BTreeMap::new();
        let mut pages: BTreeMap<AgentId, BTreeSet<u32>> = BTreeMap::new();
        let mut decisions = Vec::with_capacity(sections.len());

        for section in sections {
            let decision = self.assign(section);
            for (agent_id, _) in &decision.assigned {
                headings
                    .entry(agent_id.clone())
                    .or_default()
                    .push(section.heading.clone());
                pages.entry(agent_id.clone()).or_default().extend(section.pages());
            }
            decisions.push(decision);
        }

        let tasks: Vec<AgentTask> = self
            .roster
            .agents()
            .iter()
            .filter_map(|agent| {
                let agent_pages = pages.remove(&agent.id)?;
                Some(AgentTask {
                    agent_id: agent.id.clone(),
                    section_headings: headings.remove(&agent.id).unwrap_or_default(),
                    pages: agent_pages,
                    schema_version: schema_version.to_string(),
                })
            })
            .collect();

        debug!(
            sections = sections.len(),
            tasks = tasks.len(),
            fallback_sections = decisions.iter().filter(|d| d.fallback).count(),
            "Routed sections"
        );

        RoutingPlan { tasks, decisions }
    }
}

/// Lowercase, with every non-alphanumeric run collapsed to one space.
pub fn normalize_text(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn score_heading(agent: &AgentSpec, normalized_heading: &str) -> f32 {
    let total: f32 = agent
        .keywords
        .iter()
        .filter(|k| {
            let term = normalize_text(&k.term);
            !term.is_empty() && normalized_heading.contains(&term)
        })
        .map(|k| k.weight.max(0.0))
        .sum();
    total.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ContentHint;

    fn section(heading: &str, start: u32, end: u32) -> Section {
        Section {
            heading: heading.into(),
            page_start: start,
            page_end: end,
            content_hint: ContentHint::Mixed,
            confidence: 0.5,
        }
    }

    fn router(policy: RoutingPolicy) -> SectionRouter {
        SectionRouter::new(Arc::new(AgentRoster::annual_report()), policy)
    }

    fn agents(decision: &RoutingDecision) -> Vec<&str> {
        decision.assigned.iter().map(|(id, _)| id.as_str()).collect()
    }

    #[test]
    fn income_statement_goes_to_financial() {
        let r = router(RoutingPolicy::default());
        let d = r.assign(&section("Resultaträkning", 4, 4));
        assert_eq!(agents(&d), vec!["financial"]);
        assert!(d.assigned[0].1 > 0.5);
        assert!(!d.fallback);
    }

    #[test]
    fn note_routing_ignores_note_number() {
        let r = router(RoutingPolicy::default());
        for heading in ["Not 4 Driftkostnader", "Not 11 Driftkostnader", "NOT 4: DRIFTKOSTNADER"] {
            let d = r.assign(&section(heading, 8, 8));
            assert_eq!(agents(&d), vec!["operating_costs"], "heading {heading}");
        }
    }

    #[test]
    fn notes_section_feeds_two_agents() {
        let r = router(RoutingPolicy::default());
        let d = r.assign(&section("Noter", 7, 10));
        assert_eq!(agents(&d), vec!["loans", "operating_costs"]);
    }

    #[test]
    fn max_agents_keeps_best_and_breaks_ties_by_roster_order() {
        let r = router(RoutingPolicy {
            acceptance_threshold: 0.5,
            max_agents_per_section: Some(1),
        });
        let d = r.assign(&section("Noter", 7, 10));
        assert_eq!(agents(&d), vec!["loans"]);

        let d = r.assign(&section("Noter och skulder till kreditinstitut", 7, 10));
        assert_eq!(agents(&d), vec!["loans"]);
    }

    #[test]
    fn unmatched_section_goes_to_fallback() {
        let r = router(RoutingPolicy::default());
        let d = r.assign(&section("Bilaga A", 12, 12));
        assert_eq!(agents(&d), vec!["general"]);
        assert!(d.fallback);
    }

    #[test]
    fn threshold_is_tunable() {
        let strict = router(RoutingPolicy {
            acceptance_threshold: 0.9,
            max_agents_per_section: None,
        });
        // "byggnad" (0.4) alone stays below 0.9
        let d = strict.assign(&section("Byggnad", 3, 3));
        assert!(d.fallback);

        let lax = router(RoutingPolicy {
            acceptance_threshold: 0.3,
            max_agents_per_section: None,
        });
        assert_eq!(agents(&lax.assign(&section("Byggnad", 3, 3))), vec!["property"]);
    }

    #[test]
    fn score_at_threshold_is_not_accepted() {
        // "byggnad" scores exactly 0.4
        let at = router(RoutingPolicy {
            acceptance_threshold: 0.4,
            max_agents_per_section: None,
        });
        assert!(at.assign(&section("Byggnad", 3, 3)).fallback);

        let below = router(RoutingPolicy {
            acceptance_threshold: 0.39,
            max_agents_per_section: None,
        });
        assert_eq!(agents(&below.assign(&section("Byggnad", 3, 3))), vec!["property"]);
    }

    #[test]
    fn route_merges_sections_per_agent_in_roster_order() {
        let r = router(RoutingPolicy::default());
        let plan = r.route(
            &[
                section("Förvaltningsberättelse", 1, 3),
                section("Resultaträkning", 4, 4),
                section("Balansräkning", 5, 6),
                section("Bilaga", 10, 10),
            ],
            "v2",
        );
        let ids: Vec<_> = plan.tasks.iter().map(|t| t.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["governance", "financial", "general"]);

        let financial = plan.task("financial").unwrap();
        assert_eq!(financial.pages.iter().copied().collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(financial.section_headings, vec!["Resultaträkning", "Balansräkning"]);
        assert_eq!(financial.schema_version, "v2");
        assert_eq!(plan.decisions.len(), 4);
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_text("  Not 4 – Driftkostnader! "), "not 4 driftkostnader");
        assert_eq!(normalize_text("EGET KAPITAL"), "eget kapital");
    }
}
