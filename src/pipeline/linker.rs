//! Cross-agent consistency linking.
//!
//! Fields reported by more than one successful agent are compared with the
//! tolerant comparators. Agreement marks the field linked; disagreement is
//! a conflict that keeps every value. The authoritative value comes from the
//! agent that is primary for the field's category; without one, a conflict
//! is reported as a tie and the first value in pass/roster order stands in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::agents::AgentRoster;
use super::types::{AgentId, ExtractionResult, MatchTier};
use super::validation::{compare_values, Tolerance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Only one agent reported the field.
    Single,
    /// Every report agrees within tolerance.
    Linked,
    /// Reports disagree; all values are retained.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentValue {
    pub agent_id: AgentId,
    pub value: Value,
    /// Tier of this value against the reference value.
    pub tier: MatchTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLink {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub status: LinkStatus,
    pub values: Vec<AgentValue>,
    pub authoritative_agent: AgentId,
    /// Conflict with no primary agent to settle it.
    #[serde(default)]
    pub tie: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkReport {
    pub links: Vec<FieldLink>,
    /// One value per field, chosen by precedence.
    pub authoritative: Map<String, Value>,
    pub linked: usize,
    pub conflicts: usize,
    /// Fields in conflict that no primary agent settles.
    pub ties: Vec<String>,
}

impl LinkReport {
    pub fn link(&self, field: &str) -> Option<&FieldLink> {
        self.links.iter().find(|l| l.field == field)
    }

    /// Agreement rate among overlapping fields, 1.0 when nothing overlaps.
    pub fn agreement_rate(&self) -> f64 {
        let compared = self.linked + self.conflicts;
        if compared == 0 {
            1.0
        } else {
            self.linked as f64 / compared as f64
        }
    }
}

pub struct CrossAgentLinker {
    roster: Arc<AgentRoster>,
    tolerance: Tolerance,
}

impl CrossAgentLinker {
    pub fn new(roster: Arc<AgentRoster>, tolerance: Tolerance) -> Self {
        Self { roster, tolerance }
    }

    /// Reconcile successful results from both passes.
    pub fn link(
        &self,
        pass1: &BTreeMap<AgentId, ExtractionResult>,
        pass2: &BTreeMap<AgentId, ExtractionResult>,
    ) -> LinkReport {
        let mut ordered: Vec<&ExtractionResult> = pass1.values().filter(|r| r.is_success()).collect();
        ordered.sort_by_key(|r| self.roster.rank(&r.agent_id));
        let mut second: Vec<&ExtractionResult> = pass2.values().filter(|r| r.is_success()).collect();
        second.sort_by_key(|r| self.roster.rank(&r.agent_id));
        ordered.extend(second);

        let mut sources: BTreeMap<&str, Vec<(&AgentId, &Value)>> = BTreeMap::new();
        let mut seen: BTreeSet<(&str, &AgentId)> = BTreeSet::new();
        for result in &ordered {
            for (field, value) in &result.data {
                if result.field(field).is_some() && seen.insert((field.as_str(), &result.agent_id)) {
                    sources.entry(field.as_str()).or_default().push((&result.agent_id, value));
                }
            }
        }

        let mut report = LinkReport::default();
        for (field, reports) in sources {
            let link = self.link_field(field, &reports);
            match link.status {
                LinkStatus::Linked => report.linked += 1,
                LinkStatus::Conflict => {
                    report.conflicts += 1;
                    warn!(
                        field,
                        values = ?link.values.iter().map(|v| (v.agent_id.as_str(), v.value.to_string())).collect::<Vec<_>>(),
                        authoritative = %link.authoritative_agent,
                        tie = link.tie,
                        "Cross-agent conflict"
                    );
                }
                LinkStatus::Single => {}
            }
            if link.tie {
                report.ties.push(field.to_string());
            }
            if let Some(v) = link
                .values
                .iter()
                .find(|v| v.agent_id == link.authoritative_agent)
            {
                report.authoritative.insert(field.to_string(), v.value.clone());
            }
            report.links.push(link);
        }

        debug!(
            fields = report.links.len(),
            linked = report.linked,
            conflicts = report.conflicts,
            ties = report.ties.len(),
            "Linked agent results"
        );
        report
    }

    fn link_field(&self, field: &str, reports: &[(&AgentId, &Value)]) -> FieldLink {
        let category = self.roster.category_of(field).map(str::to_string);
        let primary = category
            .as_deref()
            .and_then(|c| self.roster.primary_for(c))
            .filter(|p| reports.iter().any(|(id, _)| id == p));

        let reference = primary
            .and_then(|p| reports.iter().find(|(id, _)| *id == p))
            .or_else(|| reports.first())
            .map(|(_, v)| *v);

        let values: Vec<AgentValue> = reports
            .iter()
            .map(|(id, value)| AgentValue {
                agent_id: (*id).clone(),
                value: (*value).clone(),
                tier: match reference {
                    Some(r) => compare_values(r, Some(value), &self.tolerance).tier,
                    None => MatchTier::Missing,
                },
            })
            .collect();

        let status = if values.len() < 2 {
            LinkStatus::Single
        } else if values.iter().all(|v| v.tier.is_pass()) {
            LinkStatus::Linked
        } else {
            LinkStatus::Conflict
        };

        let authoritative_agent = primary
            .cloned()
            .or_else(|| values.first().map(|v| v.agent_id.clone()))
            .unwrap_or_else(|| AgentId::new(""));
        let tie = status == LinkStatus::Conflict && primary.is_none();

        FieldLink {
            field: field.to_string(),
            category,
            status,
            values,
            authoritative_agent,
            tie,
        }
    }
}
