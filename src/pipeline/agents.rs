//! Agent roster: per-agent field schemas, keyword profiles and prompts.
//!
//! The default roster targets Swedish housing-association annual reports
//! (årsredovisningar). Pass-1 agents establish identity and governance
//! context; Pass-2 agents extract the financial statements and notes with
//! that context in hand.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::render::{PageContent, RenderedPage};
use super::types::{AgentId, AgentTask, Archetype, Pass};

// ═══════════════════════════════════════════
// Field schema
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Number,
    Text,
    /// ISO `YYYY-MM-DD` after coercion.
    Date,
    /// List of text items.
    List,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Text => "text",
            Self::Date => "date",
            Self::List => "list",
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            Self::Number => json!({ "type": ["number", "null"] }),
            Self::Text => json!({ "type": ["string", "null"] }),
            Self::Date => json!({ "type": ["string", "null"], "format": "date" }),
            Self::List => json!({ "type": ["array", "null"], "items": { "type": "string" } }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Field category used for linker precedence ("financial", "loans", ...).
    pub category: String,
    pub description: String,
    /// Smallest archetype for which the field counts toward coverage.
    /// `None` marks the field optional everywhere.
    pub applicable_from: Option<Archetype>,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind, category: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            category: category.to_string(),
            description: description.to_string(),
            applicable_from: Some(Archetype::Simple),
        }
    }

    fn since(mut self, archetype: Archetype) -> Self {
        self.applicable_from = Some(archetype);
        self
    }

    fn optional(mut self) -> Self {
        self.applicable_from = None;
        self
    }

    pub fn is_applicable(&self, archetype: Archetype) -> bool {
        self.applicable_from.is_some_and(|min| archetype >= min)
    }
}

/// Weighted term in an agent's routing profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    pub term: String,
    pub weight: f32,
}

fn keywords(terms: &[(&str, f32)]) -> Vec<Keyword> {
    terms
        .iter()
        .map(|(term, weight)| Keyword {
            term: term.to_string(),
            weight: *weight,
        })
        .collect()
}

// ═══════════════════════════════════════════
// Agent specs
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub pass: Pass,
    pub instructions: String,
    pub keywords: Vec<Keyword>,
    pub fields: Vec<FieldSpec>,
    /// Field categories for which this agent's value is authoritative.
    #[serde(default)]
    pub primary_categories: Vec<String>,
    /// Receives sections no other agent claims.
    #[serde(default)]
    pub fallback: bool,
}

impl AgentSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The configured set of agents. Order is significant: it breaks routing
/// ties and orders linker precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoster {
    agents: Vec<AgentSpec>,
}

impl AgentRoster {
    pub fn new(agents: Vec<AgentSpec>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| &a.id == id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.get(id).is_some()
    }

    pub fn in_pass(&self, pass: Pass) -> impl Iterator<Item = &AgentSpec> {
        self.agents.iter().filter(move |a| a.pass == pass)
    }

    pub fn fallback(&self) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.fallback)
    }

    /// Position in the roster, used for deterministic ordering.
    pub fn rank(&self, id: &AgentId) -> usize {
        self.agents
            .iter()
            .position(|a| &a.id == id)
            .unwrap_or(usize::MAX)
    }

    /// Agent whose value wins for a field category.
    pub fn primary_for(&self, category: &str) -> Option<&AgentId> {
        self.agents
            .iter()
            .find(|a| a.primary_categories.iter().any(|c| c == category))
            .map(|a| &a.id)
    }

    /// Category of a field name, from the first agent that declares it.
    pub fn category_of(&self, field: &str) -> Option<&str> {
        self.agents
            .iter()
            .find_map(|a| a.field(field))
            .map(|f| f.category.as_str())
    }

    /// Distinct field names applicable to a document of the given archetype.
    pub fn applicable_fields(&self, archetype: Archetype) -> BTreeSet<String> {
        self.agents
            .iter()
            .flat_map(|a| a.fields.iter())
            .filter(|f| f.is_applicable(archetype))
            .map(|f| f.name.clone())
            .collect()
    }

    /// Default roster for Swedish housing-association annual reports.
    pub fn annual_report() -> Self {
        use Archetype::{Complex, Standard};
        use FieldKind::{Date, List, Number, Text};

        let governance = AgentSpec {
            id: "governance".into(),
            pass: Pass::First,
            instructions: "Du läser förvaltningsberättelsen i en årsredovisning. \
Extrahera uppgifter om föreningen, styrelsen och revisionen."
                .to_string(),
            keywords: keywords(&[
                ("förvaltningsberättelse", 0.7),
                ("styrelse", 0.6),
                ("revisionsberättelse", 0.6),
                ("revisor", 0.55),
                ("valberedning", 0.55),
                ("årsstämma", 0.4),
                ("ordförande", 0.4),
                ("underskrifter", 0.4),
            ]),
            fields: vec![
                FieldSpec::new("organization_number", Text, "identity", "Organisationsnummer (NNNNNN-NNNN)"),
                FieldSpec::new("association_name", Text, "identity", "Föreningens namn"),
                FieldSpec::new("fiscal_year_end", Date, "identity", "Räkenskapsårets sista dag"),
                FieldSpec::new("chairman", Text, "governance", "Styrelsens ordförande"),
                FieldSpec::new("board_members", List, "governance", "Styrelseledamöter"),
                FieldSpec::new("auditor", Text, "governance", "Revisor").since(Standard),
                FieldSpec::new("nomination_committee", List, "governance", "Valberedning").optional(),
            ],
            primary_categories: vec!["identity".into(), "governance".into()],
            fallback: false,
        };

        let property = AgentSpec {
            id: "property".into(),
            pass: Pass::First,
            instructions: "Du läser uppgifter om föreningens fastighet. \
Extrahera fastighetsbeteckning, läge, byggår och ytor."
                .to_string(),
            keywords: keywords(&[
                ("fastighet", 0.6),
                ("byggnad", 0.4),
                ("lägenhet", 0.4),
                ("taxeringsvärde", 0.55),
                ("byggår", 0.55),
                ("ytor", 0.3),
            ]),
            fields: vec![
                FieldSpec::new("property_designation", Text, "property", "Fastighetsbeteckning"),
                FieldSpec::new("municipality", Text, "property", "Kommun"),
                FieldSpec::new("apartment_count", Number, "property", "Antal bostadsrättslägenheter"),
                FieldSpec::new("built_year", Number, "property", "Byggår").since(Standard),
                FieldSpec::new("total_area_sqm", Number, "property", "Total boarea i kvadratmeter").since(Standard),
                FieldSpec::new("tax_assessment_value", Number, "property", "Taxeringsvärde i kronor").since(Complex),
                FieldSpec::new("organization_number", Text, "identity", "Organisationsnummer (NNNNNN-NNNN)"),
            ],
            primary_categories: vec!["property".into()],
            fallback: false,
        };

        let financial = AgentSpec {
            id: "financial".into(),
            pass: Pass::Second,
            instructions: "Du läser resultat- och balansräkningen. \
Ange belopp i kronor som tal utan tusentalsavgränsare."
                .to_string(),
            keywords: keywords(&[
                ("resultaträkning", 1.0),
                ("balansräkning", 1.0),
                ("kassaflöde", 0.8),
                ("flerårsöversikt", 0.6),
                ("eget kapital", 0.6),
                ("nyckeltal", 0.55),
            ]),
            fields: vec![
                FieldSpec::new("revenue", Number, "financial", "Nettoomsättning / rörelsens intäkter"),
                FieldSpec::new("net_result", Number, "financial", "Årets resultat"),
                FieldSpec::new("total_assets", Number, "financial", "Summa tillgångar"),
                FieldSpec::new("operating_costs_total", Number, "costs", "Summa driftkostnader"),
                FieldSpec::new("equity", Number, "financial", "Summa eget kapital").since(Standard),
                FieldSpec::new("cash", Number, "financial", "Kassa och bank").since(Standard),
                FieldSpec::new("total_debt", Number, "loans", "Summa skulder till kreditinstitut").since(Standard),
            ],
            primary_categories: vec!["financial".into()],
            fallback: false,
        };

        let loans = AgentSpec {
            id: "loans".into(),
            pass: Pass::Second,
            instructions: "Du läser noten om skulder till kreditinstitut. \
Lista varje lån med långivare, belopp, ränta och villkorsändringsdag."
                .to_string(),
            keywords: keywords(&[
                ("skulder till kreditinstitut", 1.0),
                ("kreditinstitut", 0.8),
                ("fastighetslån", 0.8),
                ("lån", 0.55),
                ("ränta", 0.4),
                ("noter", 0.6),
            ]),
            fields: vec![
                FieldSpec::new("total_debt", Number, "loans", "Summa skulder till kreditinstitut").since(Standard),
                FieldSpec::new("loans", List, "loans", "Lån: långivare, belopp, ränta, förfallodag").since(Standard),
                FieldSpec::new("average_interest_rate", Number, "loans", "Genomsnittlig ränta i procent").since(Complex),
                FieldSpec::new("next_rate_change", Date, "loans", "Närmaste villkorsändringsdag").optional(),
            ],
            primary_categories: vec!["loans".into()],
            fallback: false,
        };

        let operating_costs = AgentSpec {
            id: "operating_costs".into(),
            pass: Pass::Second,
            instructions: "Du läser noten om driftkostnader. \
Ange varje kostnadspost i kronor som tal."
                .to_string(),
            keywords: keywords(&[
                ("driftkostnader", 1.0),
                ("underhåll", 0.6),
                ("taxebundna", 0.55),
                ("fastighetsskatt", 0.55),
                ("noter", 0.6),
                ("kostnader", 0.3),
            ]),
            fields: vec![
                FieldSpec::new("operating_costs_total", Number, "costs", "Summa driftkostnader"),
                FieldSpec::new("maintenance_costs", Number, "costs", "Underhåll och reparationer").since(Standard),
                FieldSpec::new("utility_costs", Number, "costs", "Taxebundna kostnader (el, värme, vatten)").since(Standard),
                FieldSpec::new("property_tax", Number, "costs", "Fastighetsavgift / fastighetsskatt").since(Complex),
            ],
            primary_categories: vec!["costs".into()],
            fallback: false,
        };

        let general = AgentSpec {
            id: "general".into(),
            pass: Pass::Second,
            instructions: "Du läser ett avsnitt som inte hör till något specialområde. \
Extrahera de nyckeluppgifter som finns."
                .to_string(),
            keywords: Vec::new(),
            fields: vec![
                FieldSpec::new("organization_number", Text, "identity", "Organisationsnummer (NNNNNN-NNNN)"),
                FieldSpec::new("total_assets", Number, "financial", "Summa tillgångar"),
                FieldSpec::new("net_result", Number, "financial", "Årets resultat"),
                FieldSpec::new("significant_events", List, "general", "Väsentliga händelser under året").optional(),
            ],
            primary_categories: Vec::new(),
            fallback: true,
        };

        Self::new(vec![governance, property, financial, loans, operating_costs, general])
    }
}

// ═══════════════════════════════════════════
// Prompt & schema assembly
// ═══════════════════════════════════════════

/// JSON schema for the response contract `{"data": {...}, "evidence_pages": [...]}`.
pub fn schema_descriptor(spec: &AgentSpec) -> Value {
    let properties: Map<String, Value> = spec
        .fields
        .iter()
        .map(|f| (f.name.clone(), f.kind.json_schema()))
        .collect();
    json!({
        "type": "object",
        "properties": {
            "data": { "type": "object", "properties": properties },
            "evidence_pages": { "type": "array", "items": { "type": "integer" } }
        },
        "required": ["data", "evidence_pages"]
    })
}

/// Build the prompt for one agent task.
///
/// Text-mode pages are inlined; image pages travel alongside the prompt.
pub fn build_prompt(
    spec: &AgentSpec,
    task: &AgentTask,
    context: &Map<String, Value>,
    pages: &[RenderedPage],
) -> String {
    let field_lines = spec
        .fields
        .iter()
        .map(|f| format!("- {} ({}): {}", f.name, f.kind.as_str(), f.description))
        .collect::<Vec<_>>()
        .join("\n");
    let page_list = task
        .pages
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = format!(
        "{instructions}\n\n\
Avsnitt: {sections}\n\
Sidor: {page_list}\n\n\
Fält att extrahera:\n{field_lines}\n\n\
Svara ENDAST med JSON på formen \
{{\"data\": {{<fält>: <värde eller null>}}, \"evidence_pages\": [<sidnummer>]}}.\n\
Ange null för fält som inte finns i underlaget. \
evidence_pages ska bara innehålla sidor ur listan ovan där värdena står.",
        instructions = spec.instructions,
        sections = task.section_headings.join("; "),
    );

    if !context.is_empty() {
        let context_json =
            serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string());
        prompt.push_str("\n\nKänd kontext från tidigare steg (skrivskyddad):\n");
        prompt.push_str(&context_json);
    }

    let mut texts = pages.iter().filter_map(|p| match &p.content {
        PageContent::Text(text) => Some((p.page_number, text)),
        PageContent::Png(_) => None,
    });
    if let Some(first) = texts.next() {
        prompt.push_str("\n\nSidtext:");
        for (page, text) in std::iter::once(first).chain(texts) {
            prompt.push_str(&format!("\n--- Sida {page} ---\n{}", text.trim()));
        }
    }

    prompt
}

/// Re-prompt asking the model to correct an unparseable response.
pub fn build_repair_prompt(original_prompt: &str, bad_response: &str, problem: &str) -> String {
    let excerpt: String = bad_response.chars().take(2000).collect();
    format!(
        "{original_prompt}\n\n\
Ditt förra svar kunde inte tolkas ({problem}). Förra svaret:\n{excerpt}\n\n\
Svara nu ENDAST med ett giltigt JSON-objekt enligt formatet ovan, utan förklaringar."
    )
}
