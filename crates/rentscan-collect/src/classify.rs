//! Ownership and rent-stabilization heuristics.
//!
//! Ownership is an ordered tier list where the first decisive tier wins. The first three
//! tiers read the record alone; the fourth asks the listing API for the rental's agents.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rentscan_adapters::{decode_agents, AGENTS_FOR_RENTAL};
use rentscan_core::{
    AgentContact, ClassifiedListing, DetectionMethod, OwnershipVerdict, PatternIndicator,
    RawRentalRecord, StabilizationAssessment, StabilizationConfidence,
};
use rentscan_storage::{execute_query, GraphqlTransport};
use serde::Deserialize;
use tracing::debug;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

/// Word lists driving the ownership tiers. Overridable from `rules/ownership.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OwnershipRules {
    pub personal_domains: Vec<String>,
    pub real_estate_domains: Vec<String>,
    pub corporate_keywords: Vec<String>,
    pub agent_personal_domains: Vec<String>,
    pub agent_corporate_domains: Vec<String>,
    pub agent_corporate_keywords: Vec<String>,
    pub name_match_threshold: f64,
}

impl Default for OwnershipRules {
    fn default() -> Self {
        Self {
            personal_domains: strings(&[
                "@gmail.", "@aol.", "@yahoo.", "@hotmail.", "@outlook.", "@me.", "@icloud.",
                "@earthlink.", "@comcast.", "@verizon.", "@att.net", "@sbcglobal.",
            ]),
            real_estate_domains: strings(&[
                "corcoran.com", "elliman.com", "compass.com", "sothebys.com", "realtor.com",
                "keller", "coldwell", "remax", "century21", "cbcommercial", "warburg",
            ]),
            corporate_keywords: strings(&[
                "realty", "group", "inc", "llc", "corp", "company", "associates", "properties",
                "real estate", "broker", "brokerage", "team", "agency",
            ]),
            agent_personal_domains: strings(&[
                "@gmail.", "@yahoo.", "@hotmail.", "@outlook.", "@aol.", "@me.", "@icloud.",
            ]),
            agent_corporate_domains: strings(&[
                "corcoran.com", "compass.com", "elliman.com", "sothebys.com", "halstead.com",
                "warburgrealty.com", "nest.com", "bondny.com", "tabak",
            ]),
            agent_corporate_keywords: strings(&[
                "realty", "real estate", "broker", "brokerage", "group", "inc", "llc",
                "associates", "properties", "team", "agency", "company", "corp", "management",
                "property", "residential", "commercial", "licensed",
            ]),
            name_match_threshold: 0.6,
        }
    }
}

impl OwnershipRules {
    /// Tiers 1-3. `None` means the record alone is inconclusive.
    pub fn classify_record(&self, raw: &RawRentalRecord) -> Option<OwnershipVerdict> {
        let agent = raw.agent.as_ref();
        let name = agent.and_then(|a| a.name.as_deref()).unwrap_or_default();
        let email = agent.and_then(|a| a.email.as_deref()).unwrap_or_default();

        if name.to_lowercase().contains("owner") {
            return Some(OwnershipVerdict::owner(DetectionMethod::AgentName, 95));
        }
        if raw.owner_contact_info.is_some() {
            return Some(OwnershipVerdict::owner(DetectionMethod::OwnerContact, 90));
        }
        if name.is_empty() && email.is_empty() {
            return None;
        }
        self.pattern_analysis(name, email)
    }

    fn pattern_analysis(&self, name: &str, email: &str) -> Option<OwnershipVerdict> {
        let name_lower = name.to_lowercase();
        let email_lower = email.to_lowercase();

        let mut indicators = Vec::new();
        let mut score: u8 = 0;
        if contains_any(&email_lower, &self.personal_domains) {
            indicators.push(PatternIndicator::PersonalEmailDomain);
            score += 30;
        }
        // A brokerage domain wipes the email evidence; the name checks still run.
        if contains_any(&email_lower, &self.real_estate_domains) {
            indicators.clear();
            score = 0;
        }
        let words = name_lower.split_whitespace().count();
        if (2..=3).contains(&words) && !contains_any(&name_lower, &self.corporate_keywords) {
            indicators.push(PatternIndicator::SimplePersonalName);
            score += 25;
        }
        if !email_lower.is_empty() {
            let username = email_lower.split('@').next().unwrap_or_default();
            let matches = name_lower
                .split_whitespace()
                .any(|part| part.chars().count() > 2 && username.contains(part));
            if matches {
                indicators.push(PatternIndicator::EmailMatchesName);
                score += 20;
            }
        }

        if indicators.len() < 2 {
            return None;
        }
        let mut verdict = OwnershipVerdict::owner(DetectionMethod::PatternAnalysis, score.min(85));
        verdict.indicators = indicators;
        Some(verdict)
    }

    /// Tier 4: the first agent returned by the agents lookup decides.
    pub fn classify_agents(&self, agents: &[AgentContact]) -> OwnershipVerdict {
        let Some(agent) = agents.first() else {
            return OwnershipVerdict::not_owner(DetectionMethod::AgentApiNoAgents);
        };
        let name = agent.name.as_deref().unwrap_or_default().to_lowercase();
        let email = agent.email.as_deref().unwrap_or_default().to_lowercase();

        if name.contains("owner") || email.contains("owner") || (name == email && name.contains('@')) {
            return OwnershipVerdict::owner(DetectionMethod::AgentApiExplicit, 95);
        }
        if contains_any(&email, &self.agent_corporate_domains)
            || contains_any(&name, &self.agent_corporate_keywords)
        {
            return OwnershipVerdict::not_owner(DetectionMethod::AgentApiCorporate);
        }
        if contains_any(&email, &self.agent_personal_domains) {
            if let Some((username, _)) = email.split_once('@') {
                if self.name_matches_username(&name, username) {
                    return OwnershipVerdict::owner(DetectionMethod::AgentApiPersonalMatch, 85);
                }
            }
            return OwnershipVerdict::not_owner(DetectionMethod::AgentApiPersonalNoMatch);
        }
        OwnershipVerdict::not_owner(DetectionMethod::AgentApiInsufficient)
    }

    /// Containment either way, or shared distinct letters above the threshold relative
    /// to the longer string. An empty name is contained in any username.
    fn name_matches_username(&self, name: &str, username: &str) -> bool {
        let name_clean: String = name.chars().filter(|c| c.is_alphabetic()).collect();
        if username.contains(&name_clean) || name_clean.contains(username) {
            return true;
        }
        let name_letters: HashSet<char> = name_clean.chars().collect();
        let user_letters: HashSet<char> = username.chars().collect();
        let shared = name_letters.intersection(&user_letters).count();
        let longest = name_clean.chars().count().max(username.chars().count()).max(1);
        shared as f64 / longest as f64 > self.name_match_threshold
    }
}

/// Price ceilings by bedroom count and the construction-year cutoff.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StabilizationRules {
    pub studio_max: f64,
    pub one_bedroom_max: f64,
    pub two_bedroom_max: f64,
    pub three_plus_max: f64,
    pub built_before: i32,
    pub source_flag_evidence: String,
}

impl Default for StabilizationRules {
    fn default() -> Self {
        Self {
            studio_max: 2500.0,
            one_bedroom_max: 3000.0,
            two_bedroom_max: 4000.0,
            three_plus_max: 5000.0,
            built_before: 1974,
            source_flag_evidence: "Marked as rent stabilized by the listing source".to_string(),
        }
    }
}

fn dollars(amount: f64) -> String {
    let whole = amount.round() as i64;
    let digits = whole.abs().to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    format!("${out}")
}

impl StabilizationRules {
    pub fn assess(&self, listing: &ClassifiedListing) -> StabilizationAssessment {
        if listing.is_rent_stabilized {
            return StabilizationAssessment {
                likely_stabilized: true,
                confidence: StabilizationConfidence::High,
                evidence: self.source_flag_evidence.clone(),
            };
        }

        let price = listing.price;
        let mut evidence = Vec::new();
        let (label, ceiling) = match listing.bedroom_count {
            0 => ("Studio".to_string(), self.studio_max),
            1 => ("1BR".to_string(), self.one_bedroom_max),
            2 => ("2BR".to_string(), self.two_bedroom_max),
            n => (format!("{n}BR"), self.three_plus_max),
        };
        if price < ceiling {
            evidence.push(format!("{label} under {} ({price})", dollars(ceiling)));
        }
        if let Some(year) = listing.building_year_built {
            if year < self.built_before {
                evidence.push(format!("Pre-{} building ({year})", self.built_before));
            }
        }

        let confidence = match evidence.len() {
            0 => StabilizationConfidence::None,
            1 => StabilizationConfidence::Medium,
            _ => StabilizationConfidence::High,
        };
        StabilizationAssessment {
            likely_stabilized: !evidence.is_empty(),
            confidence,
            evidence: evidence.join("; "),
        }
    }
}

/// Both rule sets, loaded once per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationRules {
    pub ownership: OwnershipRules,
    pub stabilization: StabilizationRules,
}

fn load_optional_yaml<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

impl ClassificationRules {
    /// Reads `rules/ownership.yaml` and `rules/stabilization.yaml` when present. Absent
    /// files and absent keys fall back to the built-in lists.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        Ok(Self {
            ownership: load_optional_yaml(&rules_dir.join("ownership.yaml"))?,
            stabilization: load_optional_yaml(&rules_dir.join("stabilization.yaml"))?,
        })
    }
}

/// Ownership verdict plus the agent that tier 4 based it on, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipOutcome {
    pub verdict: OwnershipVerdict,
    pub decided_by: Option<AgentContact>,
}

/// Runs the tier list, calling the agents lookup only when tiers 1-3 are inconclusive.
#[derive(Clone)]
pub struct OwnershipClassifier {
    rules: OwnershipRules,
    transport: Arc<dyn GraphqlTransport>,
}

impl OwnershipClassifier {
    pub fn new(rules: OwnershipRules, transport: Arc<dyn GraphqlTransport>) -> Self {
        Self { rules, transport }
    }

    pub async fn classify(&self, raw: &RawRentalRecord) -> OwnershipOutcome {
        if let Some(verdict) = self.rules.classify_record(raw) {
            return OwnershipOutcome {
                verdict,
                decided_by: None,
            };
        }
        let undetermined = OwnershipOutcome {
            verdict: OwnershipVerdict::not_owner(DetectionMethod::None),
            decided_by: None,
        };
        let Some(id) = raw.id.as_deref().filter(|id| !id.is_empty()) else {
            return undetermined;
        };

        let request = AGENTS_FOR_RENTAL.request(id);
        let data = match execute_query(
            self.transport.as_ref(),
            AGENTS_FOR_RENTAL.name,
            &request,
            &AGENTS_FOR_RENTAL.policy(),
        )
        .await
        {
            Ok(data) => data,
            Err(err) => {
                debug!(rental = id, error = %err, "agents lookup failed");
                return undetermined;
            }
        };
        let agents = match decode_agents(&data) {
            Ok(agents) => agents,
            Err(err) => {
                debug!(rental = id, error = %err, "agents payload unreadable");
                return undetermined;
            }
        };
        OwnershipOutcome {
            verdict: self.rules.classify_agents(&agents),
            decided_by: agents.into_iter().next(),
        }
    }
}

/// Writes an ownership outcome onto a listing, including the deciding agent's contact.
pub fn apply_ownership(listing: &mut ClassifiedListing, outcome: OwnershipOutcome) {
    if let Some(agent) = outcome.decided_by {
        listing.agent_name = agent.name;
        listing.agent_email = agent.email;
    }
    listing.apply_ownership(outcome.verdict);
}
