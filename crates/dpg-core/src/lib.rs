//! Core domain model for the DewPoint opportunity engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpg-core";

/// Normalized company/user profile consumed by the generation engine.
///
/// `role`, `size` and `pain_point` are always present after normalization;
/// `industry` may be absent and consumers must degrade gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompanyProfile {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub stack: Vec<String>,
    #[serde(default)]
    pub pain_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CompanyProfile {
    /// Returns a copy with defaulted required fields and a deduplicated stack.
    ///
    /// Malformed input is recoverable by contract: an empty role or pain point
    /// becomes a placeholder rather than an error, so generation never aborts.
    pub fn normalized(&self) -> Self {
        let mut stack = Vec::with_capacity(self.stack.len());
        for tool in &self.stack {
            let tool = tool.trim();
            if tool.is_empty() {
                continue;
            }
            if !stack.iter().any(|s: &String| s == tool) {
                stack.push(tool.to_string());
            }
        }
        Self {
            url: self.url.trim().to_string(),
            industry: self
                .industry
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            role: non_empty_or(&self.role, "Owner"),
            size: non_empty_or(&self.size, "Unknown"),
            stack,
            pain_point: non_empty_or(&self.pain_point, "manual busywork"),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }

    /// Case-insensitive membership test against the deduplicated stack.
    pub fn stack_contains(&self, tool: &str) -> bool {
        self.stack.iter().any(|s| s.eq_ignore_ascii_case(tool))
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Implementation difficulty shown in the admin view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Low,
    Med,
    High,
}

/// Visitor-facing narrative for one opportunity. Purely presentational, but
/// must round-trip byte-for-byte through storage and sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicView {
    pub problem: String,
    pub solution_narrative: String,
    pub value_proposition: String,
    pub roi_estimate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walkthrough_steps: Option<Vec<String>>,
}

/// Tool-to-role mapping in the detailed admin stack view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDetail {
    pub tool: String,
    pub role: String,
}

/// Admin-only technical view for one opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminView {
    pub tech_stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_details: Option<Vec<StackDetail>>,
    pub implementation_difficulty: Difficulty,
    pub workflow_steps: String,
    pub upsell_opportunity: String,
}

/// How a record was produced: the optional AI delegate or the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationSource {
    #[serde(rename = "AI")]
    Ai,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub source: GenerationSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// A single recommended automation ("blueprint").
///
/// `title` is the only stable identity across generation runs, toggles and
/// merges. Persisted library records carry a numeric id in a separate
/// namespace (see `Lead`); engine output never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub title: String,
    pub department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    pub public_view: PublicView,
    pub admin_view: AdminView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_metadata: Option<GenerationMetadata>,
}

/// Current actor: a durable anonymous shadow id, or an authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Identity {
    Anonymous { shadow_id: Uuid },
    Authenticated { user_id: i64, email: String },
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated { .. })
    }

    /// Stable key used to address the server-side roadmap for this actor.
    pub fn key(&self) -> String {
        match self {
            Identity::Anonymous { shadow_id } => shadow_id.to_string(),
            Identity::Authenticated { email, .. } => email.clone(),
        }
    }
}

/// Outcome of a roadmap toggle. `Error` means the local toggle succeeded but
/// the server push did not; the local state is never rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToggleAction {
    Added,
    Removed,
    Error,
}

/// Server-side roadmap record owned by one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub identity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<CompanyProfile>,
    pub recipes: Vec<Opportunity>,
    pub created_at: DateTime<Utc>,
}
