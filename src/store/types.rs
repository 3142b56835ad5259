//! Record types for the retention store.
//!
//! Defines the persisted records ([`Session`], [`Observation`], [`SessionSummary`],
//! [`UserPrompt`]), the write-side inputs ([`NewObservation`], [`NewSummary`]), and
//! the small enums that travel through queries ([`Scope`], [`ObservationType`],
//! [`OrderBy`], [`RetentionScope`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Error;

/// Concepts that promote an observation to global scope when no scope is given.
pub const GLOBALIZABLE_CONCEPTS: &[&str] = &[
    "security",
    "performance",
    "testing",
    "pattern",
    "anti-pattern",
    "best-practice",
    "architecture",
    "debugging",
    "workflow",
    "tooling",
];

/// Visibility class of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Visible only within the owning project.
    Project,
    /// Visible from every project.
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Global => "global",
        }
    }

    /// Scope implied by a concept list: global if any concept is globalizable.
    pub fn from_concepts(concepts: &[String]) -> Self {
        let global = concepts.iter().any(|c| {
            let c = c.trim().to_lowercase();
            GLOBALIZABLE_CONCEPTS.contains(&c.as_str())
        });
        if global {
            Self::Global
        } else {
            Self::Project
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "global" => Ok(Self::Global),
            _ => Err(Error::unknown("scope", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Decision,
    Bugfix,
    Feature,
    Refactor,
    Discovery,
    Change,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Bugfix => "bugfix",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Discovery => "discovery",
            Self::Change => "change",
        }
    }
}

impl std::fmt::Display for ObservationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObservationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(Self::Decision),
            "bugfix" => Ok(Self::Bugfix),
            "feature" => Ok(Self::Feature),
            "refactor" => Ok(Self::Refactor),
            "discovery" => Ok(Self::Discovery),
            "change" => Ok(Self::Change),
            _ => Err(Error::unknown("observation type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::unknown("session status", s)),
        }
    }
}

/// Result ordering for by-ID fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    DateAsc,
    DateDesc,
    Importance,
    /// Importance then recency for observations, recency for everything else.
    #[default]
    Default,
}

impl std::str::FromStr for OrderBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date_asc" => Ok(Self::DateAsc),
            "date_desc" => Ok(Self::DateDesc),
            "importance" => Ok(Self::Importance),
            "" | "default" | "relevance" => Ok(Self::Default),
            _ => Err(Error::unknown("order", s)),
        }
    }
}

/// Which pool a retention pass applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionScope {
    /// One project's rows. For observations, only its project-scoped rows.
    Project(String),
    /// Cross-project pool. For observations, the global-scoped rows; for prompts, every row.
    Global,
}

/// Which observations a listing or full-text search may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationFilter {
    /// `None` spans every project.
    pub project: Option<String>,
    /// Global-scope rows. With a project, these are the ones shared from elsewhere.
    pub include_global: bool,
    /// Skip superseded rows.
    pub active_only: bool,
}

impl ObservationFilter {
    /// What `project` sees: its own project-scoped rows plus every global row.
    pub fn visible_to(project: &str) -> Self {
        Self {
            project: Some(project.to_string()),
            ..Self::everywhere()
        }
    }

    pub fn everywhere() -> Self {
        Self {
            project: None,
            include_global: true,
            active_only: false,
        }
    }
}

/// The kinds of record the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Observation,
    Summary,
    Prompt,
}

impl RecordKind {
    /// Document type used for vector metadata and rank fusion keys.
    pub fn doc_type(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Summary => "session_summary",
            Self::Prompt => "user_prompt",
        }
    }

    pub fn from_doc_type(doc_type: &str) -> Option<Self> {
        match doc_type {
            "observation" => Some(Self::Observation),
            "session_summary" => Some(Self::Summary),
            "user_prompt" => Some(Self::Prompt),
            _ => None,
        }
    }
}

/// Identity handed back from every store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub created_at_epoch: i64,
}

/// Rows removed by one eviction pass, delivered to the cleanup callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionEvent {
    pub kind: RecordKind,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: i64,
    pub session_key: String,
    pub project: String,
    pub user_prompt: Option<String>,
    pub status: SessionStatus,
    pub prompt_counter: i64,
    pub started_at: String,
    pub started_at_epoch: i64,
    pub completed_at: Option<String>,
    pub completed_at_epoch: Option<i64>,
}

/// A learned fact, as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub id: i64,
    pub session_key: String,
    pub project: String,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    /// Path → modification time (epoch millis) captured when the observation was made.
    pub file_mtimes: BTreeMap<String, i64>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub importance: f64,
    pub retrieval_count: i64,
    pub last_retrieved_at_epoch: Option<i64>,
    pub superseded: bool,
    pub created_at: String,
    pub created_at_epoch: i64,
}

/// A parsed observation ready to be stored.
#[derive(Debug, Clone, Deserialize)]
pub struct NewObservation {
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    /// Explicit scope. When absent, derived from `concepts`.
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub file_mtimes: BTreeMap<String, i64>,
    #[serde(default)]
    pub importance: Option<f64>,
}

impl NewObservation {
    pub fn new(observation_type: ObservationType) -> Self {
        Self {
            observation_type,
            scope: None,
            title: None,
            subtitle: None,
            narrative: None,
            facts: Vec::new(),
            concepts: Vec::new(),
            files_read: Vec::new(),
            files_modified: Vec::new(),
            file_mtimes: BTreeMap::new(),
            importance: None,
        }
    }

    /// The explicit scope, or the one implied by the concept list.
    pub fn resolved_scope(&self) -> Scope {
        self.scope
            .unwrap_or_else(|| Scope::from_concepts(&self.concepts))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: i64,
    pub session_key: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at: String,
    pub created_at_epoch: i64,
}

impl SessionSummary {
    /// Non-empty fields in display order, paired with their field names.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("request", &self.request),
            ("investigated", &self.investigated),
            ("learned", &self.learned),
            ("completed", &self.completed),
            ("next_steps", &self.next_steps),
            ("notes", &self.notes),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| (name, v))
        })
        .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSummary {
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub investigated: Option<String>,
    #[serde(default)]
    pub learned: Option<String>,
    #[serde(default)]
    pub completed: Option<String>,
    #[serde(default)]
    pub next_steps: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPrompt {
    pub id: i64,
    pub session_key: String,
    pub project: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub matched_observations: i64,
    pub created_at: String,
    pub created_at_epoch: i64,
    pub token_count: i64,
}
