use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Error;
use crate::store::{NewObservation, ObservationType, Scope};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StoreObservationParams {
    #[schemars(description = "Session the observation was made in. The session is created if it does not exist.")]
    pub session_key: String,

    #[schemars(description = "Project the observation belongs to. Defaults to the configured default project.")]
    pub project: Option<String>,

    #[schemars(description = "Observation type: 'decision', 'bugfix', 'feature', 'refactor', 'discovery', 'change'")]
    pub r#type: String,

    #[schemars(description = "'project' or 'global'. Derived from concepts when omitted.")]
    pub scope: Option<String>,

    #[schemars(description = "Short title")]
    pub title: Option<String>,

    #[schemars(description = "One-line elaboration of the title")]
    pub subtitle: Option<String>,

    #[schemars(description = "Full description of what was learned")]
    pub narrative: Option<String>,

    #[schemars(description = "Discrete facts, each indexed separately")]
    pub facts: Option<Vec<String>>,

    #[schemars(description = "Concept tags such as 'architecture' or 'security'")]
    pub concepts: Option<Vec<String>>,

    #[schemars(description = "Files read while making the observation")]
    pub files_read: Option<Vec<String>>,

    #[schemars(description = "Files modified while making the observation")]
    pub files_modified: Option<Vec<String>>,

    #[schemars(description = "Prompt number within the session")]
    pub prompt_number: Option<i64>,

    #[schemars(description = "Tokens spent discovering this observation")]
    pub discovery_tokens: Option<i64>,

    #[schemars(description = "Importance weight used for ordering. Defaults to 1.0.")]
    pub importance: Option<f64>,

    #[schemars(description = "Skip the write if a near-duplicate was stored recently. Defaults to true.")]
    pub deduplicate: Option<bool>,
}

impl StoreObservationParams {
    /// Validate and convert into a store input. File mtimes are captured from disk.
    pub fn to_new_observation(&self) -> Result<NewObservation, Error> {
        if self.session_key.trim().is_empty() {
            return Err(Error::Empty("session_key"));
        }
        let observation_type: ObservationType = self.r#type.parse()?;
        let scope = self.scope.as_deref().map(str::parse::<Scope>).transpose()?;

        let facts = self.facts.clone().unwrap_or_default();
        let has_content = [&self.title, &self.subtitle, &self.narrative]
            .iter()
            .any(|t| t.as_deref().is_some_and(|t| !t.trim().is_empty()))
            || facts.iter().any(|f| !f.trim().is_empty());
        if !has_content {
            return Err(Error::Empty("observation content"));
        }

        let files_read = self.files_read.clone().unwrap_or_default();
        let files_modified = self.files_modified.clone().unwrap_or_default();
        let file_mtimes: BTreeMap<String, i64> = files_read
            .iter()
            .chain(&files_modified)
            .filter_map(|path| {
                crate::store::observations::current_mtime_millis(std::path::Path::new(path)).map(|m| (path.clone(), m))
            })
            .collect();

        Ok(NewObservation {
            observation_type,
            scope,
            title: self.title.clone(),
            subtitle: self.subtitle.clone(),
            narrative: self.narrative.clone(),
            facts,
            concepts: self.concepts.clone().unwrap_or_default(),
            files_read,
            files_modified,
            file_mtimes,
            importance: self.importance,
        })
    }
}
