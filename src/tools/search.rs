//! Parameters shared by `search` and the preset tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::search::{Format, SearchParams, SearchType};
use crate::store::OrderBy;

/// Parameters for `search`, `decisions`, `changes` and `how_it_works`.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SearchToolParams {
    #[schemars(description = "Natural language query. Omit to list the most recent records.")]
    pub query: Option<String>,

    #[schemars(description = "Record types to search: 'all' (default), 'observations', 'sessions', 'prompts'. Ignored by presets.")]
    pub r#type: Option<String>,

    #[schemars(description = "Project to search. Omit to search every project.")]
    pub project: Option<String>,

    #[schemars(description = "'index' (default, titles only) or 'full' (content and metadata)")]
    pub format: Option<String>,

    #[schemars(description = "Ordering for fetched records: 'default', 'date_desc', 'date_asc', 'importance'")]
    pub order_by: Option<String>,

    #[schemars(description = "Maximum number of results (1-100). Defaults to 20.")]
    pub limit: Option<usize>,

    #[schemars(description = "Include global-scope observations from other projects. Defaults to true.")]
    pub include_global: Option<bool>,

    #[schemars(description = "Drop observations that have been superseded. Defaults to false.")]
    pub exclude_superseded: Option<bool>,
}

impl SearchToolParams {
    pub fn into_search_params(self) -> Result<SearchParams, String> {
        let format: Format = self
            .format
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e: crate::error::Error| e.to_string())?;
        let search_type: SearchType = self
            .r#type
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e: crate::error::Error| e.to_string())?;
        let order_by: OrderBy = self
            .order_by
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e: crate::error::Error| e.to_string())?;

        Ok(SearchParams {
            format,
            search_type,
            project: self.project.filter(|p| !p.trim().is_empty()),
            query: self.query,
            order_by,
            limit: self.limit,
            include_global: self.include_global.unwrap_or(true),
            exclude_superseded: self.exclude_superseded.unwrap_or(false),
        })
    }
}
