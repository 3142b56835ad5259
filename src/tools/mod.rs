pub mod get_observations;
pub mod search;
pub mod store_observation;

use get_observations::GetObservationsParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use search::SearchToolParams;
use serde::Serialize;
use std::sync::Arc;
use store_observation::StoreObservationParams;

use crate::config::MementoConfig;
use crate::engine::MemoryEngine;
use crate::search::SearchResponse;
use crate::store::{Observation, OrderBy};

/// The memento MCP tool handler. Holds the engine and config and exposes all
/// MCP tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct MementoTools {
    tool_router: ToolRouter<Self>,
    engine: MemoryEngine,
    config: Arc<MementoConfig>,
}

#[derive(Serialize)]
struct ObservationView {
    #[serde(flatten)]
    observation: Observation,
    /// Files changed on disk since the observation was recorded.
    stale_files: Vec<String>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

fn respond(result: anyhow::Result<SearchResponse>) -> Result<String, String> {
    let response = result.map_err(|e| format!("search failed: {e}"))?;
    to_json(&response)
}

#[tool_router]
impl MementoTools {
    pub fn new(engine: MemoryEngine, config: Arc<MementoConfig>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
            config,
        }
    }

    #[tool(description = "Search observations, session summaries and prompts. Uses semantic + keyword search when a query is given, otherwise lists recent records.")]
    async fn search(
        &self,
        Parameters(params): Parameters<SearchToolParams>,
    ) -> Result<String, String> {
        let params = params.into_search_params()?;
        tracing::info!(query = ?params.query, project = ?params.project, "search called");
        respond(self.engine.search().search(params).await)
    }

    #[tool(description = "Search for past decisions, their rationale and the alternatives considered.")]
    async fn decisions(
        &self,
        Parameters(params): Parameters<SearchToolParams>,
    ) -> Result<String, String> {
        let params = params.into_search_params()?;
        tracing::info!(query = ?params.query, "decisions called");
        respond(self.engine.search().decisions(params).await)
    }

    #[tool(description = "Search for recent changes: what was modified, added, removed or refactored.")]
    async fn changes(
        &self,
        Parameters(params): Parameters<SearchToolParams>,
    ) -> Result<String, String> {
        let params = params.into_search_params()?;
        tracing::info!(query = ?params.query, "changes called");
        respond(self.engine.search().changes(params).await)
    }

    #[tool(description = "Search for explanations of how a component or mechanism works.")]
    async fn how_it_works(
        &self,
        Parameters(params): Parameters<SearchToolParams>,
    ) -> Result<String, String> {
        let params = params.into_search_params()?;
        tracing::info!(query = ?params.query, "how_it_works called");
        respond(self.engine.search().how_it_works(params).await)
    }

    #[tool(description = "Fetch full observations by ID, including which of their files changed on disk since.")]
    async fn get_observations(
        &self,
        Parameters(params): Parameters<GetObservationsParams>,
    ) -> Result<String, String> {
        let order_by: OrderBy = params
            .order_by
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e: crate::error::Error| e.to_string())?;
        tracing::info!(count = params.ids.len(), "get_observations called");

        let observations = self
            .engine
            .store()
            .get_observations(params.ids, order_by, params.limit)
            .await
            .map_err(|e| format!("fetch failed: {e}"))?;

        let views: Vec<ObservationView> = observations
            .into_iter()
            .map(|observation| ObservationView {
                stale_files: crate::store::observations::stale_files(&observation),
                observation,
            })
            .collect();
        to_json(&views)
    }

    #[tool(description = "Store an observation: a decision, bugfix, feature, refactor, discovery or change learned during a session.")]
    async fn store_observation(
        &self,
        Parameters(params): Parameters<StoreObservationParams>,
    ) -> Result<String, String> {
        let obs = params.to_new_observation().map_err(|e| e.to_string())?;
        let project = params
            .project
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.config.storage.default_project.clone());
        let prompt_number = params.prompt_number;
        let tokens = params.discovery_tokens.unwrap_or(0);

        tracing::info!(
            session = %params.session_key,
            project = %project,
            observation_type = %obs.observation_type,
            "store_observation called"
        );

        let result = if params.deduplicate.unwrap_or(true) {
            self.engine
                .record_observation_deduplicated(&params.session_key, &project, obs, prompt_number, tokens)
                .await
        } else {
            self.engine
                .record_observation(&params.session_key, &project, obs, prompt_number, tokens)
                .await
                .map(Some)
        };
        let stored = result.map_err(|e| format!("store failed: {e}"))?;

        match stored {
            Some(record) => {
                tracing::info!(id = record.id, "observation stored");
                to_json(&serde_json::json!({
                    "id": record.id,
                    "created_at_epoch": record.created_at_epoch,
                    "deduplicated": false,
                }))
            }
            None => to_json(&serde_json::json!({ "deduplicated": true })),
        }
    }
}

#[tool_handler]
impl ServerHandler for MementoTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "memento is a long-term memory store for coding sessions. Use search (or the \
                 decisions, changes and how_it_works presets) to find past observations, \
                 get_observations to read them in full, and store_observation to record new ones."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
