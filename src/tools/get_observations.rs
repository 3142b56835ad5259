use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetObservationsParams {
    #[schemars(description = "Observation IDs to fetch, e.g. from a search result")]
    pub ids: Vec<i64>,

    #[schemars(description = "Ordering: 'default' (importance then recency), 'date_desc', 'date_asc', 'importance'")]
    pub order_by: Option<String>,

    #[schemars(description = "Maximum number of observations to return")]
    pub limit: Option<usize>,
}
