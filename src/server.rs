//! MCP server over stdio.

use crate::config::MementoConfig;
use crate::engine::MemoryEngine;
use crate::tools::MementoTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: MementoConfig) -> Result<()> {
    tracing::info!("starting memento MCP server on stdio");

    let engine = MemoryEngine::open(&config)?;
    let tools = MementoTools::new(engine.clone(), Arc::new(config));
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;

    // Let in-flight evictions finish their cleanup before exiting
    engine.shutdown().await;
    tracing::info!("MCP server shut down");

    Ok(())
}
