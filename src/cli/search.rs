use anyhow::Result;

use crate::engine::MemoryEngine;
use crate::search::{Format, SearchParams, SearchStrategy, SearchType};

/// Run a search from the terminal and print one line per hit.
pub async fn search(
    engine: &MemoryEngine,
    query: Option<String>,
    project: Option<String>,
    search_type: SearchType,
    limit: Option<usize>,
    full: bool,
) -> Result<()> {
    let params = SearchParams {
        query,
        project,
        search_type,
        limit,
        format: if full { Format::Full } else { Format::Index },
        ..SearchParams::default()
    };
    let response = engine.search().search(params).await?;

    if response.results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    let strategy = match response.strategy {
        SearchStrategy::Vector => "semantic + keyword",
        SearchStrategy::Structured => "structured",
    };
    println!("Found {} result(s) ({strategy})\n", response.total);

    for (i, item) in response.results.iter().enumerate() {
        let score = item
            .score
            .map(|s| format!(" score: {s:.4}"))
            .unwrap_or_default();
        println!("  {}. [{} #{}] {}{score}", i + 1, item.kind, item.id, item.title);
        println!("     project: {}", item.project);
        if let Some(content) = &item.content {
            for line in content.lines() {
                println!("     {line}");
            }
        }
        println!();
    }

    Ok(())
}
