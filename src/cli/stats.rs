use anyhow::Result;

use crate::engine::MemoryEngine;

/// Print record counts for a project and the state of the vector index.
pub async fn stats(engine: &MemoryEngine, project: &str) -> Result<()> {
    let stats = engine.store().stats(project).await?;
    let quotas = engine.store().config();

    println!("Memory Statistics ({})", stats.project);
    println!("{}", "=".repeat(40));
    println!(
        "  Observations:        {} / {}",
        stats.observations, quotas.max_observations_per_project
    );
    println!(
        "  Global observations: {} / {}",
        stats.global_observations, quotas.max_global_observations
    );
    println!("  Session summaries:   {}", stats.summaries);
    println!("  Prompts (all):       {} / {}", stats.prompts, quotas.max_prompts);
    println!();

    match engine.index_status().await? {
        None => println!("Vector index:          disabled"),
        Some(status) => {
            let documents = match engine.vectors() {
                Some(index) => index.count()?,
                None => 0,
            };
            println!("Vector documents:      {documents}");
            if status.needed {
                println!("Index status:          needs rebuild ({})", status.reason);
            } else {
                println!("Index status:          up to date");
            }
        }
    }

    Ok(())
}
