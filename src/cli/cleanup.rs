use anyhow::Result;

use crate::engine::MemoryEngine;
use crate::store::{RecordKind, RetentionScope};

/// Run every retention pass now: the project's observations, global observations
/// and prompts.
pub async fn cleanup(engine: &MemoryEngine, project: &str) -> Result<()> {
    let passes = [
        (RecordKind::Observation, RetentionScope::Project(project.to_string())),
        (RecordKind::Observation, RetentionScope::Global),
        (RecordKind::Prompt, RetentionScope::Global),
    ];

    let mut total = 0;
    for (kind, scope) in passes {
        let evicted = engine.store().cleanup(kind, scope.clone()).await?;
        tracing::info!(kind = ?kind, scope = ?scope, evicted = evicted.len(), "cleanup pass");
        println!("  {:<12} {:<24} evicted {}", kind.doc_type(), format!("{scope:?}"), evicted.len());
        total += evicted.len();
    }

    println!("Cleanup complete: {total} record(s) evicted.");
    Ok(())
}
