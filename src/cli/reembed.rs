//! CLI `reembed` command: refresh vectors written by an older embedding model.

use anyhow::Result;

use crate::engine::MemoryEngine;

pub async fn reembed(engine: &MemoryEngine) -> Result<()> {
    let Some(index) = engine.vectors() else {
        println!("Embeddings are disabled (embedding.provider = \"none\"); nothing to do.");
        return Ok(());
    };

    let stale = index.stale_vectors()?;
    if stale.is_empty() {
        println!("All vectors match model '{}'.", index.model_version());
        return Ok(());
    }

    println!(
        "Re-embedding {} stale document(s) with model '{}'...",
        stale.len(),
        index.model_version()
    );
    let updated = engine.reembed_stale().await?;
    println!("Re-embedded {updated} document(s).");
    Ok(())
}
