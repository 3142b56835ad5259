//! Transactional keep-newest-N eviction.
//!
//! The keep-set and the delete run inside one `IMMEDIATE` transaction: the write
//! lock is taken before the keep-set is read, so an insert from another
//! connection either lands before the pass (and is counted) or waits until it
//! commits. A row can never be evicted by a keep-set computed without it.
//!
//! A pass that runs past its deadline rolls back instead of committing, so a
//! timed-out pass deletes nothing and never reaches the cleanup callback.

use anyhow::{bail, Result};
use rusqlite::{Connection, ToSql, TransactionBehavior};
use std::time::Instant;

/// Delete every row of `table` matching `filter` except the newest `keep` by
/// `created_at_epoch` (ties broken by id). Returns the deleted IDs, oldest first.
///
/// `filter` is a trusted SQL fragment; its placeholders bind to `params`.
pub(crate) fn evict_beyond(
    conn: &mut Connection,
    table: &str,
    filter: &str,
    params: &[&dyn ToSql],
    keep: usize,
    deadline: Option<Instant>,
) -> Result<Vec<i64>> {
    check_deadline(deadline)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let keep_set = format!(
        "SELECT id FROM {table} WHERE {filter} \
         ORDER BY created_at_epoch DESC, id DESC LIMIT {keep}"
    );

    let evicted: Vec<i64> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT id FROM {table} WHERE {filter} AND id NOT IN ({keep_set}) \
             ORDER BY created_at_epoch ASC, id ASC"
        ))?;
        let collected = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    if !evicted.is_empty() {
        tx.execute(
            &format!("DELETE FROM {table} WHERE {filter} AND id NOT IN ({keep_set})"),
            params,
        )?;
    }

    // Dropping the transaction rolls the delete back.
    check_deadline(deadline)?;
    tx.commit()?;
    Ok(evicted)
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => bail!("eviction deadline passed"),
        _ => Ok(()),
    }
}
