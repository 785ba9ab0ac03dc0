use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use pkgsweep::{ItemStatus, ProgressState};
use pkgsweep_store::ProgressStore;

use crate::config::FileConfig;

#[derive(Debug, Default, Args)]
pub struct StatusArgs {
    /// Ledger file (defaults to the configured output directory's progress.json)
    #[arg(long)]
    ledger: Option<PathBuf>,
}

/// Failed entries of one kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct KindCount {
    total: u64,
    retryable: u64,
}

pub fn run(args: StatusArgs, file: &FileConfig) -> Result<()> {
    let path = args
        .ledger
        .or_else(|| file.batch.ledger_path.clone())
        .or_else(|| file.batch.output_dir.as_ref().map(|dir| dir.join("progress.json")))
        .context("no ledger to read: pass --ledger or set batch.output_dir")?;

    let store = ProgressStore::new(&path);
    let Some(state) = store
        .read()
        .with_context(|| format!("failed to read ledger at {}", path.display()))?
    else {
        println!("No ledger at {}", path.display());
        return Ok(());
    };

    let counters = state.counters();
    println!("Ledger {}", path.display());
    println!("  entries    {}", counters.total());
    println!("  succeeded  {}", counters.succeeded);
    println!("  failed     {}", counters.failed);
    println!("  skipped    {}", counters.skipped);
    if counters.pending > 0 {
        println!("  pending    {} (interrupted mid-item)", counters.pending);
    }
    if let Some(cursor) = state.cursor() {
        println!("  cursor     page {}, item {}", cursor.page, cursor.index + 1);
    }

    let kinds = failure_breakdown(&state);
    if !kinds.is_empty() {
        println!("\nFailures by kind");
        for (kind, count) in &kinds {
            println!("  {kind:<20} {:>6}  ({} retryable)", count.total, count.retryable);
        }
    }
    Ok(())
}

fn failure_breakdown(state: &ProgressState) -> BTreeMap<&'static str, KindCount> {
    let mut kinds: BTreeMap<&'static str, KindCount> = BTreeMap::new();
    for (_, entry) in state.entries() {
        if entry.status != ItemStatus::Failed {
            continue;
        }
        if let Some(failure) = &entry.failure {
            let count = kinds.entry(failure.kind.as_str()).or_default();
            count.total += 1;
            if failure.retryable {
                count.retryable += 1;
            }
        }
    }
    kinds
}
