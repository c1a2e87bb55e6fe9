//! `waitline index` - entity index maintenance.

use clap::{Args, Subcommand};

use waitline_core::RootLayout;
use waitline_store::EntityIndex;

/// Arguments for `waitline index`.
#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Index operation.
    #[command(subcommand)]
    pub operation: IndexOperation,
}

/// Index operations.
#[derive(Debug, Subcommand)]
pub enum IndexOperation {
    /// Reconstruct the index from a full scan of the fact store.
    Rebuild,
    /// Print every index record.
    Show,
}

/// Runs the command.
///
/// # Errors
///
/// Returns lock contention or store failures.
pub fn execute(args: &IndexArgs, layout: &RootLayout) -> anyhow::Result<()> {
    match args.operation {
        IndexOperation::Rebuild => {
            let _lock = super::acquire_pipeline_lock(layout, "index-rebuild")?;
            let index = EntityIndex::open(&layout.entity_index_db())?;
            let entities = index.rebuild(layout)?;
            println!("index rebuilt: {entities} entities");
        }
        IndexOperation::Show => {
            let index = EntityIndex::open(&layout.entity_index_db())?;
            for record in index.all()? {
                println!(
                    "{}\tlatest={}\trows={}\tactual={}\tposted={}\tpriority={}\tmodeled={}",
                    record.entity_code,
                    record.latest_park_date,
                    record.row_count,
                    record.actual_count,
                    record.posted_count,
                    record.priority_count,
                    record.last_modeled_at.as_deref().unwrap_or("never"),
                );
            }
        }
    }
    Ok(())
}
