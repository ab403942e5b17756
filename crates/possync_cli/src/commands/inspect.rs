//! Inspect command implementation.

use possync_engine::{MemoryLocalStore, TenantSummary};
use serde::Serialize;
use std::path::Path;

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Snapshot size in bytes.
    pub size: u64,
    /// Per-tenant summaries.
    pub tenants: Vec<TenantSummary>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }

    let store = MemoryLocalStore::open(path)?;
    let result = InspectResult {
        path: path.display().to_string(),
        size: std::fs::metadata(path)?.len(),
        tenants: store.summary(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("possync Snapshot Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {} bytes", result.size);

    if result.tenants.is_empty() {
        println!();
        println!("No tenants.");
        return;
    }

    for tenant in &result.tenants {
        println!();
        println!("Tenant {} (last sequence {})", tenant.tenant, tenant.last_sequence);
        println!(
            "  {:<14} {:>8} {:>11} {:>6} {:>16}",
            "collection", "records", "tombstones", "dirty", "checkpoint"
        );
        for c in &tenant.collections {
            println!(
                "  {:<14} {:>8} {:>11} {:>6} {:>16}",
                c.collection.as_str(),
                c.records,
                c.tombstones,
                c.dirty,
                c.checkpoint.as_millis()
            );
        }
    }
}
