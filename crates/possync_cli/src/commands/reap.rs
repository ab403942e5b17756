//! Reap command implementation.
//!
//! Works on the local snapshot only. Remote copies of the purged
//! tombstones are removed by a connected engine's reaper.

use possync_engine::{expired_tombstones, purge_local, MemoryLocalStore};
use possync_protocol::{Collection, TenantId, Timestamp};
use std::path::Path;
use std::time::Duration;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Runs the reap command.
pub fn run(
    path: &Path,
    tenant: &str,
    retention_days: u64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }
    let tenant = TenantId::new(tenant)?;
    let store = MemoryLocalStore::open(path)?;

    let retention = Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY));
    let expired = expired_tombstones(
        &store,
        &tenant,
        &Collection::DOMAIN,
        Timestamp::now(),
        retention,
    )?;

    println!("Reaping tombstones of {} older than {} days", tenant, retention_days);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    for tombstone in &expired {
        println!(
            "  {:<14} {:<24} deleted at {}",
            tombstone.collection.as_str(),
            tombstone.id,
            tombstone.deleted_at.as_millis()
        );
    }
    println!();
    println!("Expired tombstones: {}", expired.len());

    if !dry_run && !expired.is_empty() {
        purge_local(&store, &tenant, &expired)?;
        store.flush()?;
        println!("✓ Purged {} tombstones", expired.len());
    }
    Ok(())
}
