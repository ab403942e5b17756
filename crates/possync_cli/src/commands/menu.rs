//! Menu maintenance commands.
//!
//! All three work on a local snapshot. Cleanup and restore stage ordinary
//! dirty edits, which the device pushes on its next sync.

use possync_engine::{
    apply_menu_cleanup, export_menu, plan_menu_cleanup, restore_menu, MemoryLocalStore,
    MenuBackup,
};
use possync_protocol::{DeviceId, TenantId};
use std::path::Path;
use tracing::info;

fn open_snapshot(path: &Path) -> Result<MemoryLocalStore, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }
    Ok(MemoryLocalStore::open(path)?)
}

/// Deletes every category not named in `keep`, along with the menu items
/// that are not in a kept category.
pub fn clear(
    path: &Path,
    tenant: &str,
    device: &str,
    keep: &[String],
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let tenant = TenantId::new(tenant)?;
    let device = DeviceId::new(device)?;
    let store = open_snapshot(path)?;

    let plan = plan_menu_cleanup(&store, &tenant, keep)?;

    println!("Clearing menu of {}", tenant);
    println!("Keeping: {}", keep.join(", "));
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();
    println!("Kept categories:    {}", plan.kept_categories.join(", "));
    println!("Categories to delete: {}", plan.categories.len());
    for id in &plan.categories {
        println!("  {}", id);
    }
    println!("Menu items to delete: {}", plan.menu_items.len());
    for id in &plan.menu_items {
        println!("  {}", id);
    }

    if !dry_run && !plan.is_empty() {
        let deleted = apply_menu_cleanup(&store, &device, &tenant, &plan)?;
        store.flush()?;
        println!();
        println!("✓ Deleted {} records; they sync on the next pass", deleted);
    }
    Ok(())
}

/// Writes the live menu of a tenant to a JSON backup file.
pub fn export(path: &Path, tenant: &str, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let tenant = TenantId::new(tenant)?;
    let store = open_snapshot(path)?;

    info!("Exporting menu of {} from {:?}", tenant, path);
    let backup = export_menu(&store, &tenant)?;
    backup.write_json_file(output)?;

    println!("✓ Menu exported successfully");
    println!("  Path:       {:?}", output);
    println!("  Categories: {}", backup.categories.len());
    println!("  Menu items: {}", backup.menu_items.len());
    Ok(())
}

/// Stages the records of a JSON backup file into a snapshot.
///
/// The target snapshot is created if it does not exist yet.
pub fn restore(
    path: &Path,
    tenant: &str,
    device: &str,
    input: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let tenant = TenantId::new(tenant)?;
    let device = DeviceId::new(device)?;
    let backup = MenuBackup::from_json_file(input)?;
    let store = MemoryLocalStore::open(path)?;

    info!("Restoring menu of {} into {} at {:?}", backup.tenant, tenant, path);
    let report = restore_menu(&store, &device, &tenant, &backup)?;
    store.flush()?;

    println!("✓ Menu restored successfully");
    println!("  Categories: {}", report.categories);
    println!("  Menu items: {}", report.menu_items);
    println!("  Unchanged:  {}", report.unchanged);
    Ok(())
}
