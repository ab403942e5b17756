//! Menu maintenance: cleanup, export and restore.
//!
//! Every change made here is staged in the local store as an ordinary
//! dirty edit, so it reaches the remote store and the other devices on the
//! next sync pass like any edit made at the till.
//!
//! ## Backup Format
//!
//! A backup is a JSON document holding the live categories and menu items
//! of one tenant:
//!
//! ```text
//! { "version": 1, "tenant": "...", "exportedAt": 1724640000000,
//!   "categories": [{ "id": "...", "name": "...", ... }],
//!   "menuItems": [{ "id": "...", "categoryId": "...", ... }] }
//! ```

use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::tracker::{stage_delete, stage_upsert};
use possync_protocol::{
    Category, Collection, DeviceId, MenuItem, RecordPayload, TenantId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Current backup format version.
pub const MENU_BACKUP_VERSION: u32 = 1;

/// One record of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry<T> {
    /// Record id.
    pub id: String,
    /// Record fields.
    #[serde(flatten)]
    pub data: T,
}

/// A point-in-time copy of a tenant's menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuBackup {
    /// Format version.
    pub version: u32,
    /// Tenant the menu was exported from.
    pub tenant: TenantId,
    /// Newest record timestamp at export time.
    pub exported_at: Timestamp,
    /// Categories, ordered by id.
    pub categories: Vec<MenuEntry<Category>>,
    /// Menu items, ordered by id.
    pub menu_items: Vec<MenuEntry<MenuItem>>,
}

impl MenuBackup {
    /// Reads a backup file.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Backup(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Parses a backup from JSON text.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let backup: Self =
            serde_json::from_str(text).map_err(|e| SyncError::Backup(e.to_string()))?;
        if backup.version != MENU_BACKUP_VERSION {
            return Err(SyncError::Backup(format!(
                "unsupported backup version {}",
                backup.version
            )));
        }
        Ok(backup)
    }

    /// Writes the backup as pretty-printed JSON.
    pub fn write_json_file(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let path = path.as_ref();
        let text =
            serde_json::to_string_pretty(self).map_err(|e| SyncError::Backup(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| SyncError::Backup(format!("{}: {e}", path.display())))
    }
}

/// Records selected by a menu cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MenuCleanup {
    /// Names of the categories that stay.
    pub kept_categories: Vec<String>,
    /// Ids of the categories to delete.
    pub categories: Vec<String>,
    /// Ids of the menu items to delete.
    pub menu_items: Vec<String>,
}

impl MenuCleanup {
    /// Returns true if nothing would be deleted.
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.menu_items.is_empty()
    }
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Categories written.
    pub categories: usize,
    /// Menu items written.
    pub menu_items: usize,
    /// Records already identical locally.
    pub unchanged: usize,
}

/// Selects every category whose name is not in `keep`, and every menu item
/// that does not belong to a kept category.
///
/// Items pointing at a missing or deleted category are selected too.
pub fn plan_menu_cleanup<L: LocalStore + ?Sized>(
    local: &L,
    tenant: &TenantId,
    keep: &[String],
) -> SyncResult<MenuCleanup> {
    let mut plan = MenuCleanup::default();
    let mut kept_ids = HashSet::new();

    for (id, category) in live_categories(local, tenant)? {
        if keep.contains(&category.name) {
            kept_ids.insert(id);
            plan.kept_categories.push(category.name);
        } else {
            plan.categories.push(id);
        }
    }
    plan.menu_items = live_menu_items(local, tenant)?
        .into_iter()
        .filter(|(_, item)| !kept_ids.contains(&item.category_id))
        .map(|(id, _)| id)
        .collect();
    Ok(plan)
}

/// Stages deletes for the records of `plan`, menu items first.
///
/// Returns the number of records deleted.
pub fn apply_menu_cleanup<L: LocalStore + ?Sized>(
    local: &L,
    device_id: &DeviceId,
    tenant: &TenantId,
    plan: &MenuCleanup,
) -> SyncResult<usize> {
    let mut deleted = 0;
    for id in &plan.menu_items {
        if stage_delete(local, device_id, tenant, Collection::MenuItems, id)?.is_some() {
            deleted += 1;
        }
    }
    for id in &plan.categories {
        if stage_delete(local, device_id, tenant, Collection::Categories, id)?.is_some() {
            deleted += 1;
        }
    }
    info!(%tenant, deleted, kept = plan.kept_categories.len(), "cleared menu");
    Ok(deleted)
}

/// Copies the live categories and menu items of a tenant.
pub fn export_menu<L: LocalStore + ?Sized>(local: &L, tenant: &TenantId) -> SyncResult<MenuBackup> {
    let exported_at = [Collection::Categories, Collection::MenuItems]
        .into_iter()
        .map(|c| local.query(tenant, c, None))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .map(|r| r.updated_at)
        .max()
        .unwrap_or(Timestamp::ZERO);

    let categories: Vec<_> = live_categories(local, tenant)?
        .into_iter()
        .map(|(id, data)| MenuEntry { id, data })
        .collect();
    let menu_items: Vec<_> = live_menu_items(local, tenant)?
        .into_iter()
        .map(|(id, data)| MenuEntry { id, data })
        .collect();

    debug!(%tenant, categories = categories.len(), menu_items = menu_items.len(), "exported menu");
    Ok(MenuBackup {
        version: MENU_BACKUP_VERSION,
        tenant: tenant.clone(),
        exported_at,
        categories,
        menu_items,
    })
}

/// Stages every record of `backup` into `tenant`, categories first.
///
/// Records whose live local copy already matches are left alone. Deleted
/// records are brought back as new versions.
pub fn restore_menu<L: LocalStore + ?Sized>(
    local: &L,
    device_id: &DeviceId,
    tenant: &TenantId,
    backup: &MenuBackup,
) -> SyncResult<RestoreReport> {
    let mut report = RestoreReport::default();

    for entry in &backup.categories {
        let payload = RecordPayload::Category(entry.data.clone());
        if restore_one(local, device_id, tenant, &entry.id, payload)? {
            report.categories += 1;
        } else {
            report.unchanged += 1;
        }
    }

    let known: HashSet<&str> = backup.categories.iter().map(|c| c.id.as_str()).collect();
    for entry in &backup.menu_items {
        if !known.contains(entry.data.category_id.as_str()) {
            warn!(id = %entry.id, category = %entry.data.category_id, "restoring menu item of unknown category");
        }
        let payload = RecordPayload::MenuItem(entry.data.clone());
        if restore_one(local, device_id, tenant, &entry.id, payload)? {
            report.menu_items += 1;
        } else {
            report.unchanged += 1;
        }
    }

    info!(
        %tenant,
        categories = report.categories,
        menu_items = report.menu_items,
        unchanged = report.unchanged,
        "restored menu"
    );
    Ok(report)
}

fn restore_one<L: LocalStore + ?Sized>(
    local: &L,
    device_id: &DeviceId,
    tenant: &TenantId,
    id: &str,
    payload: RecordPayload,
) -> SyncResult<bool> {
    let current = local.get(tenant, payload.collection(), id)?;
    if current.is_some_and(|r| !r.is_tombstone() && r.payload.as_ref() == Some(&payload)) {
        return Ok(false);
    }
    stage_upsert(local, device_id, tenant, id.to_string(), payload)?;
    Ok(true)
}

fn live_categories<L: LocalStore + ?Sized>(
    local: &L,
    tenant: &TenantId,
) -> SyncResult<Vec<(String, Category)>> {
    let mut categories: Vec<_> = local
        .query(tenant, Collection::Categories, None)?
        .into_iter()
        .filter(|r| !r.is_tombstone())
        .filter_map(|r| match r.payload {
            Some(RecordPayload::Category(category)) => Some((r.id, category)),
            _ => None,
        })
        .collect();
    categories.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(categories)
}

fn live_menu_items<L: LocalStore + ?Sized>(
    local: &L,
    tenant: &TenantId,
) -> SyncResult<Vec<(String, MenuItem)>> {
    let mut items: Vec<_> = local
        .query(tenant, Collection::MenuItems, None)?
        .into_iter()
        .filter(|r| !r.is_tombstone())
        .filter_map(|r| match r.payload {
            Some(RecordPayload::MenuItem(item)) => Some((r.id, item)),
            _ => None,
        })
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(items)
}
