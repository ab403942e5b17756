//! Simulate command implementation.
//!
//! Starts several devices of one restaurant, each with its own local
//! store, all sharing one in-memory backend. Every device creates orders
//! while it has not synced yet, then all devices sync and the command
//! checks that their local stores converged.

use possync_engine::{
    LocalStore, MemoryLocalStore, MemoryRemoteStore, SyncConfig, SyncEngine, SyncReport,
    SyncStatus,
};
use possync_protocol::{
    Collection, DeviceId, DeviceRole, DeviceSession, Order, OrderLine, RecordPayload, TenantId,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

type Engine = SyncEngine<MemoryLocalStore, MemoryRemoteStore>;

/// Simulation parameters.
#[derive(Debug)]
pub struct Options {
    /// Number of devices.
    pub devices: usize,
    /// Orders created on each device before syncing.
    pub orders: usize,
    /// Tenant id.
    pub tenant: String,
    /// Optional configuration file.
    pub config: Option<PathBuf>,
    /// Optional directory for per-device snapshots.
    pub snapshot_dir: Option<PathBuf>,
}

/// Outcome for one device.
#[derive(Debug, Serialize)]
pub struct DeviceResult {
    /// Device id.
    pub device: DeviceId,
    /// Manual sync report.
    pub manual: SyncReport,
    /// Follow-up smart sync report.
    pub smart: SyncReport,
    /// Status after syncing.
    pub status: SyncStatus,
    /// Live orders in the local store.
    pub orders: usize,
    /// Devices this device sees as active.
    pub active_devices: Vec<DeviceId>,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    /// Tenant id.
    pub tenant: TenantId,
    /// Orders stored in the backend.
    pub remote_orders: usize,
    /// Per-device outcomes.
    pub devices: Vec<DeviceResult>,
    /// All local stores hold the same orders.
    pub converged: bool,
}

/// Runs the simulate command.
pub async fn run(options: Options, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if options.devices == 0 {
        return Err("At least one device is required".into());
    }
    let base = match &options.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    let tenant = TenantId::new(options.tenant.clone())?;
    let remote = Arc::new(MemoryRemoteStore::new());

    let mut devices: Vec<(Engine, Arc<MemoryLocalStore>)> = Vec::with_capacity(options.devices);
    for n in 1..=options.devices {
        let device_id = DeviceId::new(format!("device-{n}"))?;
        let local = Arc::new(match &options.snapshot_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                MemoryLocalStore::open(dir.join(format!("{device_id}.cbor")))?
            }
            None => MemoryLocalStore::new(),
        });

        let mut config = base.clone();
        config.device_id = device_id.clone();
        let engine = SyncEngine::new(config, Arc::clone(&local), Arc::clone(&remote));
        engine.initialize().await?;

        // Orders taken before the device ever connects
        for i in 1..=options.orders {
            engine
                .tracker()
                .stage_upsert(&tenant, format!("{device_id}-o{i}"), sample_order(n, i))?;
        }

        let session = DeviceSession::new(
            device_id,
            tenant.clone(),
            format!("staff-{n}"),
            DeviceRole::Server,
        );
        engine.connect_to_restaurant(tenant.clone(), session).await?;
        devices.push((engine, local));
    }

    let mut manual_reports = Vec::with_capacity(devices.len());
    for (engine, _) in &devices {
        manual_reports.push(engine.manual_sync().await?);
    }

    let mut result = SimulationResult {
        tenant: tenant.clone(),
        remote_orders: remote.document_count(&tenant, Collection::Orders),
        devices: Vec::with_capacity(devices.len()),
        converged: true,
    };

    let mut reference = None;
    for ((engine, local), manual) in devices.iter().zip(manual_reports) {
        // picks up whatever the listeners have not delivered yet
        let smart = engine.perform_smart_time_based_sync().await;
        let orders = local.query(&tenant, Collection::Orders, None)?;
        match &reference {
            None => reference = Some(orders.clone()),
            Some(expected) => result.converged &= *expected == orders,
        }
        result.devices.push(DeviceResult {
            device: engine.config().device_id.clone(),
            manual,
            smart,
            status: engine.status(),
            orders: orders.iter().filter(|r| !r.is_tombstone()).count(),
            active_devices: engine.active_devices(),
        });
    }

    for (engine, local) in &devices {
        engine.disconnect().await?;
        if local.path().is_some() {
            local.flush()?;
        }
    }
    info!(converged = result.converged, "simulation finished");

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn sample_order(device: usize, i: usize) -> RecordPayload {
    RecordPayload::Order(Order {
        order_number: format!("D{device}-{i:04}"),
        status: "pending".into(),
        items: vec![OrderLine {
            menu_item_id: format!("item-{}", i % 7 + 1),
            quantity: (i % 3 + 1) as u32,
            price_cents: 450 + (i as i64 % 5) * 100,
            notes: None,
        }],
        table_id: Some(format!("table-{}", i % 12 + 1)),
        created_by: Some(format!("staff-{device}")),
    })
}

fn print_text_output(result: &SimulationResult) {
    println!("possync Simulation");
    println!("==================");
    println!();
    println!("Tenant:        {}", result.tenant);
    println!("Remote orders: {}", result.remote_orders);
    println!();

    for device in &result.devices {
        println!("{}:", device.device);
        println!(
            "  manual: pushed {}, synced {}, failed {}",
            device.manual.pushed,
            device.manual.synced(),
            device.manual.failed
        );
        println!(
            "  smart:  pushed {}, synced {}, failed {}",
            device.smart.pushed,
            device.smart.synced(),
            device.smart.failed
        );
        println!("  state:  {}", device.status.state);
        println!("  pending changes: {}", device.status.pending_change_count);
        println!("  local orders:    {}", device.orders);
        println!("  active devices:  {}", device.active_devices.len());
    }

    println!();
    if result.converged {
        println!("✓ All devices converged");
    } else {
        println!("✗ Devices diverged");
    }
}
