//! Integration tests for the sync engine against the in-memory stores.

use possync_engine::{
    apply_menu_cleanup, export_menu, plan_menu_cleanup, restore_menu, ApplyOutcome,
    ChangeTracker, ErrorKind, LocalStore, MemoryLocalStore, MemoryRemoteStore, RecordApplier,
    RemoteStore, RetryConfig, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncState,
};
use possync_protocol::{
    Category, Collection, DeviceId, DeviceRole, DeviceSession, DomainRecord, MenuItem, Order,
    OrderLine, RecordPayload, RemoteDocument, TenantId, Timestamp,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

type Engine = SyncEngine<MemoryLocalStore, MemoryRemoteStore>;

struct Device {
    engine: Engine,
    local: Arc<MemoryLocalStore>,
}

fn tenant() -> TenantId {
    TenantId::new("spice-route").unwrap()
}

fn device_id(name: &str) -> DeviceId {
    DeviceId::new(name).unwrap()
}

fn config(name: &str) -> SyncConfig {
    SyncConfig::new(device_id(name))
        .with_sync_interval(Duration::from_secs(3600))
        .with_heartbeat_interval(Duration::from_secs(3600))
        .with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(5))
                .without_jitter(),
        )
}

fn session(name: &str) -> DeviceSession {
    DeviceSession::new(device_id(name), tenant(), format!("staff-{name}"), DeviceRole::Server)
}

async fn connect_with(config: SyncConfig, remote: &Arc<MemoryRemoteStore>) -> Device {
    let name = config.device_id.to_string();
    let local = Arc::new(MemoryLocalStore::new());
    let listeners = config.collections.len() + 1;
    let engine = SyncEngine::new(config, Arc::clone(&local), Arc::clone(remote));
    engine.initialize().await.unwrap();

    let before = remote.subscriber_count();
    engine.connect_to_restaurant(tenant(), session(&name)).await.unwrap();
    // listeners subscribe from their own tasks
    eventually(|| remote.subscriber_count() >= before + listeners).await;
    Device { engine, local }
}

async fn connect(name: &str, remote: &Arc<MemoryRemoteStore>) -> Device {
    connect_with(config(name), remote).await
}

fn manual_remote() -> Arc<MemoryRemoteStore> {
    Arc::new(MemoryRemoteStore::with_manual_clock(Timestamp::from_millis(1_000)))
}

fn order(number: &str, status: &str) -> RecordPayload {
    RecordPayload::Order(Order {
        order_number: number.into(),
        status: status.into(),
        items: vec![OrderLine {
            menu_item_id: "paneer-tikka".into(),
            quantity: 1,
            price_cents: 1_250,
            notes: None,
        }],
        table_id: Some("t7".into()),
        created_by: None,
    })
}

fn order_doc(id: &str, status: &str, updated_at: i64, device: &str) -> RemoteDocument {
    let Value::Object(fields) = json!({
        "orderNumber": id.to_uppercase(),
        "status": status,
        "items": [{"menuItemId": "dal", "quantity": 2, "priceCents": 800}],
        "updatedAt": updated_at,
        "originDeviceId": device,
        "deviceSequence": 1,
        "deleted": false
    }) else {
        unreachable!()
    };
    RemoteDocument::new(id, fields)
}

fn get_order(device: &Device, id: &str) -> Option<DomainRecord> {
    device.local.get(&tenant(), Collection::Orders, id).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn newer_remote_order_replaces_local() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    let local_order = DomainRecord::new(
        "o1",
        order("O-1", "pending"),
        Timestamp::from_millis(100),
        device_id("till-a"),
        1,
    );
    device.local.compare_and_upsert(&t, None, local_order, true).unwrap();

    let remote_doc = order_doc("o1", "served", 150, "till-b");
    remote.seed(&t, Collection::Orders, remote_doc.clone());

    let report = device.engine.perform_smart_time_based_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.applied, 1);

    let expected = DomainRecord::from_document(Collection::Orders, &remote_doc).unwrap();
    assert_eq!(get_order(&device, "o1"), Some(expected));
    assert_eq!(device.local.dirty_count(&t).unwrap(), 0);
    assert!(device.local.checkpoint(&t, Collection::Orders).unwrap() >= Timestamp::from_millis(150));
    assert_eq!(device.engine.state(), SyncState::Idle);
}

#[tokio::test]
async fn comprehensive_sync_skips_incomplete_orders() {
    let remote = manual_remote();
    let t = tenant();
    for i in 0..76 {
        let mut doc = order_doc(&format!("o{i}"), "pending", 100 + i, "till-b");
        if i == 42 {
            doc.fields.remove("status");
        }
        remote.seed(&t, Collection::Orders, doc);
    }
    let device = connect("till-a", &remote).await;

    let report = device.engine.perform_comprehensive_timestamp_sync().await;
    assert!(report.is_success());
    assert_eq!(report.synced(), 75);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(device.local.query(&t, Collection::Orders, None).unwrap().len(), 75);
    assert!(get_order(&device, "o42").is_none());
}

#[tokio::test]
async fn manual_sync_is_idempotent() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();
    for i in 0..3 {
        device
            .engine
            .tracker()
            .stage_upsert(&t, format!("o{i}"), order(&format!("A-{i}"), "pending"))
            .unwrap();
    }

    let first = device.engine.manual_sync().await.unwrap();
    assert_eq!(first.pushed, 3);
    let after_first = device.local.query(&t, Collection::Orders, None).unwrap();

    let second = device.engine.manual_sync().await.unwrap();
    assert_eq!(second.pushed, 0);
    assert_eq!(second.applied, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(device.local.query(&t, Collection::Orders, None).unwrap(), after_first);
    assert_eq!(remote.document_count(&t, Collection::Orders), 3);
}

#[tokio::test]
async fn tombstone_removes_then_later_update_resurrects() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    remote.seed(&t, Collection::Orders, order_doc("o1", "pending", 100, "till-b"));
    device.engine.perform_smart_time_based_sync().await;
    assert!(!get_order(&device, "o1").unwrap().is_tombstone());

    let mut delete = order_doc("o1", "pending", 200, "till-b");
    delete.fields.insert("deleted".into(), Value::Bool(true));
    remote.seed(&t, Collection::Orders, delete);
    device.engine.perform_smart_time_based_sync().await;
    assert!(get_order(&device, "o1").unwrap().is_tombstone());

    remote.seed(&t, Collection::Orders, order_doc("o1", "reopened", 300, "till-c"));
    device.engine.perform_smart_time_based_sync().await;
    let revived = get_order(&device, "o1").unwrap();
    assert!(!revived.is_tombstone());
    assert_eq!(revived.updated_at, Timestamp::from_millis(300));
    assert!(matches!(revived.payload, Some(RecordPayload::Order(ref o)) if o.status == "reopened"));
}

#[tokio::test]
async fn checkpoint_never_decreases() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    remote.seed(&t, Collection::Orders, order_doc("o1", "pending", 150, "till-b"));
    device.engine.perform_smart_time_based_sync().await;
    let checkpoint = device.local.checkpoint(&t, Collection::Orders).unwrap();
    assert_eq!(checkpoint, Timestamp::from_millis(150));

    // a late write with an older timestamp
    remote.seed(&t, Collection::Orders, order_doc("o2", "pending", 120, "till-c"));
    device.engine.perform_comprehensive_timestamp_sync().await;
    device.engine.perform_smart_time_based_sync().await;

    assert!(get_order(&device, "o2").is_some());
    assert_eq!(device.local.checkpoint(&t, Collection::Orders).unwrap(), checkpoint);
}

#[tokio::test(start_paused = true)]
async fn last_sync_time_moves_with_empty_passes() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    let first = device.engine.perform_smart_time_based_sync().await;
    assert!(first.is_success());
    assert_eq!(first.pulled, 0);
    let synced = device.engine.last_sync_time().unwrap();
    assert!(synced >= Timestamp::from_millis(1_000));

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(device.engine.perform_smart_time_based_sync().await.is_success());

    let later = device.engine.status().last_sync_time.unwrap();
    assert!(later >= synced.saturating_add(Duration::from_secs(60)));
    assert_eq!(device.local.checkpoint(&t, Collection::Orders).unwrap(), Timestamp::ZERO);
}

#[tokio::test]
async fn two_devices_converge_through_listeners() {
    let remote = manual_remote();
    let a = connect("till-a", &remote).await;
    let b = connect("kds-b", &remote).await;
    let t = tenant();

    a.engine.tracker().stage_upsert(&t, "o1", order("A-1", "pending")).unwrap();
    a.engine.perform_smart_time_based_sync().await;
    eventually(|| get_order(&b, "o1").is_some()).await;

    remote.advance_clock(Duration::from_millis(10));
    b.engine.tracker().stage_upsert(&t, "o1", order("A-1", "preparing")).unwrap();
    b.engine.perform_smart_time_based_sync().await;
    eventually(|| get_order(&a, "o1") == get_order(&b, "o1")).await;

    let converged = get_order(&a, "o1").unwrap();
    assert!(matches!(converged.payload, Some(RecordPayload::Order(ref o)) if o.status == "preparing"));
    assert_eq!(converged.origin_device_id, Some(device_id("kds-b")));
    assert_eq!(a.local.dirty_count(&t).unwrap(), 0);
    assert_eq!(b.local.dirty_count(&t).unwrap(), 0);
}

#[tokio::test]
async fn echoed_push_keeps_edit_made_during_push() {
    let remote = manual_remote();
    let local = Arc::new(MemoryLocalStore::new());
    let tracker = ChangeTracker::new(Arc::clone(&local), Arc::clone(&remote), device_id("till-a"));
    let applier = RecordApplier::new(Arc::clone(&local));
    let t = tenant();
    let mut changes = remote.subscribe(&t, Collection::Orders).await.unwrap();

    let first = tracker.stage_upsert(&t, "o1", order("A-1", "pending")).unwrap();
    let server_ts = remote.put(&t, Collection::Orders, first.to_document()).await.unwrap();
    let second = tracker.stage_upsert(&t, "o1", order("A-1", "served")).unwrap();

    // the echo is applied before the push is recorded
    let echo = changes.recv().await.unwrap();
    let echoed = DomainRecord::from_document(Collection::Orders, &echo.document).unwrap();
    assert_eq!(applier.apply_incoming(&t, &echoed).unwrap(), ApplyOutcome::Stale);
    applier.mark_pushed(&t, &first, server_ts).unwrap();

    let stored = local.get(&t, Collection::Orders, "o1").unwrap().unwrap();
    assert_eq!(stored.sequence, second.sequence);
    assert!(stored.updated_at > server_ts);
    assert!(matches!(stored.payload, Some(RecordPayload::Order(ref o)) if o.status == "served"));
    assert!(local.is_dirty(&t, Collection::Orders, "o1").unwrap());
    assert_eq!(tracker.pending_count(&t).unwrap(), 1);
}

#[tokio::test]
async fn listener_turns_remote_delete_into_tombstone() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    remote.seed(&t, Collection::Orders, order_doc("o1", "pending", 100, "till-b"));
    device.engine.perform_smart_time_based_sync().await;

    remote.delete(&t, Collection::Orders, "o1").await.unwrap();
    eventually(|| get_order(&device, "o1").is_some_and(|r| r.is_tombstone())).await;
    assert_eq!(get_order(&device, "o1").unwrap().updated_at, Timestamp::from_millis(100));
}

#[tokio::test]
async fn active_devices_exclude_silent_devices() {
    let remote = Arc::new(MemoryRemoteStore::new());

    // a device that heartbeats once and then goes silent
    let ghost = possync_engine::PresenceRegistry::new(
        Arc::clone(&remote),
        tenant(),
        Duration::from_secs(60),
    );
    ghost.heartbeat(&mut session("ghost")).await.unwrap();

    let device = connect_with(
        config("till-a").with_heartbeat_interval(Duration::from_millis(50)),
        &remote,
    )
    .await;
    assert!(device.engine.active_devices().contains(&device_id("ghost")));

    // ttl is 150ms of server time; our own heartbeats move the clock on
    eventually(|| device.engine.active_devices() == vec![device_id("till-a")]).await;
    let mut watcher = device.engine.subscribe_active_devices().unwrap();
    assert_eq!(*watcher.borrow_and_update(), vec![device_id("till-a")]);
}

#[tokio::test]
async fn offline_edits_are_pushed_after_reconnect() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    remote.set_connected(false);
    device.engine.tracker().stage_upsert(&t, "o1", order("A-1", "pending")).unwrap();

    let report = device.engine.perform_smart_time_based_sync().await;
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(ErrorKind::Connectivity));
    assert_eq!(device.engine.state(), SyncState::Error);
    assert!(device.engine.needs_sync());
    assert_eq!(device.engine.status().pending_change_count, 1);

    remote.set_connected(true);
    let report = device.engine.perform_smart_time_based_sync().await;
    assert!(report.is_success());
    assert_eq!(report.pushed, 1);
    assert_eq!(device.engine.state(), SyncState::Idle);
    assert_eq!(device.engine.status().pending_change_count, 0);
    assert!(remote.document(&t, Collection::Orders, "o1").is_some());
}

#[tokio::test]
async fn manual_sync_gives_up_after_retries() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    remote.set_connected(false);

    let err = device.engine.manual_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Connectivity(_)));
    assert_eq!(device.engine.stats().retries, 1);
}

#[tokio::test]
async fn expired_auth_pauses_until_initialize() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let mut events = device.engine.subscribe_events();

    remote.set_auth_expired(true);
    let report = device.engine.perform_smart_time_based_sync().await;
    assert_eq!(report.failure.map(|f| f.kind), Some(ErrorKind::AuthExpired));

    let mut reauth = false;
    while let Ok(event) = events.try_recv() {
        reauth |= matches!(event, SyncEvent::ReauthenticationRequired);
    }
    assert!(reauth);

    // still paused even though the remote would accept again
    remote.set_auth_expired(false);
    let report = device.engine.perform_smart_time_based_sync().await;
    assert_eq!(report.failure.map(|f| f.kind), Some(ErrorKind::AuthExpired));
    assert!(device.engine.status().paused);

    device.engine.initialize().await.unwrap();
    assert_eq!(device.engine.state(), SyncState::Disconnected);
    assert!(!device.engine.status().paused);
}

#[tokio::test]
async fn local_store_failure_is_fatal() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;

    device.local.set_corrupted(true);
    let report = device.engine.perform_smart_time_based_sync().await;
    assert_eq!(report.failure.map(|f| f.kind), Some(ErrorKind::Fatal));
    assert_eq!(device.engine.state(), SyncState::Error);

    device.local.set_corrupted(false);
    let report = device.engine.perform_smart_time_based_sync().await;
    assert_eq!(report.failure.map(|f| f.kind), Some(ErrorKind::Fatal));

    device.engine.initialize().await.unwrap();
    device
        .engine
        .connect_to_restaurant(tenant(), session("till-a"))
        .await
        .unwrap();
    assert!(device.engine.perform_smart_time_based_sync().await.is_success());
}

#[tokio::test]
async fn disconnect_stops_tasks_and_removes_presence() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    assert!(device.engine.is_connected());
    assert_eq!(remote.document_count(&t, Collection::ActiveDevices), 1);
    assert_eq!(remote.subscriber_count(), Collection::DOMAIN.len() + 1);

    device.engine.disconnect().await.unwrap();
    assert_eq!(device.engine.state(), SyncState::Disconnected);
    assert!(!device.engine.is_connected());
    assert_eq!(remote.document_count(&t, Collection::ActiveDevices), 0);
    assert_eq!(remote.subscriber_count(), 0);
    assert!(device.engine.active_devices().is_empty());
}

#[tokio::test]
async fn misuse_is_rejected() {
    let remote = manual_remote();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = SyncEngine::new(config("till-a"), local, Arc::clone(&remote));
    engine.initialize().await.unwrap();

    assert!(matches!(engine.manual_sync().await, Err(SyncError::NotConnected)));
    assert!(matches!(
        engine.connect_to_restaurant(tenant(), session("someone-else")).await,
        Err(SyncError::InvalidSession(_))
    ));

    engine.connect_to_restaurant(tenant(), session("till-a")).await.unwrap();
    assert!(matches!(
        engine.connect_to_restaurant(tenant(), session("till-a")).await,
        Err(SyncError::InvalidStateTransition { .. })
    ));
    assert!(matches!(engine.reset().await, Err(SyncError::InvalidStateTransition { .. })));
}

#[tokio::test]
async fn startup_falls_back_to_manual_only_on_failures() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();

    let clean = device.engine.run_startup_sequence().await;
    assert!(clean.manual.is_none());

    remote.reject_writes_to("o-bad");
    device.engine.tracker().stage_upsert(&t, "o-bad", order("X-1", "pending")).unwrap();
    let startup = device.engine.run_startup_sequence().await;
    assert_eq!(startup.smart.failed, 1);
    let manual = startup.manual.unwrap();
    assert_eq!(manual.failed, 1);
    assert_eq!(device.local.dirty_count(&t).unwrap(), 1);
}

#[tokio::test]
async fn reaper_purges_old_tombstones_everywhere() {
    let remote = manual_remote();
    let device = connect("till-a", &remote).await;
    let t = tenant();
    let tracker = device.engine.tracker();

    tracker.stage_upsert(&t, "o1", order("A-1", "void")).unwrap();
    device.engine.perform_smart_time_based_sync().await;
    tracker.stage_delete(&t, Collection::Orders, "o1").unwrap();
    device.engine.perform_smart_time_based_sync().await;
    assert!(remote.document(&t, Collection::Orders, "o1").unwrap().is_deleted());

    // nothing is old enough yet
    assert!(device.engine.reap_tombstones().await.unwrap().purged.is_empty());

    remote.advance_clock(Duration::from_secs(31 * 24 * 60 * 60));
    tracker.stage_upsert(&t, "o2", order("A-2", "pending")).unwrap();
    device.engine.perform_smart_time_based_sync().await;

    let report = device.engine.reap_tombstones().await.unwrap();
    assert_eq!(report.purged.len(), 1);
    assert!(remote.document(&t, Collection::Orders, "o1").is_none());
    tokio::task::yield_now().await;
    assert!(get_order(&device, "o1").is_none());
    assert!(get_order(&device, "o2").is_some());
}

#[tokio::test]
async fn menu_cleanup_and_restore_reach_other_devices() {
    let remote = manual_remote();
    let a = connect("till-a", &remote).await;
    let b = connect("kds-b", &remote).await;
    let t = tenant();
    let tracker = a.engine.tracker();

    for (id, name) in [("cat-snacks", "Snacks"), ("cat-mains", "Main Course")] {
        let category = Category {
            name: name.into(),
            sort_order: 0,
            is_active: true,
            description: None,
            color: None,
        };
        tracker.stage_upsert(&t, id, RecordPayload::Category(category)).unwrap();
    }
    for (id, category_id) in [("pakora", "cat-snacks"), ("biryani", "cat-mains")] {
        let item = MenuItem {
            name: id.into(),
            category_id: category_id.into(),
            price_cents: 950,
            is_available: true,
            description: None,
        };
        tracker.stage_upsert(&t, id, RecordPayload::MenuItem(item)).unwrap();
    }
    a.engine.perform_smart_time_based_sync().await;
    let menu_item = |id: &str| b.local.get(&t, Collection::MenuItems, id).unwrap();
    eventually(|| menu_item("biryani").is_some()).await;

    let backup = export_menu(a.local.as_ref(), &t).unwrap();
    let plan = plan_menu_cleanup(a.local.as_ref(), &t, &["Snacks".to_string()]).unwrap();
    assert_eq!(plan.menu_items, vec!["biryani".to_string()]);
    apply_menu_cleanup(a.local.as_ref(), &device_id("till-a"), &t, &plan).unwrap();

    remote.advance_clock(Duration::from_millis(10));
    a.engine.perform_smart_time_based_sync().await;
    assert!(remote.document(&t, Collection::Categories, "cat-mains").unwrap().is_deleted());
    eventually(|| menu_item("biryani").is_some_and(|r| r.is_tombstone())).await;
    assert!(!menu_item("pakora").unwrap().is_tombstone());

    remote.advance_clock(Duration::from_millis(10));
    let report = restore_menu(a.local.as_ref(), &device_id("till-a"), &t, &backup).unwrap();
    assert_eq!(report.categories + report.menu_items, 2);
    a.engine.perform_smart_time_based_sync().await;
    eventually(|| menu_item("biryani").is_some_and(|r| !r.is_tombstone())).await;
    assert_eq!(a.local.dirty_count(&t).unwrap(), 0);
}
