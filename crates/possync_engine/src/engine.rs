//! The sync engine.
//!
//! A [`SyncEngine`] owns one tenant session at a time. While connected it
//! runs one listener task per watched collection, a periodic smart-sync
//! task that also reaps tombstones, and the presence heartbeat task.
//! Explicit passes are serialized through an async gate.

use crate::applier::{ApplyOutcome, RecordApplier};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::presence::{next_change, PresenceRegistry};
use crate::reaper::{self, ReapReport};
use crate::state::{
    StartupReport, SyncEvent, SyncFailure, SyncReport, SyncState, SyncStats, SyncStatus,
    SyncStrategy,
};
use crate::store::{LocalStore, RemoteError, RemoteStore, StoreError};
use crate::tracker::{ChangeTracker, RemoteDelta};
use parking_lot::{Mutex, RwLock};
use possync_protocol::{
    fields, ChangeKind, Collection, DeviceId, DeviceSession, DomainRecord, RemoteChange, TenantId,
    Timestamp,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

struct Control {
    state: SyncState,
    auth_paused: bool,
    fatal: bool,
    last_attempt_failed: bool,
    last_sync: Option<Timestamp>,
}

struct Session<R> {
    tenant: TenantId,
    device: DeviceId,
    presence: Arc<PresenceRegistry<R>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner<L, R> {
    config: SyncConfig,
    local: Arc<L>,
    remote: Arc<R>,
    tracker: ChangeTracker<L, R>,
    applier: RecordApplier<L>,
    control: RwLock<Control>,
    stats: RwLock<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
    session: Mutex<Option<Session<R>>>,
    pass_gate: tokio::sync::Mutex<()>,
    cancelled: AtomicBool,
    server_time: AtomicI64,
}

/// Keeps a device's local store in sync with the shared remote store.
pub struct SyncEngine<L: LocalStore, R: RemoteStore> {
    inner: Arc<Inner<L, R>>,
}

impl<L: LocalStore, R: RemoteStore> SyncEngine<L, R> {
    /// Creates a disconnected engine.
    pub fn new(config: SyncConfig, local: Arc<L>, remote: Arc<R>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tracker = ChangeTracker::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            config.device_id.clone(),
        );
        let applier = RecordApplier::new(Arc::clone(&local));
        Self {
            inner: Arc::new(Inner {
                config,
                local,
                remote,
                tracker,
                applier,
                control: RwLock::new(Control {
                    state: SyncState::Disconnected,
                    auth_paused: false,
                    fatal: false,
                    last_attempt_failed: false,
                    last_sync: None,
                }),
                stats: RwLock::new(SyncStats::default()),
                events,
                session: Mutex::new(None),
                pass_gate: tokio::sync::Mutex::new(()),
                cancelled: AtomicBool::new(false),
                server_time: AtomicI64::new(0),
            }),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The change tracker, for staging local edits.
    pub fn tracker(&self) -> &ChangeTracker<L, R> {
        &self.inner.tracker
    }

    /// The local store.
    pub fn local(&self) -> &Arc<L> {
        &self.inner.local
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.inner.state()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// The tenant of the open session.
    pub fn tenant(&self) -> Option<TenantId> {
        self.inner.tenant()
    }

    /// Verifies the local store and clears fatal and auth-paused flags.
    ///
    /// An open session is disconnected first. Leaves the engine
    /// `Disconnected`.
    pub async fn initialize(&self) -> SyncResult<()> {
        self.inner.config.validate()?;
        if self.inner.session.lock().is_some() {
            self.disconnect().await?;
        }

        if let Err(err) = self.inner.local.verify() {
            self.inner.control.write().fatal = true;
            error!(error = %err, "local store failed verification");
            return Err(err.into());
        }

        {
            let mut control = self.inner.control.write();
            control.fatal = false;
            control.auth_paused = false;
            control.last_attempt_failed = false;
        }
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.inner.transition(SyncState::Disconnected)?;
        info!(device = %self.inner.config.device_id, "sync engine initialized");
        Ok(())
    }

    /// Opens a session for `tenant` and starts the background tasks.
    ///
    /// An unreachable remote store does not fail the connect; listeners
    /// keep resubscribing and the periodic task keeps retrying.
    pub async fn connect_to_restaurant(
        &self,
        tenant: TenantId,
        mut session: DeviceSession,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        if session.tenant_id != tenant {
            return Err(SyncError::InvalidSession(format!(
                "session belongs to {}, not {tenant}",
                session.tenant_id
            )));
        }
        if session.device_id != inner.config.device_id {
            return Err(SyncError::InvalidSession(format!(
                "session device {} is not this device",
                session.device_id
            )));
        }
        inner.check_not_paused()?;
        if inner.session.lock().is_some() {
            return Err(SyncError::InvalidStateTransition {
                from: inner.state().to_string(),
                to: SyncState::Connecting.to_string(),
            });
        }

        inner.transition(SyncState::Connecting)?;
        inner.control.write().last_sync = None;
        inner.cancelled.store(false, Ordering::SeqCst);
        info!(%tenant, device = %session.device_id, "connecting");

        let presence = Arc::new(
            PresenceRegistry::new(
                Arc::clone(&inner.remote),
                tenant.clone(),
                inner.config.heartbeat_ttl(),
            )
            .with_events(inner.events.clone()),
        );

        match presence.heartbeat(&mut session).await {
            Ok(ts) => {
                inner.note_server_time(ts);
                if let Err(err) = presence.refresh().await {
                    debug!(error = %err, "initial presence refresh failed");
                }
            }
            Err(err @ SyncError::AuthExpired) => {
                inner.record_failure(None, &err);
                let _ = inner.transition(SyncState::Error);
                return Err(err);
            }
            Err(err) => warn!(error = %err, "first heartbeat failed, continuing offline"),
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(inner.config.collections.len() + 2);
        for &collection in &inner.config.collections {
            tasks.push(tokio::spawn(run_listener(
                Arc::clone(inner),
                tenant.clone(),
                collection,
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_periodic(Arc::clone(inner), shutdown_rx.clone())));
        tasks.push(tokio::spawn(Arc::clone(&presence).run(
            session.clone(),
            inner.config.heartbeat_interval,
            shutdown_rx,
        )));

        *inner.session.lock() = Some(Session {
            tenant: tenant.clone(),
            device: session.device_id.clone(),
            presence,
            shutdown,
            tasks,
        });
        inner.transition(SyncState::Idle)?;
        info!(%tenant, "connected");
        Ok(())
    }

    /// Stops the background tasks and removes this device's presence entry.
    ///
    /// Tasks stop between records. If the presence entry cannot be removed
    /// it expires by TTL.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let session = inner.session.lock().take();
        let Some(session) = session else {
            return inner.transition(SyncState::Disconnected);
        };

        inner.cancelled.store(true, Ordering::SeqCst);
        let _ = session.shutdown.send(true);
        for task in session.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
        // wait for an in-flight explicit pass to observe the cancellation
        drop(inner.pass_gate.lock().await);

        if let Err(err) = session.presence.unregister(&session.device).await {
            warn!(error = %err, "could not remove presence entry, it will expire");
        }

        inner.transition(SyncState::Disconnected)?;
        info!(tenant = %session.tenant, "disconnected");
        Ok(())
    }

    /// Leaves the `Error` state by disconnecting.
    pub async fn reset(&self) -> SyncResult<()> {
        let state = self.state();
        if state != SyncState::Error {
            return Err(SyncError::InvalidStateTransition {
                from: state.to_string(),
                to: SyncState::Disconnected.to_string(),
            });
        }
        self.disconnect().await
    }

    /// Returns true if a session is open and healthy.
    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
            && matches!(self.state(), SyncState::Idle | SyncState::Syncing)
    }

    /// Returns true if a sync pass is due.
    pub fn needs_sync(&self) -> bool {
        self.inner.needs_sync()
    }

    /// Pulls remote deltas since each checkpoint and pushes dirty records.
    pub async fn perform_smart_time_based_sync(&self) -> SyncReport {
        self.inner.smart_sync().await
    }

    /// Pulls every document of every watched collection.
    pub async fn perform_comprehensive_timestamp_sync(&self) -> SyncReport {
        self.inner.comprehensive_sync().await
    }

    /// Pushes every dirty record, then pulls everything, retrying on
    /// connectivity errors.
    pub async fn manual_sync(&self) -> SyncResult<SyncReport> {
        self.inner.manual_sync().await
    }

    /// Runs the sync passes expected after connecting.
    ///
    /// Comprehensive first, then smart. A manual sync runs only if either
    /// reported failures.
    pub async fn run_startup_sequence(&self) -> StartupReport {
        let comprehensive = self.perform_comprehensive_timestamp_sync().await;
        let smart = self.perform_smart_time_based_sync().await;
        let manual = if comprehensive.has_failures() || smart.has_failures() {
            info!("startup passes reported failures, falling back to manual sync");
            Some(match self.manual_sync().await {
                Ok(report) => report,
                Err(err) => SyncReport::aborted(SyncStrategy::Manual, &err),
            })
        } else {
            None
        };
        StartupReport {
            comprehensive,
            smart,
            manual,
        }
    }

    /// Purges expired tombstones locally and remotely.
    pub async fn reap_tombstones(&self) -> SyncResult<ReapReport> {
        self.inner.reap_tombstones().await
    }

    /// Devices of the tenant that are currently active.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.presence.active_devices())
            .unwrap_or_default()
    }

    /// Receives the active devices whenever they change, while connected.
    pub fn subscribe_active_devices(&self) -> Option<watch::Receiver<Vec<DeviceId>>> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.presence.subscribe())
    }

    /// Receives engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Server time at which the last successful pass of this session
    /// finished, or the newest pulled record if none has finished yet.
    pub fn last_sync_time(&self) -> Option<Timestamp> {
        self.inner.last_sync_time()
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        let inner = &self.inner;
        let pending_change_count = inner
            .tenant()
            .and_then(|t| inner.local.dirty_count(&t).ok())
            .unwrap_or(0);
        let last_sync_time = inner.last_sync_time();
        let control = inner.control.read();
        SyncStatus {
            state: control.state,
            last_sync_time,
            pending_change_count,
            paused: control.auth_paused || control.fatal,
        }
    }
}

impl<L: LocalStore, R: RemoteStore> Inner<L, R> {
    fn state(&self) -> SyncState {
        self.control.read().state
    }

    fn tenant(&self) -> Option<TenantId> {
        self.session.lock().as_ref().map(|s| s.tenant.clone())
    }

    fn transition(&self, to: SyncState) -> SyncResult<()> {
        let from = {
            let mut control = self.control.write();
            let from = control.state;
            if from == to {
                return Ok(());
            }
            from.check_transition(to)?;
            control.state = to;
            from
        };
        debug!(%from, %to, "sync state changed");
        let _ = self.events.send(SyncEvent::StateChanged { from, to });
        Ok(())
    }

    /// Transitions only if the current state is one of `from`.
    fn transition_from(&self, from: &[SyncState], to: SyncState) {
        let previous = {
            let mut control = self.control.write();
            let previous = control.state;
            if previous == to || !from.contains(&previous) {
                return;
            }
            control.state = to;
            previous
        };
        debug!(from = %previous, %to, "sync state changed");
        let _ = self.events.send(SyncEvent::StateChanged { from: previous, to });
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn check_not_paused(&self) -> SyncResult<()> {
        let control = self.control.read();
        if control.fatal {
            return Err(SyncError::Fatal(StoreError::Corrupted(
                "engine needs initialize() after a local store failure".into(),
            )));
        }
        if control.auth_paused {
            return Err(SyncError::AuthExpired);
        }
        Ok(())
    }

    fn is_paused(&self) -> bool {
        let control = self.control.read();
        control.fatal || control.auth_paused
    }

    fn note_server_time(&self, ts: Timestamp) {
        self.server_time.fetch_max(ts.as_millis(), Ordering::SeqCst);
    }

    fn server_time(&self) -> Timestamp {
        let observed = Timestamp::from_millis(self.server_time.load(Ordering::SeqCst));
        let presence = self
            .session
            .lock()
            .as_ref()
            .map_or(Timestamp::ZERO, |s| s.presence.server_time());
        observed.max(presence)
    }

    fn last_sync_time(&self) -> Option<Timestamp> {
        let tenant = self.tenant()?;
        if let Some(synced_at) = self.control.read().last_sync {
            return Some(synced_at);
        }
        self.config
            .collections
            .iter()
            .filter_map(|&c| self.local.checkpoint(&tenant, c).ok())
            .filter(Timestamp::is_valid)
            .max()
    }

    fn needs_sync(&self) -> bool {
        if self.control.read().last_attempt_failed {
            return true;
        }
        let stale = self
            .stats
            .read()
            .last_success
            .map_or(true, |at| at.elapsed() >= self.config.stale_after);
        if stale {
            return true;
        }
        match self.tenant() {
            Some(tenant) => self.local.dirty_count(&tenant).map_or(true, |n| n > 0),
            None => false,
        }
    }

    fn begin_pass(&self) -> SyncResult<TenantId> {
        self.check_not_paused()?;
        let tenant = self.tenant().ok_or(SyncError::NotConnected)?;
        self.check_cancelled()?;
        self.transition(SyncState::Syncing)?;
        Ok(tenant)
    }

    fn conclude(
        &self,
        started: Instant,
        mut report: SyncReport,
        result: &SyncResult<()>,
    ) -> SyncReport {
        report.finish(started);
        match result {
            Ok(()) => {
                {
                    let mut stats = self.stats.write();
                    stats.passes_completed += 1;
                    stats.records_pulled += report.pulled as u64;
                    stats.records_pushed += report.pushed as u64;
                    stats.stale_records += report.stale as u64;
                    stats.last_success = Some(Instant::now());
                    stats.last_error = None;
                }
                let synced_at = self.server_time();
                {
                    let mut control = self.control.write();
                    control.last_attempt_failed = false;
                    if synced_at.is_valid() {
                        control.last_sync = control.last_sync.max(Some(synced_at));
                    }
                }
                self.transition_from(&[SyncState::Syncing], SyncState::Idle);
                info!(
                    strategy = %report.strategy,
                    pulled = report.pulled,
                    applied = report.applied,
                    pushed = report.pushed,
                    skipped = report.skipped,
                    failed = report.failed,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync pass completed"
                );
                let _ = self.events.send(SyncEvent::SyncCompleted(report.clone()));
            }
            Err(err) => {
                report.failure = Some(SyncFailure::from(err));
                self.record_failure(Some(report.strategy), err);
            }
        }
        report
    }

    /// Classifies a failure, updates flags and state, and publishes it.
    fn record_failure(&self, strategy: Option<SyncStrategy>, err: &SyncError) {
        if matches!(err, SyncError::Cancelled) {
            debug!("sync cancelled");
            return;
        }

        {
            let mut control = self.control.write();
            control.last_attempt_failed = true;
            match err.kind() {
                ErrorKind::AuthExpired => control.auth_paused = true,
                ErrorKind::Fatal => control.fatal = true,
                _ => {}
            }
        }
        {
            let mut stats = self.stats.write();
            if strategy.is_some() {
                stats.passes_failed += 1;
            }
            stats.last_error = Some(err.to_string());
        }

        match err.kind() {
            ErrorKind::Fatal => error!(error = %err, "local store failure, sync stopped"),
            ErrorKind::AuthExpired => {
                warn!("authentication expired, sync paused");
                let _ = self.events.send(SyncEvent::ReauthenticationRequired);
            }
            _ => warn!(strategy = ?strategy, error = %err, "sync failed"),
        }

        self.transition_from(&[SyncState::Idle, SyncState::Syncing], SyncState::Error);
        let _ = self.events.send(SyncEvent::SyncFailed {
            strategy,
            failure: SyncFailure::from(err),
        });
    }

    async fn smart_sync(&self) -> SyncReport {
        let strategy = SyncStrategy::SmartTimeBased;
        let _gate = self.pass_gate.lock().await;
        let started = Instant::now();
        let tenant = match self.begin_pass() {
            Ok(tenant) => tenant,
            Err(err) => return SyncReport::aborted(strategy, &err),
        };

        let mut report = SyncReport::new(strategy);
        let result = self.smart_pass(&tenant, &mut report).await;
        self.conclude(started, report, &result)
    }

    async fn smart_pass(&self, tenant: &TenantId, report: &mut SyncReport) -> SyncResult<()> {
        for &collection in &self.config.collections {
            self.check_cancelled()?;
            let since = self.tracker.checkpoint(tenant, collection)?.last_synced_at;
            let delta = self
                .tracker
                .compute_remote_delta(tenant, collection, Some(since))
                .await?;
            self.apply_delta(tenant, collection, delta, report)?;
            self.push_dirty(tenant, collection, report).await?;
        }
        self.fill_checkpoints(tenant, report)
    }

    async fn comprehensive_sync(&self) -> SyncReport {
        let strategy = SyncStrategy::Comprehensive;
        let _gate = self.pass_gate.lock().await;
        let started = Instant::now();
        let tenant = match self.begin_pass() {
            Ok(tenant) => tenant,
            Err(err) => return SyncReport::aborted(strategy, &err),
        };

        let mut report = SyncReport::new(strategy);
        let result = self.full_pull(&tenant, &mut report).await;
        self.conclude(started, report, &result)
    }

    async fn full_pull(&self, tenant: &TenantId, report: &mut SyncReport) -> SyncResult<()> {
        for &collection in &self.config.collections {
            self.check_cancelled()?;
            let delta = self
                .tracker
                .compute_remote_delta(tenant, collection, None)
                .await?;
            self.apply_delta(tenant, collection, delta, report)?;
        }
        self.fill_checkpoints(tenant, report)
    }

    async fn manual_sync(&self) -> SyncResult<SyncReport> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            match self.manual_attempt().await {
                Ok(report) => return Ok(report),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    self.stats.write().retries += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "manual sync failed, retrying"
                    );
                    time::sleep(delay).await;
                    self.check_cancelled()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn manual_attempt(&self) -> SyncResult<SyncReport> {
        let _gate = self.pass_gate.lock().await;
        let started = Instant::now();
        let tenant = self.begin_pass()?;

        let mut report = SyncReport::new(SyncStrategy::Manual);
        let result = self.manual_pass(&tenant, &mut report).await;
        let report = self.conclude(started, report, &result);
        result.map(|()| report)
    }

    async fn manual_pass(&self, tenant: &TenantId, report: &mut SyncReport) -> SyncResult<()> {
        for &collection in &self.config.collections {
            self.check_cancelled()?;
            self.push_dirty(tenant, collection, report).await?;
        }
        self.full_pull(tenant, report).await
    }

    fn apply_delta(
        &self,
        tenant: &TenantId,
        collection: Collection,
        delta: RemoteDelta,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        report.pulled += delta.pulled();
        report.skipped += delta.skipped.len();
        report.failed += delta.failed.len();

        let mut newest: Option<Timestamp> = None;
        for record in &delta.records {
            self.check_cancelled()?;
            match self.applier.apply_incoming(tenant, record) {
                Ok(outcome) => {
                    match outcome {
                        ApplyOutcome::Applied | ApplyOutcome::RemoteDefault => report.applied += 1,
                        ApplyOutcome::Unchanged => report.unchanged += 1,
                        ApplyOutcome::Stale => report.stale += 1,
                    }
                    if record.updated_at.is_valid() {
                        newest = newest.max(Some(record.updated_at));
                    }
                }
                Err(err @ SyncError::Fatal(_)) => return Err(err),
                Err(err) => {
                    warn!(%collection, id = %record.id, error = %err, "failed to apply record");
                    report.failed += 1;
                }
            }
        }

        if let Some(newest) = newest {
            self.tracker.advance_checkpoint(tenant, collection, newest)?;
            self.note_server_time(newest);
        }
        Ok(())
    }

    async fn push_dirty(
        &self,
        tenant: &TenantId,
        collection: Collection,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        for record in self.tracker.compute_local_delta(tenant, collection)? {
            self.check_cancelled()?;
            match self.remote.put(tenant, collection, record.to_document()).await {
                Ok(ts) => {
                    self.applier.mark_pushed(tenant, &record, ts)?;
                    self.note_server_time(ts);
                    report.pushed += 1;
                }
                Err(RemoteError::Rejected { id, reason }) => {
                    warn!(%collection, %id, %reason, "push rejected, keeping record dirty");
                    report.failed += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn fill_checkpoints(&self, tenant: &TenantId, report: &mut SyncReport) -> SyncResult<()> {
        report.checkpoints.clear();
        for &collection in &self.config.collections {
            let checkpoint = self.local.checkpoint(tenant, collection)?;
            report.checkpoints.push((collection, checkpoint));
        }
        Ok(())
    }

    /// Applies one listener event.
    fn apply_change(&self, tenant: &TenantId, collection: Collection, change: &RemoteChange) {
        let converted = match change.kind {
            ChangeKind::Removed if change.document.is_deleted() => {
                debug!(%collection, id = %change.document.id, "tombstone purged remotely");
                return;
            }
            ChangeKind::Removed => {
                // a removed document becomes a tombstone at its last timestamp
                let mut doc = change.document.clone();
                doc.fields.insert(fields::DELETED.into(), Value::Bool(true));
                DomainRecord::from_document(collection, &doc)
            }
            ChangeKind::Added | ChangeKind::Modified => {
                DomainRecord::from_document(collection, &change.document)
            }
        };

        let record = match converted {
            Ok(record) => record,
            Err(err) if err.is_skippable() => {
                debug!(%collection, id = %change.document.id, error = %err, "listener skipped document");
                return;
            }
            Err(err) => {
                warn!(%collection, id = %change.document.id, error = %err, "listener could not convert document");
                return;
            }
        };

        match self.applier.apply_incoming(tenant, &record) {
            Ok(ApplyOutcome::Applied | ApplyOutcome::RemoteDefault) => {
                if record.updated_at.is_valid() {
                    self.note_server_time(record.updated_at);
                }
                self.stats.write().listener_applied += 1;
                let _ = self.events.send(SyncEvent::RecordChanged {
                    collection,
                    id: record.id,
                    deleted: record.deleted,
                });
            }
            Ok(ApplyOutcome::Unchanged | ApplyOutcome::Stale) => {}
            Err(err) => self.record_failure(None, &err),
        }
    }

    async fn reap_tombstones(&self) -> SyncResult<ReapReport> {
        let _gate = self.pass_gate.lock().await;
        let tenant = self.tenant().ok_or(SyncError::NotConnected)?;
        let now = self.server_time();
        if !now.is_valid() {
            debug!("no server time observed yet, skipping tombstone reap");
            return Ok(ReapReport::default());
        }
        reaper::reap(
            self.local.as_ref(),
            self.remote.as_ref(),
            &tenant,
            &self.config.collections,
            now,
            self.config.tombstone_retention,
        )
        .await
    }
}

async fn run_listener<L: LocalStore, R: RemoteStore>(
    inner: Arc<Inner<L, R>>,
    tenant: TenantId,
    collection: Collection,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;
    while !*shutdown.borrow() {
        match inner.remote.subscribe(&tenant, collection).await {
            Ok(stream) => {
                debug!(%collection, "listener subscribed");
                attempt = 0;
                let mut stream = Some(stream);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        change = next_change(&mut stream) => match change {
                            Some(change) => inner.apply_change(&tenant, collection, &change),
                            None => {
                                debug!(%collection, "listener stream ended");
                                break;
                            }
                        },
                    }
                }
            }
            Err(err) => {
                let err = SyncError::from(err);
                inner.record_failure(None, &err);
                if matches!(err, SyncError::AuthExpired) {
                    // nothing to do until the session is torn down
                    let _ = shutdown.changed().await;
                    return;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = inner
            .config
            .retry
            .delay_for_attempt(attempt)
            .max(inner.config.resubscribe_delay);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = time::sleep(delay) => {}
        }
    }
}

async fn run_periodic<L: LocalStore, R: RemoteStore>(
    inner: Arc<Inner<L, R>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    let mut last_reap: Option<Instant> = None;

    loop {
        let delay = if failures == 0 {
            inner.config.sync_interval
        } else {
            inner.config.retry.delay_for_attempt(failures).max(Duration::from_millis(1))
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(delay) => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if inner.is_paused() {
            continue;
        }

        if inner.needs_sync() {
            let report = inner.smart_sync().await;
            match &report.failure {
                None => failures = 0,
                Some(failure) if failure.kind == ErrorKind::Connectivity => {
                    failures = failures.saturating_add(1);
                }
                Some(_) => {}
            }
        }

        if last_reap.map_or(true, |at| at.elapsed() >= inner.config.reaper_interval) {
            last_reap = Some(Instant::now());
            if let Err(err) = inner.reap_tombstones().await {
                warn!(error = %err, "tombstone reap failed");
            }
        }
    }
    debug!("periodic sync stopped");
}
