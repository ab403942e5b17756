//! Device presence registry.
//!
//! Every connected device writes a heartbeat document to the
//! `active_devices` collection. A device is active while its last
//! heartbeat is younger than the heartbeat TTL, measured against an
//! estimate of server time: the latest server timestamp this device has
//! observed plus the monotonic time elapsed since. Devices never compare
//! server timestamps with their own wall clock, and silent devices still
//! expire while this device is offline.

use crate::error::{SyncError, SyncResult};
use crate::state::{SyncEvent, SyncFailure};
use crate::store::{ChangeStream, RemoteStore};
use parking_lot::Mutex;
use possync_protocol::{
    ChangeKind, Collection, DeviceId, DeviceSession, RemoteChange, RemoteDocument, TenantId,
    Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

struct Registry {
    sessions: HashMap<DeviceId, DeviceSession>,
    server_time: Timestamp,
    observed_at: time::Instant,
}

impl Registry {
    fn now(&self) -> Timestamp {
        if self.server_time.is_valid() {
            self.server_time.saturating_add(self.observed_at.elapsed())
        } else {
            Timestamp::ZERO
        }
    }

    fn observe_time(&mut self, ts: Timestamp) {
        self.server_time = self.now().max(ts);
        self.observed_at = time::Instant::now();
    }
}

/// Tracks which devices of a tenant are active.
pub struct PresenceRegistry<R> {
    remote: Arc<R>,
    tenant: TenantId,
    ttl: Duration,
    registry: Mutex<Registry>,
    active: watch::Sender<Vec<DeviceId>>,
    events: Option<broadcast::Sender<SyncEvent>>,
}

impl<R: RemoteStore> PresenceRegistry<R> {
    /// Creates a registry for `tenant` with the given heartbeat TTL.
    pub fn new(remote: Arc<R>, tenant: TenantId, ttl: Duration) -> Self {
        let (active, _) = watch::channel(Vec::new());
        Self {
            remote,
            tenant,
            ttl,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                server_time: Timestamp::ZERO,
                observed_at: time::Instant::now(),
            }),
            active,
            events: None,
        }
    }

    /// Also publishes changes of the active set as [`SyncEvent`]s.
    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The tenant this registry watches.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Writes a heartbeat for `session` and refreshes its server times.
    pub async fn heartbeat(&self, session: &mut DeviceSession) -> SyncResult<Timestamp> {
        let ts = self
            .remote
            .put(&self.tenant, Collection::ActiveDevices, session.to_heartbeat_document())
            .await?;
        if !session.login_time.is_valid() {
            session.login_time = ts;
        }
        session.last_heartbeat = ts;
        debug!(device = %session.device_id, heartbeat = %ts, "sent heartbeat");

        {
            let mut registry = self.registry.lock();
            registry.observe_time(ts);
            registry
                .sessions
                .insert(session.device_id.clone(), session.clone());
        }
        self.publish();
        Ok(ts)
    }

    /// Reloads every heartbeat document from the remote store.
    pub async fn refresh(&self) -> SyncResult<Vec<DeviceId>> {
        let documents = self
            .remote
            .query(&self.tenant, Collection::ActiveDevices, None)
            .await?;

        let mut sessions = HashMap::new();
        let mut newest = Timestamp::ZERO;
        for doc in &documents {
            if let Some(session) = parse(doc) {
                newest = newest.max(session.last_heartbeat);
                sessions.insert(session.device_id.clone(), session);
            }
        }

        {
            let mut registry = self.registry.lock();
            registry.sessions = sessions;
            registry.observe_time(newest);
        }
        self.publish();
        Ok(self.active_devices())
    }

    /// Applies one change event of the `active_devices` collection.
    pub fn observe(&self, change: &RemoteChange) {
        {
            let mut registry = self.registry.lock();
            match change.kind {
                ChangeKind::Removed => {
                    if let Ok(device) = DeviceId::new(change.document.id.clone()) {
                        registry.sessions.remove(&device);
                    }
                }
                ChangeKind::Added | ChangeKind::Modified => {
                    if let Some(session) = parse(&change.document) {
                        registry.observe_time(session.last_heartbeat);
                        registry.sessions.insert(session.device_id.clone(), session);
                    }
                }
            }
        }
        self.publish();
    }

    /// Removes this device's heartbeat document.
    pub async fn unregister(&self, device: &DeviceId) -> SyncResult<()> {
        self.remote
            .delete(&self.tenant, Collection::ActiveDevices, device.as_str())
            .await?;
        self.registry.lock().sessions.remove(device);
        self.publish();
        info!(%device, "unregistered device");
        Ok(())
    }

    /// Devices whose heartbeat is within the TTL, sorted.
    ///
    /// Rechecks the TTL, so subscribers are notified of expiries found here.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.publish()
    }

    /// Estimated server time: the latest observed server timestamp plus
    /// the time elapsed since it was observed.
    pub fn server_time(&self) -> Timestamp {
        self.registry.lock().now()
    }

    /// Receives the active set whenever it changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceId>> {
        self.active.subscribe()
    }

    fn publish(&self) -> Vec<DeviceId> {
        let live = {
            let registry = self.registry.lock();
            let now = registry.now();
            let mut live: Vec<DeviceId> = registry
                .sessions
                .values()
                .filter(|s| s.is_live(now, self.ttl))
                .map(|s| s.device_id.clone())
                .collect();
            live.sort();
            live
        };

        let changed = self.active.send_if_modified(|current| {
            if *current == live {
                false
            } else {
                *current = live.clone();
                true
            }
        });
        if changed {
            debug!(active = live.len(), "active devices changed");
            if let Some(events) = &self.events {
                let _ = events.send(SyncEvent::ActiveDevicesChanged(live.clone()));
            }
        }
        live
    }

    /// Heartbeats every `interval` and follows other devices' heartbeats
    /// until `shutdown` flips to true or its sender is dropped.
    pub async fn run(
        self: Arc<Self>,
        mut session: DeviceSession,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut changes = self.open_stream().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.heartbeat(&mut session).await {
                        Ok(_) => {
                            if let Err(err) = self.refresh().await {
                                debug!(error = %err, "presence refresh failed");
                            }
                        }
                        Err(err) => {
                            self.report(&err);
                            self.publish();
                        }
                    }
                    if changes.is_none() {
                        changes = self.open_stream().await;
                    }
                }
                change = next_change(&mut changes) => match change {
                    Some(change) => self.observe(&change),
                    None => {
                        debug!("presence subscription closed");
                        changes = None;
                    }
                },
            }
        }
        debug!(device = %session.device_id, "presence loop stopped");
    }

    async fn open_stream(&self) -> Option<ChangeStream> {
        match self
            .remote
            .subscribe(&self.tenant, Collection::ActiveDevices)
            .await
        {
            Ok(stream) => Some(stream),
            Err(err) => {
                debug!(error = %err, "presence subscription failed");
                None
            }
        }
    }

    fn report(&self, err: &SyncError) {
        warn!(error = %err, "heartbeat failed");
        if let Some(events) = &self.events {
            if matches!(err, SyncError::AuthExpired) {
                let _ = events.send(SyncEvent::ReauthenticationRequired);
            }
            let _ = events.send(SyncEvent::SyncFailed {
                strategy: None,
                failure: SyncFailure::from(err),
            });
        }
    }
}

fn parse(doc: &RemoteDocument) -> Option<DeviceSession> {
    match DeviceSession::from_heartbeat_document(doc) {
        Ok(session) => Some(session),
        Err(err) => {
            debug!(id = %doc.id, error = %err, "ignoring heartbeat document");
            None
        }
    }
}

pub(crate) async fn next_change(stream: &mut Option<ChangeStream>) -> Option<RemoteChange> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
