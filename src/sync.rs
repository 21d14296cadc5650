use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::db::{PendingRecord, Store, StoreError};
use crate::lubelogger::LubeLoggerApi;
use crate::model::{GasRecord, RecordPayload};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(60_000);

/// Result of an interactive submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// LubeLogger accepted the record; nothing was queued.
    Delivered,
    /// The record is in the pending queue and will be retried.
    QueuedOffline { id: i64 },
}

impl SubmitOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Delivered)
    }
}

/// Per-drain tallies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Records left alone because another drain was delivering them or had
    /// already removed them.
    pub skipped: usize,
}

/// Owns the pending queue lifecycle: queue on failed submit, drain on timer
/// and on reconnect, remove on success.
pub struct SyncDispatcher {
    store: Store,
    api: Arc<dyn LubeLoggerApi>,
    connectivity: ConnectivityMonitor,
    in_flight: Mutex<HashSet<i64>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncDispatcher {
    pub fn new(store: Store, api: Arc<dyn LubeLoggerApi>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            store,
            api,
            connectivity,
            in_flight: Mutex::new(HashSet::new()),
            auto_sync: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Deliver now if online, otherwise (or on any delivery failure) queue.
    /// Only a storage failure while queueing is reported as an error.
    #[instrument(skip_all, fields(vehicle_id = vehicle_id))]
    pub async fn submit(&self, vehicle_id: i64, record: GasRecord) -> Result<SubmitOutcome, StoreError> {
        if self.connectivity.is_online() {
            match self.api.add_gas_record(vehicle_id, &record).await {
                Ok(()) => return Ok(SubmitOutcome::Delivered),
                Err(err) => warn!(?err, vehicle_id, "failed to add record, storing offline"),
            }
        } else {
            info!(vehicle_id, "offline, storing record");
        }

        let payload = RecordPayload { vehicle_id, record };
        let queued = self.store.enqueue_pending(&payload).await?;
        Ok(SubmitOutcome::QueuedOffline { id: queued.id })
    }

    /// One best-effort pass over the queue. Deliveries run concurrently and
    /// each record's outcome is independent of the others.
    #[instrument(skip_all)]
    pub async fn drain_queue(&self) -> Result<DrainReport, StoreError> {
        if !self.connectivity.is_online() {
            debug!("offline, skipping drain");
            return Ok(DrainReport::default());
        }

        let pending = self.store.list_pending().await?;
        let (claimed, skipped) = self.claim(pending);
        let mut report = DrainReport {
            skipped,
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let outcomes = join_all(claimed.into_iter().map(|record| self.deliver(record))).await;
        for outcome in outcomes {
            match outcome {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed => report.failed += 1,
                Delivery::Gone => report.skipped += 1,
            }
        }
        report.attempted = report.delivered + report.failed;
        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "drain finished"
        );
        Ok(report)
    }

    fn claim(&self, pending: Vec<PendingRecord>) -> (Vec<InFlight<'_>>, usize) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let mut claimed = Vec::with_capacity(pending.len());
        let mut skipped = 0;
        for record in pending {
            if set.insert(record.id) {
                claimed.push(InFlight {
                    record,
                    set: &self.in_flight,
                });
            } else {
                skipped += 1;
            }
        }
        (claimed, skipped)
    }

    async fn deliver(&self, claim: InFlight<'_>) -> Delivery {
        let record = &claim.record;
        let payload = &record.payload;

        // The listing may predate another drain's removal of this record.
        match self.store.is_pending(record.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = record.id, "record already synced elsewhere");
                return Delivery::Gone;
            }
            Err(err) => {
                warn!(?err, id = record.id, "failed to check pending record");
                return Delivery::Failed;
            }
        }

        match self.api.add_gas_record(payload.vehicle_id, &payload.record).await {
            Ok(()) => {
                match self.store.remove_pending(record.id).await {
                    Ok(_) => debug!(id = record.id, "pending record synced"),
                    // Delivered but still queued: the next drain sends it again.
                    Err(err) => error!(?err, id = record.id, "failed to remove synced record"),
                }
                Delivery::Delivered
            }
            Err(err) => {
                warn!(?err, id = record.id, "failed to sync record, keeping it queued");
                Delivery::Failed
            }
        }
    }

    /// Drain every `period` until stopped. Replaces any running timer.
    pub fn start_auto_sync(self: &Arc<Self>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Each drain is its own task so stopping the timer never
                // cancels a delivery already under way.
                if !spawn_drain(&weak, "scheduled") {
                    break;
                }
            }
        });

        let mut slot = self.auto_sync.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        info!(period_ms = period.as_millis() as u64, "auto-sync started");
    }

    /// Returns whether a timer was running.
    pub fn stop_auto_sync(&self) -> bool {
        let mut slot = self.auto_sync.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(handle) => {
                handle.abort();
                info!("auto-sync stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_auto_syncing(&self) -> bool {
        let slot = self.auto_sync.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Drain immediately whenever connectivity comes back. Replaces any
    /// previous listener.
    pub fn watch_connectivity(self: &Arc<Self>) {
        let mut events = self.connectivity.subscribe();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectivityEvent::WentOnline) => {
                        if !spawn_drain(&weak, "reconnect") {
                            break;
                        }
                    }
                    Ok(ConnectivityEvent::WentOffline) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "connectivity events lagged");
                        let online = match weak.upgrade() {
                            Some(d) => d.connectivity.is_online(),
                            None => break,
                        };
                        if online && !spawn_drain(&weak, "reconnect") {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

impl SyncDispatcher {
    /// Returns whether a listener was installed.
    pub fn stop_watching_connectivity(&self) -> bool {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(handle) => {
                handle.abort();
                debug!("reconnect listener stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_watching_connectivity(&self) -> bool {
        let slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SyncDispatcher {
    fn drop(&mut self) {
        for slot in [&mut self.auto_sync, &mut self.listener] {
            let slot = slot.get_mut().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Spawn a detached drain. Returns false once the dispatcher is gone.
fn spawn_drain(weak: &Weak<SyncDispatcher>, trigger: &'static str) -> bool {
    let Some(dispatcher) = weak.upgrade() else {
        return false;
    };
    tokio::spawn(async move {
        debug!(trigger, "drain triggered");
        if let Err(err) = dispatcher.drain_queue().await {
            error!(?err, trigger, "drain failed");
        }
    });
    true
}

enum Delivery {
    Delivered,
    Failed,
    /// Removed between listing and claiming.
    Gone,
}

/// A record claimed by one drain; the claim is released on drop.
struct InFlight<'a> {
    record: PendingRecord,
    set: &'a Mutex<HashSet<i64>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.record.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Credentials;
    use crate::model::{FuelType, Vehicle};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        adds: AtomicUsize,
    }

    #[async_trait]
    impl LubeLoggerApi for CountingApi {
        fn set_auth(&self, _credentials: Credentials) {}

        fn clear_auth(&self) {}

        async fn get_vehicles(&self) -> Result<Vec<Vehicle>> {
            Ok(Vec::new())
        }

        async fn get_vehicle_info(&self, _vehicle_id: i64) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn add_gas_record(&self, _vehicle_id: i64, _record: &GasRecord) -> Result<()> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn payload(vehicle_id: i64) -> RecordPayload {
        RecordPayload {
            vehicle_id,
            record: GasRecord {
                date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                odometer: 15000.0,
                fuel_consumed: 40.0,
                cost: 60.0,
                is_fill_to_full: true,
                missed_fuel_up: false,
                fuel_type: FuelType::SP95,
                notes: None,
            },
        }
    }

    #[tokio::test]
    async fn stale_listing_skips_records_removed_since() {
        let store = Store::in_memory().await.unwrap();
        let api = Arc::new(CountingApi::default());
        let dispatcher = SyncDispatcher::new(store.clone(), api.clone(), ConnectivityMonitor::default());

        let a = store.enqueue_pending(&payload(1)).await.unwrap();
        let stale = store.list_pending().await.unwrap();
        assert!(store.remove_pending(a.id).await.unwrap());
        let b = store.enqueue_pending(&payload(2)).await.unwrap();

        let (claimed, skipped) = dispatcher.claim(stale);
        assert_eq!(skipped, 0);
        assert_eq!(claimed.len(), 1);
        for claim in claimed {
            assert!(matches!(dispatcher.deliver(claim).await, Delivery::Gone));
        }
        assert_eq!(api.adds.load(Ordering::SeqCst), 0);
        assert!(store.is_pending(b.id).await.unwrap());
        assert!(dispatcher.in_flight.lock().unwrap().is_empty());
    }
}
