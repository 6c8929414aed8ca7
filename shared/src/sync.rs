//! Background replay of the offline queue.

use std::collections::HashSet;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::AuthError;
use crate::capabilities::{Clock, ConnectivityMonitor, ConnectivityProbe, HttpResponse};
use crate::event::{DropReason, EventBus, PipelineEvent};
use crate::gateway::{is_auth_endpoint, GatewayError, RequestGateway};
use crate::model::UnixTimeMs;
use crate::outbox::{Outbox, OutboxError, QueuedRequest, RequestId};
use crate::reconcile::LocalCacheReconciler;
use crate::retry::BackoffPolicy;

/// A 4xx the server will keep rejecting no matter how often the record is replayed.
pub fn is_fatal_status(status: u16) -> bool {
    (400..500).contains(&status) && !matches!(status, 401 | 408 | 429)
}

/// Wake-up signal for the sync worker. Notifications coalesce: any number of
/// `notify` calls before the worker wakes produce one drain.
#[derive(Clone, Debug, Default)]
pub struct SyncTrigger {
    inner: Arc<TriggerInner>,
}

#[derive(Debug, Default)]
struct TriggerInner {
    notify: Notify,
    pending: AtomicBool,
}

impl SyncTrigger {
    pub fn notify(&self) {
        self.inner.pending.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Resolve once a notification is pending, consuming it.
    pub async fn wait(&self) {
        loop {
            if self.inner.pending.swap(false, Ordering::AcqRel) {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("queue error during drain: {0}")]
    Queue(#[from] OutboxError),
}

/// What one drain pass did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    pub synced: Vec<RequestId>,
    pub dropped: Vec<(RequestId, DropReason)>,
    pub rescheduled: Vec<RequestId>,
    /// Records left alone because their backoff had not elapsed.
    pub skipped: usize,
    /// Another drain held the engine; this call did nothing. The running pass
    /// goes around once more so records queued meanwhile are not missed.
    pub already_running: bool,
    pub stopped_offline: bool,
    pub stopped_auth: bool,
    /// Earliest `next_eligible_at` among records still waiting on backoff.
    pub next_wake_at: Option<UnixTimeMs>,
}

impl DrainReport {
    /// Fold a follow-up pass in. Skips, wake time and stop flags describe the queue
    /// as the latest pass left it.
    fn extend(&mut self, next: DrainReport) {
        self.synced.extend(next.synced);
        self.dropped.extend(next.dropped);
        self.rescheduled.extend(next.rescheduled);
        self.skipped = next.skipped;
        self.stopped_offline = next.stopped_offline;
        self.stopped_auth = next.stopped_auth;
        self.next_wake_at = next.next_wake_at;
    }

    fn wake_at(&mut self, at: UnixTimeMs) {
        self.next_wake_at = Some(self.next_wake_at.map_or(at, |current| current.min(at)));
    }
}

enum Step {
    Synced,
    Dropped(DropReason),
    Rescheduled { at: UnixTimeMs },
    StopAuth,
}

pub struct SyncEngine {
    gateway: Arc<RequestGateway>,
    outbox: Arc<Outbox>,
    reconciler: Arc<LocalCacheReconciler>,
    probe: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    events: EventBus,
    draining: Mutex<()>,
    rerun: AtomicBool,
    /// Replayed records whose removal from the queue failed; never sent again.
    settled: Mutex<HashSet<RequestId>>,
}

impl SyncEngine {
    pub fn new(
        gateway: Arc<RequestGateway>,
        outbox: Arc<Outbox>,
        reconciler: Arc<LocalCacheReconciler>,
        probe: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            outbox,
            reconciler,
            probe,
            clock,
            backoff,
            events,
            draining: Mutex::new(()),
            rerun: AtomicBool::new(false),
            settled: Mutex::new(HashSet::new()),
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Replay queued records in stored order.
    ///
    /// At most one pass runs at a time. A concurrent call returns immediately with
    /// `already_running` set and the running pass makes one more, non-forced, pass
    /// before it returns. `force` ignores backoff but nothing else.
    #[instrument(skip(self))]
    pub async fn drain(&self, force: bool) -> Result<DrainReport, SyncError> {
        self.rerun.store(true, Ordering::SeqCst);
        let mut report = DrainReport::default();
        let mut passes = 0_u32;
        loop {
            // Released on every exit path, including errors and panics in a replay.
            let Ok(guard) = self.draining.try_lock() else {
                if passes == 0 {
                    debug!("drain already running");
                    report.already_running = true;
                }
                return Ok(report);
            };
            let requested = self.rerun.swap(false, Ordering::SeqCst);
            if passes > 0 && !requested {
                drop(guard);
                // A request that lost the race for the lock after the swap.
                if self.rerun.load(Ordering::SeqCst) {
                    continue;
                }
                return Ok(report);
            }
            if passes > 0 {
                debug!(passes, "queue changed during drain, going again");
            }
            report.extend(self.pass(force && passes == 0).await?);
            passes += 1;
        }
    }

    async fn pass(&self, force: bool) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        if !self.probe.is_reachable().await {
            debug!("unreachable, skipping drain");
            report.stopped_offline = true;
            return Ok(report);
        }

        let records = self.outbox.list_all().await?;
        if records.is_empty() {
            return Ok(report);
        }
        info!(count = records.len(), force, "draining offline queue");

        let max_age_ms = self.outbox.config().max_age_ms;
        let mut replays = 0_usize;
        for record in records {
            if self.settled.lock().await.contains(&record.id) {
                if self.forget_settled(&record.id).await {
                    report.synced.push(record.id.clone());
                }
                continue;
            }
            let now = self.clock.now();
            if record.is_expired(now, max_age_ms) {
                warn!(id = %record.id, "queued request expired, dropping");
                self.drop_record(&record, DropReason::Expired, &mut report).await?;
                continue;
            }
            if !force && !record.is_eligible(now) {
                report.skipped += 1;
                report.wake_at(record.next_eligible_at);
                continue;
            }
            if replays > 0 && !self.probe.is_reachable().await {
                info!("connectivity lost mid-drain, stopping");
                report.stopped_offline = true;
                break;
            }
            replays += 1;

            match self.process(&record).await? {
                Step::Synced => report.synced.push(record.id.clone()),
                Step::Dropped(reason) => {
                    self.drop_record(&record, reason, &mut report).await?;
                }
                Step::Rescheduled { at } => {
                    report.rescheduled.push(record.id.clone());
                    report.wake_at(at);
                }
                Step::StopAuth => {
                    warn!(id = %record.id, "session invalid, stopping drain");
                    report.stopped_auth = true;
                    break;
                }
            }
        }

        info!(
            synced = report.synced.len(),
            dropped = report.dropped.len(),
            rescheduled = report.rescheduled.len(),
            skipped = report.skipped,
            "drain finished"
        );
        Ok(report)
    }

    /// Pull-to-refresh: drain ignoring backoff.
    pub async fn foreground_refresh(&self) -> Result<DrainReport, SyncError> {
        self.drain(true).await
    }

    async fn process(&self, record: &QueuedRequest) -> Result<Step, SyncError> {
        match self.replay(record).await {
            Ok(response) => {
                self.apply(record, &response).await;
                if let Err(e) = self.outbox.remove(&record.id).await {
                    error!(id = %record.id, error = %e, "replayed request still queued, will not resend");
                    self.settled.lock().await.insert(record.id.clone());
                }
                info!(id = %record.id, status = response.status(), "replayed");
                self.events
                    .emit(PipelineEvent::Synced { id: record.id.clone() });
                Ok(Step::Synced)
            }
            Err(GatewayError::Auth(AuthError::Invalid | AuthError::MissingRefreshToken)) => {
                Ok(Step::StopAuth)
            }
            Err(GatewayError::Request(e)) => {
                error!(id = %record.id, error = %e, "queued request cannot be sent");
                Ok(Step::Dropped(DropReason::Malformed))
            }
            Err(e) => match e.status() {
                Some(status) if is_fatal_status(status) => {
                    warn!(id = %record.id, status, "server rejected queued request");
                    Ok(Step::Dropped(DropReason::Rejected { status }))
                }
                _ => self.reschedule(record, &e).await,
            },
        }
    }

    /// One replay, plus one more after a shared refresh if the first answer was 401.
    async fn replay(&self, record: &QueuedRequest) -> Result<HttpResponse, GatewayError> {
        let generation = self.gateway.session().generation();
        match self.gateway.replay(record).await {
            Err(e) if e.status() == Some(401) && !is_auth_endpoint(&record.url) => {
                debug!(id = %record.id, "replay unauthorized, refreshing session");
                self.gateway.refresh_session(generation).await?;
                self.gateway.replay(record).await
            }
            other => other,
        }
    }

    async fn reschedule(&self, record: &QueuedRequest, error: &GatewayError) -> Result<Step, SyncError> {
        let retry_count = record.retry_count.saturating_add(1);
        if self.backoff.is_exhausted(retry_count) {
            warn!(id = %record.id, attempts = retry_count, error = %error, "giving up on queued request");
            return Ok(Step::Dropped(DropReason::RetriesExhausted {
                attempts: retry_count,
            }));
        }

        let delay = self.backoff.jittered_delay(retry_count);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let at = self.clock.now().add_millis(delay_ms);
        let updated = QueuedRequest {
            retry_count,
            next_eligible_at: at,
            ..record.clone()
        };
        self.outbox.update(&updated).await?;
        debug!(id = %record.id, retry_count, delay_ms, error = %error, "replay failed, backing off");
        self.events.emit(PipelineEvent::Rescheduled {
            id: record.id.clone(),
            retry_count,
            delay_ms,
        });
        Ok(Step::Rescheduled { at })
    }

    async fn apply(&self, record: &QueuedRequest, response: &HttpResponse) {
        // The server has the mutation; a cache write failure must not cause a resend.
        if let Err(e) = self.reconciler.apply_synced(record, response).await {
            error!(id = %record.id, error = %e, "failed to apply replay to local cache");
        }
    }

    /// Retry removing a record the server already has. Returns whether it is gone.
    async fn forget_settled(&self, id: &RequestId) -> bool {
        match self.outbox.remove(id).await {
            Ok(_) => {
                self.settled.lock().await.remove(id);
                debug!(id = %id, "settled request removed from queue");
                true
            }
            Err(e) => {
                warn!(id = %id, error = %e, "settled request still queued");
                false
            }
        }
    }

    async fn drop_record(
        &self,
        record: &QueuedRequest,
        reason: DropReason,
        report: &mut DrainReport,
    ) -> Result<(), SyncError> {
        self.outbox.remove(&record.id).await?;
        self.events.emit(PipelineEvent::Dropped {
            id: record.id.clone(),
            reason: reason.clone(),
        });
        report.dropped.push((record.id.clone(), reason));
        Ok(())
    }
}

async fn sleep_until(wake: Option<Duration>) {
    match wake {
        Some(delay) => tokio::time::sleep(delay).await,
        None => future::pending().await,
    }
}

/// Run drains in the background: at startup, whenever `trigger` fires, when the
/// monitor flips back online, and when the earliest backoff elapses.
pub fn spawn_worker(
    engine: Arc<SyncEngine>,
    trigger: SyncTrigger,
    monitor: &ConnectivityMonitor,
) -> JoinHandle<()> {
    let mut online = monitor.subscribe();
    tokio::spawn(async move {
        let mut next_wake = Some(engine.clock.now());
        loop {
            let delay = next_wake
                .map(|at| Duration::from_millis(at.elapsed_since(engine.clock.now())));
            tokio::select! {
                () = trigger.wait() => debug!("sync triggered"),
                changed = online.changed() => {
                    if changed.is_err() {
                        debug!("connectivity monitor dropped, stopping sync worker");
                        return;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                    info!("back online, draining");
                }
                () = sleep_until(delay) => {}
            }

            match engine.drain(false).await {
                Ok(report) if report.already_running => {}
                Ok(report) => next_wake = report.next_wake_at,
                Err(e) => {
                    error!(error = %e, "drain failed");
                    next_wake = Some(
                        engine
                            .clock
                            .now()
                            .add_millis(engine.backoff.base_delay_ms()),
                    );
                }
            }
        }
    })
}
