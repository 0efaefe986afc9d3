//! Drains the durable queue against the remote sync endpoint.
//!
//! Per record: `PENDING -> IN_FLIGHT -> SYNCED | PENDING`. `IN_FLIGHT` only
//! exists for the duration of a run and is never persisted, so a crash
//! mid-run leaves the record pending.
//!
//! Delivery is at-least-once. The record id travels as the idempotency
//! token and the flag is flipped only after an acknowledgement, so a crash
//! between the remote ack and the local flip yields one duplicate
//! delivery on the next run. The endpoint is expected to ignore it.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl};
use crate::config::{ConfigError, CoreContext};
use crate::queue::{DurableQueue, EmergencyRecord, QueueError, RecordId};
use crate::signals::{CoreSignal, SignalBus};
use crate::time::UnixTimeMs;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    Periodic,
    Manual,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid sync endpoint: {0}")]
    Endpoint(#[from] ConfigError),
}

/// Why one delivery attempt did not count as acknowledged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("could not build request: {0}")]
    Request(HttpError),

    #[error("network error: {0}")]
    Network(HttpError),

    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("endpoint answered {status}")]
    Rejected { status: u16 },

    #[error("malformed acknowledgement: {0}")]
    MalformedAck(String),

    #[error("acknowledged but not recorded locally: {0}")]
    LocalFlip(String),
}

/// Outcome of one delivery attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAttemptResult {
    Acknowledged,
    Failed(DeliveryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub attempted: usize,
    pub synced: Vec<RecordId>,
    pub failed: Vec<(RecordId, DeliveryError)>,
    /// Skipped this run by the retry policy.
    pub deferred: Vec<RecordId>,
    pub pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another run was already active; this trigger was dropped.
    Coalesced,
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Coalesced => None,
        }
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Decides whether a pending record is attempted in the current run.
pub trait RetryPolicy: Send + Sync {
    fn should_retry_now(&self, record: &EmergencyRecord, now: UnixTimeMs) -> bool;

    fn on_failure(&self, _record: &EmergencyRecord, _now: UnixTimeMs) {}

    fn on_success(&self, _id: RecordId) {}
}

/// Attempt every pending record on every trigger.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateRetry;

impl RetryPolicy for ImmediateRetry {
    fn should_retry_now(&self, _record: &EmergencyRecord, _now: UnixTimeMs) -> bool {
        true
    }
}

/// Per-record exponential backoff with jitter. State is in memory only,
/// so a restart makes every record immediately due again.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    state: Mutex<HashMap<RecordId, (u32, UnixTimeMs)>>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), Duration::from_secs(2))
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            base_ms: ms(base).max(1),
            max_ms: ms(max),
            jitter_ms: ms(jitter),
            state: Mutex::new(HashMap::new()),
        }
    }

    fn calculate_backoff(&self, attempt: u32) -> u64 {
        use rand::Rng;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };

        let exponent = attempt.saturating_sub(1).min(16);
        let base_delay = self.base_ms.saturating_mul(1u64 << exponent);
        let capped_delay = base_delay.min(self.max_ms);

        capped_delay.saturating_add(jitter)
    }

    pub fn attempts(&self, id: RecordId) -> u32 {
        self.state
            .lock()
            .map(|s| s.get(&id).map_or(0, |(n, _)| *n))
            .unwrap_or(0)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry_now(&self, record: &EmergencyRecord, now: UnixTimeMs) -> bool {
        self.state
            .lock()
            .map(|s| s.get(&record.id).map_or(true, |(_, next)| now >= *next))
            .unwrap_or(true)
    }

    fn on_failure(&self, record: &EmergencyRecord, now: UnixTimeMs) {
        if let Ok(mut state) = self.state.lock() {
            let attempts = state.get(&record.id).map_or(0, |(n, _)| *n) + 1;
            let next = now.add_millis(self.calculate_backoff(attempts));
            state.insert(record.id, (attempts, next));
        }
    }

    fn on_success(&self, id: RecordId) {
        if let Ok(mut state) = self.state.lock() {
            state.remove(&id);
        }
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryBody<'a> {
    idempotency_id: RecordId,
    kind: &'a str,
    payload: &'a serde_json::Value,
    created_at: u64,
}

/// Size of the delivery body for `kind` and `payload`, taking the widest id
/// and timestamp so a record that passes stays under the request limit.
pub(crate) fn delivery_body_len(
    kind: &str,
    payload: &serde_json::Value,
) -> Result<usize, serde_json::Error> {
    let widest = DeliveryBody {
        idempotency_id: RecordId(u64::MAX),
        kind,
        payload,
        created_at: u64::MAX,
    };
    Ok(serde_json::to_vec(&widest)?.len())
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    queue: Arc<DurableQueue>,
    transport: Arc<dyn HttpTransport>,
    ctx: CoreContext,
    signals: SignalBus,
    policy: Arc<dyn RetryPolicy>,
    endpoint: ValidatedUrl,
    running: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<DurableQueue>,
        transport: Arc<dyn HttpTransport>,
        ctx: CoreContext,
        signals: SignalBus,
    ) -> Result<Self, SyncError> {
        let endpoint = ctx.config.resolve(&ctx.config.sync_path)?;
        Ok(Self {
            queue,
            transport,
            ctx,
            signals,
            policy: Arc::new(ImmediateRetry),
            endpoint,
            running: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one sync pass, or returns `Coalesced` if one is already active.
    #[instrument(skip(self))]
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("sync already running, trigger coalesced");
            return Ok(SyncOutcome::Coalesced);
        };

        let pending = self.queue.list_unsynced().await?;
        let now = self.ctx.clock.now();
        let (due, deferred): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|record| self.policy.should_retry_now(record, now));

        let mut report = SyncReport {
            trigger,
            attempted: due.len(),
            synced: Vec::new(),
            failed: Vec::new(),
            deferred: deferred.iter().map(|r| r.id).collect(),
            pruned: 0,
        };

        if !due.is_empty() {
            info!(pending = due.len(), deferred = report.deferred.len(), "sync run started");
        }

        // One attempt per record, several in flight, results in queue order.
        // Each result is applied as soon as it arrives.
        let mut attempts = stream::iter(due)
            .map(|record| async move {
                let result = self.deliver(&record).await;
                (record, result)
            })
            .buffered(self.ctx.config.max_concurrent_deliveries.max(1));

        while let Some((record, result)) = attempts.next().await {
            match result {
                SyncAttemptResult::Acknowledged => match self.queue.mark_synced(record.id).await {
                    Ok(_) => {
                        self.policy.on_success(record.id);
                        self.signals.emit(CoreSignal::Synced { id: record.id });
                        report.synced.push(record.id);
                    }
                    Err(e) => {
                        error!(id = %record.id, error = %e, "acknowledged record could not be marked synced");
                        report
                            .failed
                            .push((record.id, DeliveryError::LocalFlip(e.to_string())));
                    }
                },
                SyncAttemptResult::Failed(reason) => {
                    warn!(id = %record.id, error = %reason, "delivery failed, record stays pending");
                    self.policy.on_failure(&record, self.ctx.clock.now());
                    report.failed.push((record.id, reason));
                }
            }
        }

        if let Some(keep) = self.ctx.config.synced_retention {
            match self.queue.prune_synced(keep).await {
                Ok(removed) => report.pruned = removed,
                Err(e) => warn!(error = %e, "failed to prune synced records"),
            }
        }

        info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "sync run finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    fn build_request(&self, record: &EmergencyRecord) -> Result<HttpRequest, HttpError> {
        let body = DeliveryBody {
            idempotency_id: record.id,
            kind: &record.kind,
            payload: &record.payload,
            created_at: record.created_at.as_millis(),
        };
        HttpRequest::new(HttpMethod::Post, self.endpoint.clone())
            .with_header(IDEMPOTENCY_HEADER, record.id.to_string())?
            .with_json(&body)?
            .with_timeout(self.ctx.config.delivery_timeout())
    }

    async fn deliver(&self, record: &EmergencyRecord) -> SyncAttemptResult {
        let request = match self.build_request(record) {
            Ok(request) => request,
            Err(e) => return SyncAttemptResult::Failed(DeliveryError::Request(e)),
        };

        let timeout = self.ctx.config.delivery_timeout();
        let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Err(_) => {
                return SyncAttemptResult::Failed(DeliveryError::Timeout {
                    timeout_ms: self.ctx.config.delivery_timeout_ms,
                })
            }
            Ok(Err(e)) => return SyncAttemptResult::Failed(DeliveryError::Network(e)),
            Ok(Ok(response)) => response,
        };

        match check_acknowledgement(&response, record.id) {
            Ok(()) => SyncAttemptResult::Acknowledged,
            Err(e) => SyncAttemptResult::Failed(e),
        }
    }
}

/// A 2xx with an empty body, or a JSON object whose `idempotencyId` (if
/// present) matches and whose `accepted` (if present) is not `false`.
fn check_acknowledgement(response: &HttpResponse, id: RecordId) -> Result<(), DeliveryError> {
    if !response.is_success() {
        return Err(DeliveryError::Rejected {
            status: response.status(),
        });
    }
    if response.body().iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }

    let value: serde_json::Value = serde_json::from_slice(response.body())
        .map_err(|e| DeliveryError::MalformedAck(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| DeliveryError::MalformedAck("expected a JSON object".into()))?;

    if let Some(echoed) = object.get("idempotencyId") {
        let matches = match echoed {
            serde_json::Value::Number(n) => n.as_u64() == Some(id.as_u64()),
            serde_json::Value::String(s) => s == &id.to_string(),
            _ => false,
        };
        if !matches {
            return Err(DeliveryError::MalformedAck(format!(
                "idempotencyId {echoed} does not match {id}"
            )));
        }
    }
    if object.get("accepted") == Some(&serde_json::Value::Bool(false)) {
        return Err(DeliveryError::MalformedAck("accepted is false".into()));
    }
    Ok(())
}

/// Triggers a periodic sync every `period` until the handle is aborted.
/// Ticks missed while a run is slow are skipped, not bunched up, and so
/// are ticks that land while offline.
pub fn spawn_periodic_sync(engine: Arc<SyncEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if !engine.ctx.connectivity.is_online() {
                debug!("offline, periodic sync skipped");
                continue;
            }
            if let Err(e) = engine.trigger(SyncTrigger::Periodic).await {
                warn!(error = %e, "periodic sync failed");
            }
        }
    })
}
