//! Host-facing state machine.
//!
//! The host runtime forwards its events (install, activate, fetch, push,
//! notification click, connectivity change, periodic tick) to the named
//! methods on [`OfflineCore`]; everything else is wired up here.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    register_for_push_alerts, HttpMethod, HttpRequest, HttpResponse, HttpTransport, PushPlatform,
    RegisterOptions,
};
use crate::config::CoreContext;
use crate::notify::{
    AlertAction, AlertPayload, AlertPresenter, Navigator, NotificationDispatcher, RenderedAlert,
};
use crate::queue::{DurableQueue, QueueStats, QueueStorage, RecordId};
use crate::resource_cache::{CacheStorage, PromoteReport, ResourceCache, WarmReport};
use crate::router::{capture_failed_response, InboundRequest, ResponseSource, RouteError, Router};
use crate::signals::{CoreSignal, SignalBus};
use crate::sync::{spawn_periodic_sync, SyncEngine, SyncOutcome, SyncTrigger};
use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Installing,
    /// Warmed, waiting for activation.
    Installed,
    Active,
    InstallFailed,
}

impl LifecycleState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Active => "active",
            Self::InstallFailed => "install_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureStatus {
    /// Stored on the device; the sync engine will deliver it.
    CapturedLocally,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    pub offline: bool,
    pub record_id: Option<RecordId>,
    pub status: CaptureStatus,
}

impl SubmitReceipt {
    fn captured(id: Option<RecordId>) -> Self {
        Self {
            accepted: true,
            offline: true,
            record_id: id,
            status: CaptureStatus::CapturedLocally,
        }
    }

    fn delivered() -> Self {
        Self {
            accepted: true,
            offline: false,
            record_id: None,
            status: CaptureStatus::Delivered,
        }
    }
}

/// Host implementations handed to [`OfflineCore::open`].
pub struct CoreDeps {
    pub transport: Arc<dyn HttpTransport>,
    pub cache_storage: Arc<dyn CacheStorage>,
    pub queue_storage: Arc<dyn QueueStorage>,
    pub presenter: Arc<dyn AlertPresenter>,
    pub navigator: Arc<dyn Navigator>,
}

pub struct OfflineCore {
    ctx: CoreContext,
    cache: Arc<ResourceCache>,
    queue: Arc<DurableQueue>,
    router: Router,
    sync: Arc<SyncEngine>,
    dispatcher: NotificationDispatcher,
    signals: SignalBus,
    state: RwLock<LifecycleState>,
}

impl OfflineCore {
    #[instrument(skip_all, fields(cache = %ctx.config.cache_name))]
    pub async fn open(ctx: CoreContext, deps: CoreDeps) -> Result<Self, CoreError> {
        let signals = SignalBus::default();
        let queue = Arc::new(DurableQueue::open(deps.queue_storage, ctx.clock.clone()).await?);
        let cache = Arc::new(ResourceCache::new(
            deps.cache_storage,
            deps.transport.clone(),
            ctx.clone(),
        ));
        let router = Router::new(
            cache.clone(),
            queue.clone(),
            deps.transport.clone(),
            ctx.clone(),
            signals.clone(),
        );
        let sync = Arc::new(SyncEngine::new(
            queue.clone(),
            deps.transport,
            ctx.clone(),
            signals.clone(),
        )?);
        let dispatcher = NotificationDispatcher::new(
            ctx.config.notification.clone(),
            deps.presenter,
            deps.navigator,
        );

        // A previous run may already have promoted a version.
        let state = if cache.current_version().await?.is_some() {
            LifecycleState::Active
        } else {
            LifecycleState::Idle
        };
        debug!(state = state.as_str(), "offline core opened");

        Ok(Self {
            ctx,
            cache,
            queue,
            router,
            sync,
            dispatcher,
            signals,
            state: RwLock::new(state),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(from = state.as_str(), to = next.as_str(), "lifecycle transition");
        *state = next;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreSignal> {
        self.signals.subscribe()
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    pub fn sync_engine(&self) -> Arc<SyncEngine> {
        self.sync.clone()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, CoreError> {
        Ok(self.queue.stats().await?)
    }

    /// Warms the critical resources into this build's cache version.
    #[instrument(skip(self))]
    pub async fn on_install(&self) -> Result<WarmReport, CoreError> {
        self.set_state(LifecycleState::Installing);
        match self.cache.warm(&self.ctx.config.critical_resources).await {
            Ok(report) => {
                self.set_state(LifecycleState::Installed);
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "install failed, previous cache version kept");
                self.set_state(LifecycleState::InstallFailed);
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn on_activate(&self) -> Result<PromoteReport, CoreError> {
        let state = self.state();
        if state != LifecycleState::Installed {
            return Err(CoreError::InvalidState {
                expected: LifecycleState::Installed.as_str(),
                actual: state.as_str(),
            });
        }

        let report = self.cache.promote().await?;
        self.set_state(LifecycleState::Active);
        info!(current = %report.current, deleted = report.deleted.len(), "activated");
        self.signals.emit(CoreSignal::CacheVersionPromoted {
            name: report.current.clone(),
        });
        Ok(report)
    }

    /// Always yields a response for a failed capture; other routing
    /// errors are returned to the host.
    pub async fn on_fetch(&self, inbound: InboundRequest) -> Result<HttpResponse, CoreError> {
        match self.router.route(inbound).await {
            Ok(routed) => Ok(routed.response),
            Err(e) if e.is_capture_failure() => {
                error!(error = %e, "emergency request failed");
                Ok(capture_failed_response()?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shows an alert for an inbound push. An undecodable payload still
    /// produces the default alert.
    #[instrument(skip_all, fields(bytes = data.map_or(0, <[u8]>::len)))]
    pub async fn on_push(&self, data: Option<&[u8]>) -> Result<RenderedAlert, CoreError> {
        let payload = match data.map(AlertPayload::from_json) {
            Some(Ok(payload)) => Some(payload),
            Some(Err(e)) => {
                warn!(error = %e, "ignoring push payload");
                None
            }
            None => None,
        };
        Ok(self.dispatcher.on_alert_received(payload).await?)
    }

    /// `action` is the raw action id; an empty or unknown id only closes
    /// the alert.
    pub async fn on_notification_action(
        &self,
        action: &str,
        alert_id: Option<&str>,
    ) -> Result<Option<String>, CoreError> {
        Ok(self
            .dispatcher
            .on_action_selected(AlertAction::parse(action), alert_id)
            .await?)
    }

    /// Records the new connectivity; going from offline to online starts
    /// a sync run.
    #[instrument(skip(self))]
    pub async fn on_connectivity_changed(
        &self,
        online: bool,
    ) -> Result<Option<SyncOutcome>, CoreError> {
        let was_online = self.ctx.connectivity.set_online(online);
        if !online || was_online {
            return Ok(None);
        }
        info!("connectivity restored");
        Ok(Some(self.sync.trigger(SyncTrigger::ConnectivityRestored).await?))
    }

    pub async fn on_periodic_tick(&self) -> Result<Option<SyncOutcome>, CoreError> {
        if !self.ctx.connectivity.is_online() {
            debug!("offline, periodic sync skipped");
            return Ok(None);
        }
        Ok(Some(self.sync.trigger(SyncTrigger::Periodic).await?))
    }

    /// Starts the background sync loop at the configured interval. Abort
    /// the handle to stop it.
    pub fn spawn_periodic_sync(&self) -> JoinHandle<()> {
        let period = self.ctx.config.sync_interval();
        info!(period_secs = period.as_secs(), "periodic sync started");
        spawn_periodic_sync(self.sync.clone(), period)
    }

    pub async fn trigger_sync(&self) -> Result<SyncOutcome, CoreError> {
        Ok(self.sync.trigger(SyncTrigger::Manual).await?)
    }

    /// Sends an emergency request now, or captures it for later.
    #[instrument(skip(self, payload))]
    pub async fn submit_emergency_request(
        &self,
        payload: serde_json::Value,
    ) -> Result<SubmitReceipt, CoreError> {
        if !self.ctx.connectivity.is_online() {
            return self.capture(payload).await;
        }

        let request = HttpRequest::new(
            HttpMethod::Post,
            self.ctx.config.resolve(&self.ctx.config.emergency_path)?,
        )
        .with_json(&payload)?
        .with_timeout(self.ctx.config.fetch_timeout())?;

        match self.router.route(InboundRequest::new(request)).await {
            // Went offline between the check above and routing.
            Ok(routed) if routed.source == ResponseSource::LocalCapture => {
                Ok(SubmitReceipt::captured(routed.record.map(|r| r.id)))
            }
            Ok(routed) if routed.response.is_success() => {
                info!(status = routed.response.status(), "emergency request delivered");
                Ok(SubmitReceipt::delivered())
            }
            Ok(routed) => {
                warn!(
                    status = routed.response.status(),
                    "emergency endpoint rejected request, capturing"
                );
                self.capture(payload).await
            }
            Err(RouteError::Network(e)) => {
                warn!(error = %e, "emergency request failed, capturing");
                self.capture(payload).await
            }
            Err(RouteError::NotCaptured(e)) => Err(CoreError::Queue(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn capture(&self, payload: serde_json::Value) -> Result<SubmitReceipt, CoreError> {
        match self.router.capture(payload).await {
            Ok(record) => Ok(SubmitReceipt::captured(Some(record.id))),
            Err(RouteError::NotCaptured(e)) => Err(CoreError::Queue(e)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn register_for_push_alerts(
        &self,
        platform: &dyn PushPlatform,
        options: RegisterOptions,
    ) -> Result<String, CoreError> {
        Ok(register_for_push_alerts(platform, options).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpError, HttpHeaders};
    use crate::config::{Connectivity, CoreConfig};
    use crate::queue::MemoryQueueStorage;
    use crate::resource_cache::MemoryCacheStorage;
    use crate::testing::{RecordingNavigator, RecordingPresenter, ScriptedTransport};
    use serde_json::json;
    use std::time::Duration;

    const ORIGIN: &str = "https://app.test";

    struct Fixture {
        core: OfflineCore,
        transport: Arc<ScriptedTransport>,
        connectivity: Connectivity,
    }

    fn page(body: &str) -> HttpResponse {
        HttpResponse::new(200, HttpHeaders::new(), body.to_string())
    }

    fn script_critical(transport: &ScriptedTransport, config: &CoreConfig) {
        for path in &config.critical_resources {
            transport.respond(&format!("{ORIGIN}{path}"), page(path));
        }
    }

    async fn fixture(online: bool) -> Fixture {
        let config = CoreConfig {
            origin: format!("{ORIGIN}/"),
            ..CoreConfig::default()
        };
        let transport = Arc::new(ScriptedTransport::new());
        script_critical(&transport, &config);
        let connectivity = Connectivity::new(online);
        let ctx = CoreContext::new(config)
            .unwrap()
            .with_connectivity(connectivity.clone());
        let core = OfflineCore::open(
            ctx,
            CoreDeps {
                transport: transport.clone(),
                cache_storage: Arc::new(MemoryCacheStorage::new()),
                queue_storage: Arc::new(MemoryQueueStorage::new()),
                presenter: Arc::new(RecordingPresenter::new()),
                navigator: Arc::new(RecordingNavigator::new()),
            },
        )
        .await
        .unwrap();
        Fixture {
            core,
            transport,
            connectivity,
        }
    }

    #[tokio::test]
    async fn test_install_then_activate() {
        let fx = fixture(true).await;
        let mut signals = fx.core.subscribe();
        assert_eq!(fx.core.state(), LifecycleState::Idle);

        let warmed = fx.core.on_install().await.unwrap();
        assert_eq!(warmed.resources, 6);
        assert_eq!(fx.core.state(), LifecycleState::Installed);

        let promoted = fx.core.on_activate().await.unwrap();
        assert_eq!(promoted.current, "lifeline-v1.0.0");
        assert_eq!(fx.core.state(), LifecycleState::Active);
        assert_eq!(
            signals.recv().await.unwrap(),
            CoreSignal::CacheVersionPromoted {
                name: "lifeline-v1.0.0".into()
            }
        );
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let fx = fixture(true).await;

        let err = fx.core.on_activate().await.unwrap_err();

        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert_eq!(fx.core.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_failed_install_sets_state() {
        let fx = fixture(true).await;
        fx.transport.fail(
            &format!("{ORIGIN}/record"),
            HttpError::ConnectionError {
                host: "app.test".into(),
                message: "reset".into(),
            },
        );

        assert!(fx.core.on_install().await.is_err());
        assert_eq!(fx.core.state(), LifecycleState::InstallFailed);
        assert!(fx.core.on_activate().await.is_err());
    }

    #[tokio::test]
    async fn test_submit_offline_is_captured_without_network() {
        let fx = fixture(false).await;

        let receipt = fx
            .core
            .submit_emergency_request(json!({"type": "medical"}))
            .await
            .unwrap();

        assert!(receipt.accepted);
        assert!(receipt.offline);
        assert_eq!(receipt.status, CaptureStatus::CapturedLocally);
        assert!(receipt.record_id.is_some());
        assert_eq!(fx.transport.total_calls(), 0);
        assert_eq!(fx.core.queue_stats().await.unwrap().unsynced, 1);
    }

    #[tokio::test]
    async fn test_submit_online_delivers() {
        let fx = fixture(true).await;
        fx.transport
            .respond_json(&format!("{ORIGIN}/api/emergency"), 201, &json!({"ok": true}));

        let receipt = fx
            .core
            .submit_emergency_request(json!({"type": "fire"}))
            .await
            .unwrap();

        assert_eq!(receipt.status, CaptureStatus::Delivered);
        assert!(!receipt.offline);
        assert_eq!(fx.core.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_submit_online_rejected_falls_back_to_capture() {
        let fx = fixture(true).await;
        fx.transport
            .respond_json(&format!("{ORIGIN}/api/emergency"), 503, &json!({}));

        let receipt = fx
            .core
            .submit_emergency_request(json!({"type": "fire"}))
            .await
            .unwrap();

        assert_eq!(receipt.status, CaptureStatus::CapturedLocally);
        assert_eq!(fx.core.queue_stats().await.unwrap().unsynced, 1);
    }

    #[tokio::test]
    async fn test_connectivity_restored_triggers_sync_once() {
        let fx = fixture(false).await;
        fx.core
            .submit_emergency_request(json!({"n": 1}))
            .await
            .unwrap();
        fx.transport.respond_json(
            &format!("{ORIGIN}/api/emergency/sync"),
            200,
            &json!({}),
        );

        let outcome = fx.core.on_connectivity_changed(true).await.unwrap();
        assert_eq!(outcome.unwrap().report().unwrap().synced.len(), 1);

        // Already online: no second run.
        assert!(fx.core.on_connectivity_changed(true).await.unwrap().is_none());
        assert!(fx.connectivity.is_online());
    }

    #[tokio::test]
    async fn test_periodic_tick_skipped_offline() {
        let fx = fixture(false).await;

        assert!(fx.core.on_periodic_tick().await.unwrap().is_none());
        assert_eq!(fx.transport.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sync_uses_configured_interval() {
        let fx = fixture(false).await;
        let interval = fx.core.context().config.sync_interval();
        fx.core
            .submit_emergency_request(json!({"n": 1}))
            .await
            .unwrap();
        fx.transport.respond_json(
            &format!("{ORIGIN}/api/emergency/sync"),
            200,
            &json!({}),
        );

        let handle = fx.core.spawn_periodic_sync();

        tokio::time::sleep(interval + Duration::from_secs(1)).await;
        assert_eq!(fx.transport.total_calls(), 0);

        fx.connectivity.set_online(true);
        tokio::time::sleep(interval).await;
        handle.abort();

        assert_eq!(
            fx.transport.calls_to(&format!("{ORIGIN}/api/emergency/sync")),
            1
        );
        assert_eq!(fx.core.queue_stats().await.unwrap().unsynced, 0);
    }

    #[tokio::test]
    async fn test_malformed_push_shows_default_alert() {
        let fx = fixture(true).await;

        let alert = fx.core.on_push(Some(b"not json")).await.unwrap();

        assert_eq!(alert.body, "Emergency alert received");
        assert_eq!(alert.tag, "latest");
    }

    #[tokio::test]
    async fn test_unknown_action_only_closes() {
        let fx = fixture(true).await;

        let target = fx
            .core
            .on_notification_action("snooze", Some("3"))
            .await
            .unwrap();

        assert!(target.is_none());
    }
}
