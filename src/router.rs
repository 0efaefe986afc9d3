//! Picks exactly one strategy per outbound request.
//!
//! Priority: offline emergency capture, then navigation with an offline
//! page fallback, then cache-first for `GET`, then network-only.

use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{CacheKey, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::config::CoreContext;
use crate::queue::{DurableQueue, EmergencyRecord, QueueError, RecordDraft};
use crate::resource_cache::{ResourceCache, CACHEABLE_STATUS};
use crate::signals::{CoreSignal, SignalBus};

pub const CAPTURED_MESSAGE: &str = "Emergency alert stored locally. Will sync when online.";
pub const CAPTURE_FAILED_MESSAGE: &str = "Emergency request failed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub request: HttpRequest,
    pub mode: RequestMode,
}

impl InboundRequest {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            mode: RequestMode::Other,
        }
    }

    pub fn navigate(request: HttpRequest) -> Self {
        Self {
            request,
            mode: RequestMode::Navigate,
        }
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    OfflineEmergency,
    Navigation,
    CacheFirst,
    NetworkOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
    LocalCapture,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResponse {
    pub response: HttpResponse,
    pub source: ResponseSource,
    /// Set when the request was captured into the queue.
    pub record: Option<EmergencyRecord>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("emergency payload is not valid JSON: {0}")]
    MalformedPayload(String),

    #[error("emergency request was not captured: {0}")]
    NotCaptured(#[source] QueueError),

    #[error("network error: {0}")]
    Network(#[from] HttpError),

    #[error("offline and no cached offline page: {0}")]
    OfflinePageMissing(#[source] HttpError),
}

impl RouteError {
    /// True when an emergency action was handed to the core and not stored.
    pub fn is_capture_failure(&self) -> bool {
        matches!(self, RouteError::NotCaptured(_) | RouteError::MalformedPayload(_))
    }
}

pub struct Router {
    cache: Arc<ResourceCache>,
    queue: Arc<DurableQueue>,
    transport: Arc<dyn HttpTransport>,
    ctx: CoreContext,
    signals: SignalBus,
}

impl Router {
    pub fn new(
        cache: Arc<ResourceCache>,
        queue: Arc<DurableQueue>,
        transport: Arc<dyn HttpTransport>,
        ctx: CoreContext,
        signals: SignalBus,
    ) -> Self {
        Self {
            cache,
            queue,
            transport,
            ctx,
            signals,
        }
    }

    fn is_emergency_submission(&self, request: &HttpRequest) -> bool {
        let path = request.url().path();
        path.contains(self.ctx.config.emergency_path.as_str())
            && !path.starts_with(self.ctx.config.sync_path.as_str())
    }

    /// Rejects malformed shapes, then applies the routing rules in order.
    pub fn classify(&self, inbound: &InboundRequest) -> Result<RouteKind, RouteError> {
        let method = inbound.request.method();
        if inbound.is_navigation() && method != HttpMethod::Get {
            return Err(RouteError::Malformed(format!(
                "navigation must be GET, got {}",
                method.as_str()
            )));
        }

        if self.is_emergency_submission(&inbound.request) && !self.ctx.connectivity.is_online() {
            return Ok(RouteKind::OfflineEmergency);
        }
        if inbound.is_navigation() {
            return Ok(RouteKind::Navigation);
        }
        if CacheKey::for_request(&inbound.request).is_some() {
            return Ok(RouteKind::CacheFirst);
        }
        Ok(RouteKind::NetworkOnly)
    }

    #[instrument(skip(self, inbound), fields(method = inbound.request.method().as_str(), url = %inbound.request.url()))]
    pub async fn route(&self, inbound: InboundRequest) -> Result<RoutedResponse, RouteError> {
        let kind = self.classify(&inbound)?;
        debug!(?kind, "routing request");

        match kind {
            RouteKind::OfflineEmergency => self.capture_request(&inbound.request).await,
            RouteKind::Navigation => self.navigate(inbound.request).await,
            RouteKind::CacheFirst => self.cache_first(inbound.request).await,
            RouteKind::NetworkOnly => Ok(RoutedResponse {
                response: self.fetch(inbound.request).await?,
                source: ResponseSource::Network,
                record: None,
            }),
        }
    }

    async fn capture_request(&self, request: &HttpRequest) -> Result<RoutedResponse, RouteError> {
        let payload = match request.body() {
            Some(body) if !body.iter().all(u8::is_ascii_whitespace) => serde_json::from_slice(body)
                .map_err(|e| RouteError::MalformedPayload(e.to_string()))?,
            _ => json!({}),
        };
        let record = self.capture(payload).await?;
        let response = captured_response(&record)?;
        Ok(RoutedResponse {
            response,
            source: ResponseSource::LocalCapture,
            record: Some(record),
        })
    }

    /// Stores an emergency payload durably and tells subscribers it was
    /// captured, not delivered. Never touches the network.
    pub async fn capture(&self, payload: serde_json::Value) -> Result<EmergencyRecord, RouteError> {
        let draft = RecordDraft::new(self.ctx.config.record_kind.clone(), payload);
        let record = self.queue.enqueue(draft).await.map_err(|e| {
            error!(error = %e, "emergency action NOT captured");
            RouteError::NotCaptured(e)
        })?;

        info!(id = %record.id, "emergency action captured offline");
        self.signals.emit(CoreSignal::OfflineCaptured {
            id: record.id,
            vibrate_pattern: self.ctx.config.capture_vibrate_pattern.clone(),
        });
        Ok(record)
    }

    async fn navigate(&self, request: HttpRequest) -> Result<RoutedResponse, RouteError> {
        match self.fetch(request).await {
            Ok(response) => Ok(RoutedResponse {
                response,
                source: ResponseSource::Network,
                record: None,
            }),
            Err(e) if e.is_network_failure() => self.offline_page(e).await,
            Err(e) => Err(RouteError::Network(e)),
        }
    }

    async fn offline_page(&self, cause: HttpError) -> Result<RoutedResponse, RouteError> {
        let Ok(url) = self.ctx.config.resolve(&self.ctx.config.offline_page) else {
            return Err(RouteError::OfflinePageMissing(cause));
        };
        match self.cache.lookup(&CacheKey::from_url(&url)).await {
            Ok(Some(entry)) => {
                debug!(error = %cause, "serving offline page");
                Ok(RoutedResponse {
                    response: entry.to_response(),
                    source: ResponseSource::OfflineFallback,
                    record: None,
                })
            }
            Ok(None) => Err(RouteError::OfflinePageMissing(cause)),
            Err(e) => {
                warn!(error = %e, "offline page lookup failed");
                Err(RouteError::OfflinePageMissing(cause))
            }
        }
    }

    async fn cache_first(&self, request: HttpRequest) -> Result<RoutedResponse, RouteError> {
        let Some(key) = CacheKey::for_request(&request) else {
            return Err(RouteError::Malformed("cache-first requires GET".into()));
        };

        match self.cache.lookup(&key).await {
            Ok(Some(entry)) => {
                return Ok(RoutedResponse {
                    response: entry.to_response(),
                    source: ResponseSource::Cache,
                    record: None,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "cache lookup failed, going to network"),
        }

        let response = self.fetch(request).await?;
        if response.status() == CACHEABLE_STATUS {
            self.store_in_background(key, response.clone());
        }
        Ok(RoutedResponse {
            response,
            source: ResponseSource::Network,
            record: None,
        })
    }

    /// Failures are logged and never reach the caller.
    fn store_in_background(&self, key: CacheKey, response: HttpResponse) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            if let Err(e) = cache.store(&key, &response).await {
                warn!(%key, error = %e, "failed to cache response");
            }
        });
    }

    /// Sends with the request's own timeout enforced here as well.
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let timeout = request.timeout();
        let request_id = request.request_id().to_string();
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(HttpError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                request_id,
            }),
        }
    }
}

pub fn captured_response(record: &EmergencyRecord) -> Result<HttpResponse, HttpError> {
    HttpResponse::json(
        200,
        &json!({
            "success": true,
            "message": CAPTURED_MESSAGE,
            "offline": true,
            "id": record.id,
        }),
    )
}

pub fn capture_failed_response() -> Result<HttpResponse, HttpError> {
    HttpResponse::json(
        500,
        &json!({
            "success": false,
            "message": CAPTURE_FAILED_MESSAGE,
            "offline": true,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::HttpHeaders;
    use crate::config::{Connectivity, CoreConfig};
    use crate::queue::MemoryQueueStorage;
    use crate::resource_cache::MemoryCacheStorage;
    use crate::testing::ScriptedTransport;
    use crate::time::SystemClock;

    struct Fixture {
        router: Router,
        cache: Arc<ResourceCache>,
        queue: Arc<DurableQueue>,
        transport: Arc<ScriptedTransport>,
        connectivity: Connectivity,
        signals: SignalBus,
    }

    fn page(body: &'static str) -> HttpResponse {
        HttpResponse::new(200, HttpHeaders::new(), body)
    }

    async fn fixture() -> Fixture {
        let connectivity = Connectivity::new(true);
        let ctx = CoreContext::new(CoreConfig {
            origin: "https://app.test/".into(),
            critical_resources: vec!["/".into(), "/offline".into()],
            ..CoreConfig::default()
        })
        .unwrap()
        .with_connectivity(connectivity.clone());

        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("https://app.test/", page("home"));
        transport.respond("https://app.test/offline", page("offline page"));

        let cache = Arc::new(ResourceCache::new(
            Arc::new(MemoryCacheStorage::new()),
            transport.clone(),
            ctx.clone(),
        ));
        cache.warm(&ctx.config.critical_resources).await.unwrap();
        cache.promote().await.unwrap();

        let queue = Arc::new(
            DurableQueue::open(Arc::new(MemoryQueueStorage::new()), Arc::new(SystemClock))
                .await
                .unwrap(),
        );
        let signals = SignalBus::default();
        let router = Router::new(
            cache.clone(),
            queue.clone(),
            transport.clone(),
            ctx,
            signals.clone(),
        );
        Fixture {
            router,
            cache,
            queue,
            transport,
            connectivity,
            signals,
        }
    }

    fn emergency_post(body: &str) -> InboundRequest {
        InboundRequest::new(
            HttpRequest::post("https://app.test/api/emergency")
                .unwrap()
                .with_body(body.to_string())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_offline_emergency_never_reaches_network() {
        let fx = fixture().await;
        fx.connectivity.set_online(false);
        let before = fx.transport.total_calls();
        let mut rx = fx.signals.subscribe();

        let routed = fx.router.route(emergency_post(r#"{"lat": 1.0}"#)).await.unwrap();

        assert_eq!(fx.transport.total_calls(), before);
        assert_eq!(routed.source, ResponseSource::LocalCapture);
        let body: serde_json::Value = routed.response.parse_json().unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["offline"], true);
        assert_eq!(body["message"], CAPTURED_MESSAGE);

        let record = routed.record.unwrap();
        assert_eq!(body["id"], json!(record.id.as_u64()));
        assert_eq!(record.payload, json!({"lat": 1.0}));
        assert_eq!(fx.queue.list_unsynced().await.unwrap(), vec![record.clone()]);
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreSignal::OfflineCaptured {
                id: record.id,
                vibrate_pattern: vec![200, 100, 200, 100, 200]
            }
        );
    }

    #[tokio::test]
    async fn test_online_emergency_goes_to_network() {
        let fx = fixture().await;
        fx.transport.respond_json(
            "https://app.test/api/emergency",
            201,
            &json!({"success": true}),
        );

        let routed = fx.router.route(emergency_post("{}")).await.unwrap();

        assert_eq!(routed.source, ResponseSource::Network);
        assert_eq!(routed.response.status(), 201);
        assert!(fx.queue.list_unsynced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_endpoint_is_not_captured() {
        let fx = fixture().await;
        fx.connectivity.set_online(false);
        let inbound = InboundRequest::new(
            HttpRequest::post("https://app.test/api/emergency/sync").unwrap(),
        );

        assert_eq!(fx.router.classify(&inbound).unwrap(), RouteKind::NetworkOnly);
    }

    #[tokio::test]
    async fn test_malformed_emergency_payload_is_rejected() {
        let fx = fixture().await;
        fx.connectivity.set_online(false);

        let err = fx.router.route(emergency_post("not json")).await.unwrap_err();

        assert!(err.is_capture_failure());
        assert!(fx.queue.list_unsynced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_navigation_failure_serves_offline_page() {
        let fx = fixture().await;
        fx.transport.set_offline(true);
        let inbound = InboundRequest::navigate(HttpRequest::get("https://app.test/record").unwrap());

        let routed = fx.router.route(inbound).await.unwrap();

        assert_eq!(routed.source, ResponseSource::OfflineFallback);
        assert_eq!(routed.response.body().as_ref(), b"offline page");
    }

    #[tokio::test]
    async fn test_navigation_non_get_is_malformed() {
        let fx = fixture().await;
        let inbound = InboundRequest::navigate(HttpRequest::post("https://app.test/").unwrap());

        assert!(matches!(
            fx.router.route(inbound).await,
            Err(RouteError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let fx = fixture().await;
        let before = fx.transport.total_calls();

        let routed = fx
            .router
            .route(InboundRequest::new(HttpRequest::get("https://app.test/").unwrap()))
            .await
            .unwrap();

        assert_eq!(routed.source, ResponseSource::Cache);
        assert_eq!(routed.response.body().as_ref(), b"home");
        assert_eq!(fx.transport.total_calls(), before);
    }

    #[tokio::test]
    async fn test_cache_miss_fetches_and_stores_in_background() {
        let fx = fixture().await;
        fx.transport.respond("https://app.test/app.js", page("js"));
        let request = || InboundRequest::new(HttpRequest::get("https://app.test/app.js").unwrap());
        let key = CacheKey::new("https://app.test/app.js").unwrap();

        let routed = fx.router.route(request()).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Network);

        let mut cached = None;
        for _ in 0..100 {
            cached = fx.cache.lookup(&key).await.unwrap();
            if cached.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cached.unwrap().body.as_ref(), b"js");

        let again = fx.router.route(request()).await.unwrap();
        assert_eq!(again.source, ResponseSource::Cache);
        assert_eq!(fx.transport.calls_to("https://app.test/app.js"), 1);
    }

    #[tokio::test]
    async fn test_cache_miss_with_network_failure_is_an_error() {
        let fx = fixture().await;
        fx.transport.set_offline(true);

        let result = fx
            .router
            .route(InboundRequest::new(HttpRequest::get("https://app.test/img.png").unwrap()))
            .await;

        assert!(matches!(result, Err(RouteError::Network(_))));
    }

    #[tokio::test]
    async fn test_non_200_is_returned_but_not_cached() {
        let fx = fixture().await;
        fx.transport.respond(
            "https://app.test/gone",
            HttpResponse::new(404, HttpHeaders::new(), "nope"),
        );

        let routed = fx
            .router
            .route(InboundRequest::new(HttpRequest::get("https://app.test/gone").unwrap()))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(routed.response.status(), 404);
        let key = CacheKey::new("https://app.test/gone").unwrap();
        assert!(fx.cache.lookup(&key).await.unwrap().is_none());
    }

    #[test]
    fn test_capture_failed_response_shape() {
        let response = capture_failed_response().unwrap();
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.parse_json().unwrap();
        assert_eq!(
            body,
            json!({"success": false, "message": CAPTURE_FAILED_MESSAGE, "offline": true})
        );
    }
}
