//! In-process fakes for the host-provided traits.
//!
//! Used by the crate's own tests and available to hosts that want to
//! exercise the core without a network, a push service or a UI.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::capabilities::{
    HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    PermissionState, PushError, PushPlatform, PushResult, RegisterOptions,
};
use crate::notify::{AlertPresenter, Navigator, NotifyError, RenderedAlert};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResult + Send + Sync>;

/// Transport answering from a per-URL script. Unscripted URLs fail with a
/// connection error, as does everything while offline.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Handler>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Mutex<Option<Duration>>,
    offline: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: HttpResponse) {
        self.respond_with(url, move |_| Ok(response.clone()));
    }

    pub fn respond_json(&self, url: &str, status: u16, body: &serde_json::Value) {
        let mut headers = HttpHeaders::new();
        let _ = headers.insert("Content-Type", "application/json");
        let body = body.to_string();
        self.respond(url, HttpResponse::new(status, headers, body));
    }

    pub fn fail(&self, url: &str, error: HttpError) {
        self.respond_with(url, move |_| Err(error.clone()));
    }

    pub fn respond_with<F>(&self, url: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static,
    {
        lock(&self.routes).insert(url.to_string(), Arc::new(handler));
    }

    /// Every request waits this long (tokio time) before being answered.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.url().as_str() == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn connection_refused(request: &HttpRequest) -> HttpError {
        HttpError::ConnectionError {
            host: request.url().as_str().to_string(),
            message: "connection refused".into(),
        }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> HttpResult {
        lock(&self.requests).push(request.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.offline.load(Ordering::SeqCst) {
            Err(Self::connection_refused(&request))
        } else {
            let handler = lock(&self.routes).get(request.url().as_str()).cloned();
            match handler {
                Some(handler) => handler(&request),
                None => Err(Self::connection_refused(&request)),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    paths: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.paths).clone()
    }
}

#[async_trait::async_trait]
impl Navigator for RecordingNavigator {
    async fn navigate_to(&self, path: &str) -> Result<(), NotifyError> {
        lock(&self.paths).push(path.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    shown: Mutex<Vec<RenderedAlert>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<RenderedAlert> {
        lock(&self.shown).clone()
    }

    pub fn closed(&self) -> Vec<String> {
        lock(&self.closed).clone()
    }
}

#[async_trait::async_trait]
impl AlertPresenter for RecordingPresenter {
    async fn show(&self, alert: &RenderedAlert) -> Result<(), NotifyError> {
        lock(&self.shown).push(alert.clone());
        Ok(())
    }

    async fn close(&self, tag: &str) -> Result<(), NotifyError> {
        lock(&self.closed).push(tag.to_string());
        Ok(())
    }
}

/// Push platform with a fixed permission state and token.
pub struct StaticPushPlatform {
    available: bool,
    permission: Mutex<PermissionState>,
    granted_on_request: PermissionState,
    token: Option<String>,
    permission_requests: AtomicUsize,
}

impl StaticPushPlatform {
    pub fn new(permission: PermissionState) -> Self {
        Self {
            available: true,
            permission: Mutex::new(permission),
            granted_on_request: PermissionState::Denied,
            token: None,
            permission_requests: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(PermissionState::NotDetermined)
        }
    }

    /// State the user "chooses" when asked.
    #[must_use]
    pub fn granting(mut self, state: PermissionState) -> Self {
        self.granted_on_request = state;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PushPlatform for StaticPushPlatform {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn permission_status(&self) -> PermissionState {
        *lock(&self.permission)
    }

    async fn request_permission(&self) -> PushResult<PermissionState> {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        *lock(&self.permission) = self.granted_on_request;
        Ok(self.granted_on_request)
    }

    async fn register(&self, _options: RegisterOptions) -> PushResult<String> {
        self.token
            .clone()
            .ok_or_else(|| PushError::registration_failed("no token configured"))
    }
}
