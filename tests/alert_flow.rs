use lifeline::capabilities::{HttpRequest, PermissionState, PushError, RegisterOptions};
use lifeline::queue::MemoryQueueStorage;
use lifeline::resource_cache::MemoryCacheStorage;
use lifeline::testing::{
    RecordingNavigator, RecordingPresenter, ScriptedTransport, StaticPushPlatform,
};
use lifeline::{
    Connectivity, CoreConfig, CoreContext, CoreDeps, CoreError, InboundRequest, OfflineCore,
};
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    core: OfflineCore,
    presenter: Arc<RecordingPresenter>,
    navigator: Arc<RecordingNavigator>,
}

async fn harness(online: bool) -> Harness {
    let presenter = Arc::new(RecordingPresenter::new());
    let navigator = Arc::new(RecordingNavigator::new());
    let ctx = CoreContext::new(CoreConfig {
        origin: "https://lifeline.test/".into(),
        ..CoreConfig::default()
    })
    .unwrap()
    .with_connectivity(Connectivity::new(online));

    let core = OfflineCore::open(
        ctx,
        CoreDeps {
            transport: Arc::new(ScriptedTransport::new()),
            cache_storage: Arc::new(MemoryCacheStorage::new()),
            queue_storage: Arc::new(MemoryQueueStorage::new()),
            presenter: presenter.clone(),
            navigator: navigator.clone(),
        },
    )
    .await
    .unwrap();

    Harness {
        core,
        presenter,
        navigator,
    }
}

#[tokio::test]
async fn push_then_view_navigates_to_alert() {
    let h = harness(true).await;

    // 1. Push arrives
    let alert = h
        .core
        .on_push(Some(br#"{"id": "flood-7", "message": "Flash flood warning"}"#))
        .await
        .unwrap();
    assert_eq!(alert.title, "Emergency Alert");
    assert_eq!(alert.body, "Flash flood warning");
    assert_eq!(alert.tag, "flood-7");
    assert!(alert.require_interaction);
    assert_eq!(h.presenter.shown().len(), 1);

    // 2. User taps "View"
    let target = h
        .core
        .on_notification_action("view", Some("flood-7"))
        .await
        .unwrap();
    assert_eq!(target.as_deref(), Some("/emergency?alert=flood-7"));
    assert_eq!(h.navigator.paths(), vec!["/emergency?alert=flood-7".to_string()]);
    assert_eq!(h.presenter.closed(), vec!["flood-7".to_string()]);
}

#[tokio::test]
async fn push_without_payload_and_dismiss() {
    let h = harness(true).await;

    let alert = h.core.on_push(None).await.unwrap();
    assert_eq!(alert.body, "Emergency alert received");
    assert_eq!(alert.vibrate, vec![200, 100, 200]);

    let target = h
        .core
        .on_notification_action("dismiss", None)
        .await
        .unwrap();
    assert!(target.is_none());
    assert!(h.navigator.paths().is_empty());
    assert_eq!(h.presenter.closed(), vec!["latest".to_string()]);
}

#[tokio::test]
async fn push_registration_walks_permission_prompt() {
    let h = harness(true).await;
    let platform = StaticPushPlatform::new(PermissionState::NotDetermined)
        .granting(PermissionState::Authorized)
        .with_token("device-token");

    let token = h
        .core
        .register_for_push_alerts(&platform, RegisterOptions::default())
        .await
        .unwrap();

    assert_eq!(token, "device-token");
    assert_eq!(platform.permission_requests(), 1);
}

#[tokio::test]
async fn push_registration_unavailable() {
    let h = harness(true).await;

    let err = h
        .core
        .register_for_push_alerts(&StaticPushPlatform::unavailable(), RegisterOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Push(PushError::NotAvailable)));
    assert_eq!(err.code(), "FEATURE_UNAVAILABLE");
}

#[tokio::test]
async fn malformed_offline_emergency_gets_failure_response() {
    let h = harness(false).await;
    let request = HttpRequest::post("https://lifeline.test/api/emergency")
        .unwrap()
        .with_body("{not json")
        .unwrap();

    let response = h.core.on_fetch(InboundRequest::new(request)).await.unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.parse_json().unwrap();
    assert_eq!(
        body,
        json!({"success": false, "message": "Emergency request failed", "offline": true})
    );
    assert_eq!(h.core.queue_stats().await.unwrap().total, 0);
}
