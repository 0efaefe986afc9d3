//! Inbound push alerts and their actions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::NotificationConfig;

/// Sentinel used in the view target when the alert carries no id.
pub const LATEST_ALERT: &str = "latest";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("malformed push payload: {0}")]
    MalformedPayload(String),

    #[error("failed to present alert: {0}")]
    Presenter(String),

    #[error("navigation failed: {0}")]
    Navigation(String),
}

/// Shows and closes system alerts on the host.
#[async_trait::async_trait]
pub trait AlertPresenter: Send + Sync {
    async fn show(&self, alert: &RenderedAlert) -> Result<(), NotifyError>;
    async fn close(&self, tag: &str) -> Result<(), NotifyError>;
}

/// Application navigation callback.
#[async_trait::async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate_to(&self, path: &str) -> Result<(), NotifyError>;
}

/// Data delivered with a push message. Any JSON object is accepted;
/// `message` and `id` are the only fields read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertPayload {
    data: Map<String, Value>,
}

impl AlertPayload {
    pub fn from_json(bytes: &[u8]) -> Result<Self, NotifyError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| NotifyError::MalformedPayload(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, NotifyError> {
        match value {
            Value::Object(data) => Ok(Self { data }),
            other => Err(NotifyError::MalformedPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Non-empty `message`, if any.
    pub fn message(&self) -> Option<&str> {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
    }

    /// `id` as a string; numbers are accepted too.
    pub fn alert_id(&self) -> Option<String> {
        match self.data.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    View,
    Dismiss,
}

impl AlertAction {
    /// `None` for a tap on the alert body or an unknown action id.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "view" => Some(Self::View),
            "dismiss" => Some(Self::Dismiss),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Dismiss => "dismiss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertButton {
    pub action: AlertAction,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedAlert {
    /// Alert id, or `latest` when the payload has none.
    pub tag: String,
    pub title: String,
    pub body: String,
    /// Always true: the alert stays until the user acts on it.
    pub require_interaction: bool,
    pub actions: Vec<AlertButton>,
    pub vibrate: Vec<u32>,
    pub data: Option<AlertPayload>,
}

pub struct NotificationDispatcher {
    config: NotificationConfig,
    presenter: Arc<dyn AlertPresenter>,
    navigator: Arc<dyn Navigator>,
}

impl NotificationDispatcher {
    pub fn new(
        config: NotificationConfig,
        presenter: Arc<dyn AlertPresenter>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            config,
            presenter,
            navigator,
        }
    }

    pub fn render(&self, payload: Option<AlertPayload>) -> RenderedAlert {
        let body = payload
            .as_ref()
            .and_then(AlertPayload::message)
            .unwrap_or(self.config.default_message.as_str())
            .to_string();
        let tag = payload
            .as_ref()
            .and_then(AlertPayload::alert_id)
            .unwrap_or_else(|| LATEST_ALERT.to_string());

        RenderedAlert {
            tag,
            title: self.config.title.clone(),
            body,
            require_interaction: true,
            actions: vec![
                AlertButton {
                    action: AlertAction::View,
                    title: "View Alert".into(),
                },
                AlertButton {
                    action: AlertAction::Dismiss,
                    title: "Dismiss".into(),
                },
            ],
            vibrate: self.config.vibrate_pattern.clone(),
            data: payload,
        }
    }

    #[instrument(skip(self, payload))]
    pub async fn on_alert_received(
        &self,
        payload: Option<AlertPayload>,
    ) -> Result<RenderedAlert, NotifyError> {
        let alert = self.render(payload);
        self.presenter.show(&alert).await?;
        info!(tag = %alert.tag, "emergency alert shown");
        Ok(alert)
    }

    /// Closes the alert; `View` also navigates to it. Returns the path
    /// navigated to, if any.
    #[instrument(skip(self))]
    pub async fn on_action_selected(
        &self,
        action: Option<AlertAction>,
        alert_id: Option<&str>,
    ) -> Result<Option<String>, NotifyError> {
        let alert_id = alert_id.filter(|id| !id.is_empty());
        self.presenter
            .close(alert_id.unwrap_or(LATEST_ALERT))
            .await?;

        if action != Some(AlertAction::View) {
            debug!("alert closed");
            return Ok(None);
        }

        let target = self.view_target(alert_id);
        self.navigator.navigate_to(&target).await?;
        info!(%target, "navigated to alert");
        Ok(Some(target))
    }

    pub fn view_target(&self, alert_id: Option<&str>) -> String {
        let id = alert_id.unwrap_or(LATEST_ALERT);
        let encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
        format!("{}?alert={encoded}", self.config.view_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingNavigator, RecordingPresenter};
    use serde_json::json;

    struct Fixture {
        dispatcher: NotificationDispatcher,
        presenter: Arc<RecordingPresenter>,
        navigator: Arc<RecordingNavigator>,
    }

    fn fixture() -> Fixture {
        let presenter = Arc::new(RecordingPresenter::new());
        let navigator = Arc::new(RecordingNavigator::new());
        Fixture {
            dispatcher: NotificationDispatcher::new(
                NotificationConfig::default(),
                presenter.clone(),
                navigator.clone(),
            ),
            presenter,
            navigator,
        }
    }

    #[tokio::test]
    async fn test_default_message_without_payload() {
        let fx = fixture();

        let alert = fx.dispatcher.on_alert_received(None).await.unwrap();

        assert_eq!(alert.title, "Emergency Alert");
        assert_eq!(alert.body, "Emergency alert received");
        assert!(alert.require_interaction);
        assert_eq!(alert.vibrate, vec![200, 100, 200]);
        assert_eq!(alert.tag, LATEST_ALERT);
        assert_eq!(fx.presenter.shown(), vec![alert]);
    }

    #[tokio::test]
    async fn test_payload_message_overrides_default() {
        let fx = fixture();
        let payload = AlertPayload::from_json(br#"{"id": 17, "message": "Fire nearby"}"#).unwrap();

        let alert = fx.dispatcher.on_alert_received(Some(payload.clone())).await.unwrap();

        assert_eq!(alert.body, "Fire nearby");
        assert_eq!(alert.tag, "17");
        assert_eq!(alert.data, Some(payload));
        assert_eq!(
            alert.actions.iter().map(|a| a.action).collect::<Vec<_>>(),
            vec![AlertAction::View, AlertAction::Dismiss]
        );
    }

    #[test]
    fn test_empty_message_falls_back_to_default() {
        let fx = fixture();
        let payload = AlertPayload::from_value(json!({"message": ""})).unwrap();
        assert_eq!(fx.dispatcher.render(Some(payload)).body, "Emergency alert received");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(AlertPayload::from_json(b"[1]").is_err());
        assert!(AlertPayload::from_json(b"plain text").is_err());
    }

    #[tokio::test]
    async fn test_view_navigates_with_alert_id() {
        let fx = fixture();

        let target = fx
            .dispatcher
            .on_action_selected(Some(AlertAction::View), Some("a b&c"))
            .await
            .unwrap();

        assert_eq!(target.as_deref(), Some("/emergency?alert=a+b%26c"));
        assert_eq!(fx.navigator.paths(), vec!["/emergency?alert=a+b%26c".to_string()]);
        assert_eq!(fx.presenter.closed(), vec!["a b&c".to_string()]);
    }

    #[tokio::test]
    async fn test_view_without_id_uses_latest() {
        let fx = fixture();

        fx.dispatcher
            .on_action_selected(Some(AlertAction::View), None)
            .await
            .unwrap();

        assert_eq!(fx.navigator.paths(), vec!["/emergency?alert=latest".to_string()]);
    }

    #[tokio::test]
    async fn test_dismiss_only_closes() {
        let fx = fixture();

        let target = fx
            .dispatcher
            .on_action_selected(Some(AlertAction::Dismiss), Some("5"))
            .await
            .unwrap();

        assert!(target.is_none());
        assert!(fx.navigator.paths().is_empty());
        assert_eq!(fx.presenter.closed(), vec!["5".to_string()]);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(AlertAction::parse("view"), Some(AlertAction::View));
        assert_eq!(AlertAction::parse("dismiss"), Some(AlertAction::Dismiss));
        assert_eq!(AlertAction::parse(""), None);
    }
}
