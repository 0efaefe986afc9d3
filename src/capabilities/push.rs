use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Denied,
    Authorized,
    Provisional,
    Ephemeral,
}

impl PermissionState {
    #[must_use]
    pub const fn is_authorized(self) -> bool {
        matches!(self, Self::Authorized | Self::Provisional | Self::Ephemeral)
    }

    #[must_use]
    pub const fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }

    #[must_use]
    pub const fn needs_request(self) -> bool {
        matches!(self, Self::NotDetermined)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegisterOptions {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushError {
    #[error("push notifications not available on this platform")]
    NotAvailable,

    #[error("permission denied by user")]
    PermissionDenied,

    #[error("registration failed: {reason}")]
    RegistrationFailed {
        reason: String,
        #[serde(default)]
        platform_code: Option<String>,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("network error: {message}")]
    Network {
        message: String,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl PushError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { is_retryable, .. } | Self::RegistrationFailed { is_retryable, .. } => {
                *is_retryable
            }
            Self::Timeout => true,
            Self::NotAvailable | Self::PermissionDenied | Self::Unknown { .. } => false,
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            is_retryable: true,
        }
    }

    #[must_use]
    pub fn registration_failed(reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            reason: reason.into(),
            platform_code: None,
            is_retryable: false,
        }
    }
}

pub type PushResult<T> = Result<T, PushError>;

/// Host push service (APNs/FCM/Web Push). Implemented by the platform shell.
#[async_trait::async_trait]
pub trait PushPlatform: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn permission_status(&self) -> PermissionState;
    async fn request_permission(&self) -> PushResult<PermissionState>;
    /// Returns the device token for this installation.
    async fn register(&self, options: RegisterOptions) -> PushResult<String>;
}

/// Walks the availability, permission and registration steps in order.
#[instrument(skip(platform))]
pub async fn register_for_push_alerts(
    platform: &dyn PushPlatform,
    options: RegisterOptions,
) -> PushResult<String> {
    if !platform.is_available().await {
        warn!("push notifications unavailable on this platform");
        return Err(PushError::NotAvailable);
    }

    let mut permission = platform.permission_status().await;
    if permission.needs_request() {
        permission = platform.request_permission().await?;
    }

    if !permission.is_authorized() {
        warn!(?permission, "push permission not granted");
        return Err(PushError::PermissionDenied);
    }

    let token = platform.register(options).await?;
    info!("registered for push alerts");
    Ok(token)
}
