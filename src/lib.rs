// lib.rs - Offline-resilient request cache and durable sync core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod lifecycle;
pub mod notify;
pub mod offline_store;
pub mod queue;
pub mod resource_cache;
pub mod router;
pub mod signals;
pub mod sync;
pub mod telemetry;
pub mod testing;
pub mod time;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capabilities::{HttpError, HttpRequest, HttpResponse, HttpTransport, PushError};
pub use config::{ConfigError, Connectivity, CoreConfig, CoreContext};
pub use lifecycle::{CaptureStatus, CoreDeps, LifecycleState, OfflineCore, SubmitReceipt};
pub use notify::{AlertAction, AlertPayload, NotificationDispatcher, NotifyError, RenderedAlert};
pub use offline_store::{FileQueueStorage, StoreError};
pub use queue::{DurableQueue, EmergencyRecord, QueueError, QueueStats, RecordId};
pub use resource_cache::{CacheError, MemoryCacheStorage, ResourceCache};
pub use router::{InboundRequest, RouteError, Router};
pub use signals::{CoreSignal, SignalBus};
pub use sync::{SyncEngine, SyncError, SyncOutcome, SyncReport, SyncTrigger};
pub use time::{Clock, ManualClock, SystemClock, UnixTimeMs};

#[cfg(not(target_arch = "wasm32"))]
pub use queue::SqliteQueueStorage;
#[cfg(not(target_arch = "wasm32"))]
pub use resource_cache::SqliteCacheStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    NotFound,
    Storage,
    Corrupted,
    Configuration,
    PermissionDenied,
    FeatureUnavailable,
    Presentation,
    InvalidState,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE_ERROR",
            Self::Corrupted => "DATA_CORRUPTED",
            Self::Configuration => "CONFIG_ERROR",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            Self::Presentation => "PRESENTATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The action was not captured.
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("invalid lifecycle state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

fn http_kind(e: &HttpError) -> ErrorKind {
    match e {
        HttpError::Timeout { .. } => ErrorKind::Timeout,
        e if e.is_network_failure() => ErrorKind::Network,
        _ => ErrorKind::Validation,
    }
}

fn queue_kind(e: &QueueError) -> ErrorKind {
    match e {
        QueueError::Validation(_) => ErrorKind::Validation,
        QueueError::Corrupted { .. } => ErrorKind::Corrupted,
        QueueError::Store(StoreError::Corrupted { .. } | StoreError::IntegrityCheckFailed { .. }) => {
            ErrorKind::Corrupted
        }
        _ => ErrorKind::Storage,
    }
}

impl CoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Cache(e) => match e {
                CacheError::Fetch { source, .. } => http_kind(source),
                CacheError::BadStatus { .. } => ErrorKind::NotFound,
                CacheError::InvalidVersion(_)
                | CacheError::InvalidResource { .. }
                | CacheError::TooLarge { .. } => ErrorKind::Validation,
                CacheError::NothingWarmed => ErrorKind::InvalidState,
                CacheError::Corrupted { .. } => ErrorKind::Corrupted,
                CacheError::Storage(_) | CacheError::LockFailed => ErrorKind::Storage,
            },
            Self::Queue(e) => queue_kind(e),
            Self::Route(e) => match e {
                RouteError::Malformed(_) | RouteError::MalformedPayload(_) => {
                    ErrorKind::Validation
                }
                RouteError::NotCaptured(e) => queue_kind(e),
                RouteError::Network(e) | RouteError::OfflinePageMissing(e) => http_kind(e),
            },
            Self::Sync(e) => match e {
                SyncError::Queue(e) => queue_kind(e),
                SyncError::Endpoint(_) => ErrorKind::Configuration,
            },
            Self::Notify(_) => ErrorKind::Presentation,
            Self::Push(e) => match e {
                PushError::NotAvailable => ErrorKind::FeatureUnavailable,
                PushError::PermissionDenied => ErrorKind::PermissionDenied,
                PushError::Timeout => ErrorKind::Timeout,
                PushError::Network { .. } => ErrorKind::Network,
                PushError::RegistrationFailed { .. } | PushError::Unknown { .. } => {
                    ErrorKind::Validation
                }
            },
            Self::Http(e) => http_kind(e),
            Self::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // Durability failures end the operation: the action was not stored.
            Self::Queue(e) | Self::Route(RouteError::NotCaptured(e)) | Self::Sync(SyncError::Queue(e))
                if e.is_durability_failure() =>
            {
                ErrorSeverity::Fatal
            }
            Self::Push(e) if e.is_retryable() => ErrorSeverity::Transient,
            // A failed warm is final for this install.
            Self::Cache(
                CacheError::Fetch { .. } | CacheError::BadStatus { .. } | CacheError::TooLarge { .. },
            ) => ErrorSeverity::Permanent,
            _ => match self.kind() {
                ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Storage => {
                    ErrorSeverity::Transient
                }
                ErrorKind::Corrupted | ErrorKind::InvalidState => ErrorSeverity::Fatal,
                _ => ErrorSeverity::Permanent,
            },
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.severity() == ErrorSeverity::Transient
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind() {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Storage | ErrorKind::Corrupted => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::PermissionDenied => {
                "Notifications are disabled. Enable them in settings to receive alerts.".into()
            }
            ErrorKind::FeatureUnavailable => {
                "This feature is not available on your device.".into()
            }
            ErrorKind::Validation
            | ErrorKind::Configuration
            | ErrorKind::Presentation
            | ErrorKind::InvalidState => "Something went wrong. Please try again.".into(),
        }
    }
}
