//! Host-provided effects.
//!
//! The core never talks to the network, the push service or the UI shell
//! directly; it goes through the traits re-exported here so that each host
//! (native shell, web worker, tests) can plug in its own implementation.
mod http;
mod kv;
mod push;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ReqwestTransport, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_REQUEST_BODY_SIZE, MAX_TIMEOUT_MS,
};
pub use self::kv::{validate_version_name, CacheKey, KvError, MAX_VALUE_SIZE};
pub use self::push::{
    register_for_push_alerts, PermissionState, PushError, PushPlatform, PushResult,
    RegisterOptions,
};
