//! HTTP middleware: rate limiting, request tracking, and security headers.

pub mod rate_limit;
pub mod request_tracking;
pub mod security_headers;

pub use rate_limit::rate_limit_middleware;
pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
pub use security_headers::apply_security_headers;
