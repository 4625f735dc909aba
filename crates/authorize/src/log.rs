//! Audit record for completed checks.

use tracing::{info, Level};

use crate::envoy::{check_request_headers, CheckRequest, HEADER_REQUEST_ID};
use crate::evaluator::EvaluatorResult;

pub const AUDIT_TARGET: &str = "authorize::audit";

/// Emits one `authorize check` event. Request headers are potentially sensitive and
/// only included when debug logging is enabled for the audit target.
pub fn log_authorize_check(req: &CheckRequest, reply: &EvaluatorResult) {
    let hdrs = check_request_headers(req);
    let h = &req.attributes.request.http;
    let check_request_id = hdrs.get(HEADER_REQUEST_ID).map(String::as_str).unwrap_or_default();
    let headers = tracing::enabled!(target: AUDIT_TARGET, Level::DEBUG)
        .then(|| tracing::field::debug(&hdrs));

    info!(
        target: AUDIT_TARGET,
        service = "authorize",
        request_id = %h.id,
        check_request_id,
        method = %h.method,
        path = %h.path,
        host = %h.host,
        query = %h.query,
        allow = reply.is_allowed(),
        status = reply.status,
        message = %reply.message,
        user = %reply.user_email,
        groups = ?reply.user_groups,
        headers,
        "authorize check"
    );
}
