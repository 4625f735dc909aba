//! Rendering of allow, redirect, and deny decisions as ext_authz responses.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::StatusCode;
use itertools::Itertools;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::{
    CheckResponse, DeniedHttpResponse, HeaderValueOption, HttpResponse, HttpStatus,
    NormalizedRequest, OkHttpResponse, RpcStatus,
};
use crate::config::Options;
use crate::evaluator::EvaluatorResult;
use crate::urlutil;

pub const CLAIM_HEADER_PREFIX: &str = "X-Authorize-Claim-";
pub const SIGN_IN_PATH: &str = "/.authorize/sign_in";
pub const QUERY_REDIRECT_URI: &str = "authorize_redirect_uri";

/// Allows the request, injecting the caller's JWT and the configured claim headers.
pub fn ok_response(options: &Options, reply: &EvaluatorResult) -> CheckResponse {
    CheckResponse {
        status: RpcStatus {
            code: RpcStatus::OK,
            message: String::new(),
        },
        http_response: HttpResponse::OkResponse(OkHttpResponse {
            headers: request_headers(options, &reply.signed_jwt),
        }),
    }
}

/// Header directives for an allowed request. Without a JWT there is nothing to inject.
pub fn request_headers(options: &Options, signed_jwt: &str) -> Vec<HeaderValueOption> {
    if signed_jwt.is_empty() {
        return Vec::new();
    }
    let mut headers = vec![HeaderValueOption::new(
        options.jwt_assertion_header.as_str(),
        signed_jwt,
        false,
    )];
    headers.extend(
        jwt_claim_headers(&options.jwt_claim_headers, signed_jwt)
            .into_iter()
            .map(|(k, v)| HeaderValueOption::new(k, v, false)),
    );
    headers
}

/// Maps configured claims of an (already trusted) JWT to `X-Authorize-Claim-*` headers.
pub fn jwt_claim_headers(claims: &[String], signed_jwt: &str) -> Vec<(String, String)> {
    if claims.is_empty() {
        return Vec::new();
    }
    let Some(payload) = decode_jwt_payload(signed_jwt) else {
        debug!("signed jwt payload is not decodable, skipping claim headers");
        return Vec::new();
    };
    claims
        .iter()
        .filter_map(|claim| {
            let value = match payload.get(claim)? {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .join(","),
                other => other.to_string(),
            };
            let name = format!(
                "{CLAIM_HEADER_PREFIX}{}",
                urlutil::canonical_header_key(&claim.replace('_', "-"))
            );
            Some((name, value))
        })
        .collect()
}

fn decode_jwt_payload(jwt: &str) -> Option<Map<String, Value>> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Sends the user to sign in, carrying the URL to come back to.
pub fn redirect_response(options: &Options, req: &NormalizedRequest) -> CheckResponse {
    let location = sign_in_url(&options.authenticate_url, &req.url_string());
    CheckResponse {
        status: RpcStatus {
            code: RpcStatus::UNAUTHENTICATED,
            message: String::new(),
        },
        http_response: HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: HttpStatus {
                code: StatusCode::FOUND.as_u16(),
            },
            headers: vec![HeaderValueOption::new("Location", location, false)],
            body: String::new(),
        }),
    }
}

pub fn sign_in_url(authenticate_url: &Url, redirect_uri: &str) -> String {
    let mut u = authenticate_url.clone();
    u.set_path(SIGN_IN_PATH);
    u.set_query(None);
    u.query_pairs_mut()
        .append_pair(QUERY_REDIRECT_URI, redirect_uri);
    u.to_string()
}

/// Denies the request with `code` and a short plain-text body.
pub fn denied_response(
    code: u16,
    reason: &str,
    headers: Vec<HeaderValueOption>,
) -> CheckResponse {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::FORBIDDEN);
    let rpc_code = if status == StatusCode::UNAUTHORIZED {
        RpcStatus::UNAUTHENTICATED
    } else {
        RpcStatus::PERMISSION_DENIED
    };

    let mut all_headers = vec![HeaderValueOption::new(
        "Content-Type",
        "text/plain; charset=utf-8",
        false,
    )];
    all_headers.extend(headers);

    CheckResponse {
        status: RpcStatus {
            code: rpc_code,
            message: reason.to_string(),
        },
        http_response: HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: HttpStatus {
                code: status.as_u16(),
            },
            headers: all_headers,
            body: format!(
                "{} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Error"),
                reason
            ),
        }),
    }
}
