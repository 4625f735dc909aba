//! Envoy external authorization (ext_authz v2) adapter.
//!
//! [`CheckRequest`] and [`CheckResponse`] follow the proto3 JSON mapping of
//! `envoy.service.auth.v2`. Incoming checks are normalized into a
//! [`NormalizedRequest`]; decisions are rendered back by the functions in
//! [`response`].

pub mod response;

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::urlutil;

pub const HEADER_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
pub const HEADER_FORWARDED_HOST: &str = "X-Forwarded-Host";
pub const HEADER_FORWARDED_URI: &str = "X-Forwarded-Uri";
pub const HEADER_REQUEST_ID: &str = "X-Request-Id";

/// Query parameter carrying the original destination of a forward-auth check
pub const QUERY_FORWARD_AUTH_URI: &str = "uri";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckRequest {
    pub attributes: AttributeContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttributeContext {
    pub source: Peer,
    pub destination: Peer,
    pub request: RequestAttributes,
    pub context_extensions: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Peer {
    pub principal: String,
    /// URL-encoded PEM of the peer certificate, empty without mTLS
    pub certificate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestAttributes {
    pub http: HttpRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpRequest {
    pub id: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    /// Request path; Envoy sends the query string as part of it
    pub path: String,
    pub host: String,
    pub scheme: String,
    pub query: String,
    pub fragment: String,
    pub protocol: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub status: RpcStatus,
    pub http_response: HttpResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RpcStatus {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl RpcStatus {
    pub const OK: i32 = 0;
    pub const PERMISSION_DENIED: i32 = 7;
    pub const UNAUTHENTICATED: i32 = 16;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HttpResponse {
    OkResponse(OkHttpResponse),
    DeniedResponse(DeniedHttpResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OkHttpResponse {
    pub headers: Vec<HeaderValueOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeniedHttpResponse {
    pub status: HttpStatus,
    pub headers: Vec<HeaderValueOption>,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpStatus {
    pub code: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeaderValueOption {
    pub header: HeaderValue,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeaderValue {
    pub key: String,
    pub value: String,
}

impl HeaderValueOption {
    pub fn new(key: impl Into<String>, value: impl Into<String>, append: bool) -> Self {
        HeaderValueOption {
            header: HeaderValue {
                key: key.into(),
                value: value.into(),
            },
            append,
        }
    }
}

impl CheckResponse {
    pub fn is_allowed(&self) -> bool {
        matches!(self.http_response, HttpResponse::OkResponse(_))
    }

    /// HTTP status of a denied response (redirects included)
    pub fn denied_status(&self) -> Option<u16> {
        match &self.http_response {
            HttpResponse::DeniedResponse(d) => Some(d.status.code),
            HttpResponse::OkResponse(_) => None,
        }
    }

    /// `Location` of a redirect response
    pub fn redirect_location(&self) -> Option<&str> {
        match &self.http_response {
            HttpResponse::DeniedResponse(d) if (300..400).contains(&d.status.code) => d
                .headers
                .iter()
                .find(|h| h.header.key.eq_ignore_ascii_case("Location"))
                .map(|h| h.header.value.as_str()),
            _ => None,
        }
    }

    pub fn headers(&self) -> &[HeaderValueOption] {
        match &self.http_response {
            HttpResponse::OkResponse(ok) => &ok.headers,
            HttpResponse::DeniedResponse(d) => &d.headers,
        }
    }
}

/// The request a check is about, decoupled from the envelope it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub method: String,
    pub scheme: String,
    /// Host in its canonical form (default port dropped)
    pub host: String,
    pub path: String,
    pub query: String,
    /// Canonical header keys; the last value wins on key collisions
    pub headers: BTreeMap<String, String>,
    /// PEM client certificate, empty when absent or undecodable
    pub client_certificate: String,
    pub body: Bytes,
}

impl NormalizedRequest {
    pub fn from_check_request(req: &CheckRequest) -> Self {
        let h = &req.attributes.request.http;
        let (path, query) = split_path_and_query(&h.path);
        NormalizedRequest {
            method: h.method.clone(),
            scheme: h.scheme.clone(),
            host: urlutil::canonical_host(&h.scheme, &h.host),
            path: path.to_string(),
            query: query.to_string(),
            headers: check_request_headers(req),
            client_certificate: peer_certificate(req),
            body: Bytes::from(h.body.clone()),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&urlutil::canonical_header_key(key))
            .map(String::as_str)
    }

    /// First value of a decoded query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// `scheme://host/path?query`, the query part omitted when empty
    pub fn url_string(&self) -> String {
        let mut s = format!("{}://{}{}", self.scheme, self.host, self.path);
        if !self.query.is_empty() {
            s.push('?');
            s.push_str(&self.query);
        }
        s
    }

    pub fn url(&self) -> Option<Url> {
        Url::parse(&self.url_string()).ok()
    }
}

/// Splits an Envoy path at the first `?`.
pub fn split_path_and_query(path: &str) -> (&str, &str) {
    match path.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path, ""),
    }
}

/// Request headers with canonical keys. When raw keys collide after
/// canonicalization, the value of the greatest raw key (byte order) wins.
pub fn check_request_headers(req: &CheckRequest) -> BTreeMap<String, String> {
    let mut hdrs = BTreeMap::new();
    let mut raw: Vec<_> = req.attributes.request.http.headers.iter().collect();
    raw.sort();
    for (k, v) in raw {
        hdrs.insert(urlutil::canonical_header_key(k), v.clone());
    }
    hdrs
}

/// PEM client certificate of the downstream peer. An undecodable value is dropped
/// and reads as "no certificate".
pub fn peer_certificate(req: &CheckRequest) -> String {
    urlutil::query_unescape(&req.attributes.source.certificate).unwrap_or_default()
}

/// Whether this check targets the forward-auth endpoint rather than a routed app.
pub fn is_forward_auth(req: &CheckRequest, forward_auth_url: Option<&Url>) -> bool {
    let Some(fwd) = forward_auth_url else {
        return false;
    };
    let Some(fwd_host) = fwd.host_str() else {
        return false;
    };
    let check_host = &req.attributes.request.http.host;
    urlutil::strip_port(check_host).eq_ignore_ascii_case(urlutil::strip_port(fwd_host))
}

/// Original destination of a forward-auth check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardAuthTarget {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: String,
}

/// Reads the destination from the `uri` query parameter, falling back to the
/// `X-Forwarded-*` headers when it is missing or not an absolute URL.
pub fn forward_auth_target(req: &NormalizedRequest) -> ForwardAuthTarget {
    let from_query = req
        .query_param(QUERY_FORWARD_AUTH_URI)
        .and_then(|raw| urlutil::parse_and_validate_url(&raw).ok());
    if let Some(u) = from_query {
        let host = match u.port() {
            Some(port) => format!("{}:{port}", u.host_str().unwrap_or_default()),
            None => u.host_str().unwrap_or_default().to_string(),
        };
        return ForwardAuthTarget {
            scheme: u.scheme().to_string(),
            host,
            path: u.path().to_string(),
            query: u.query().unwrap_or_default().to_string(),
        };
    }

    let header = |k: &str| req.header(k).unwrap_or_default().to_string();
    let uri = header(HEADER_FORWARDED_URI);
    let (path, query) = split_path_and_query(&uri);
    ForwardAuthTarget {
        scheme: header(HEADER_FORWARDED_PROTO),
        host: header(HEADER_FORWARDED_HOST),
        path: path.to_string(),
        query: query.to_string(),
    }
}

/// Points the check's HTTP attributes at the forward-auth target.
pub fn rewrite_forward_auth(req: &mut CheckRequest, target: &ForwardAuthTarget) {
    let h = &mut req.attributes.request.http;
    h.scheme = target.scheme.clone();
    h.host = target.host.clone();
    h.path = target.path.clone();
    if !target.query.is_empty() {
        h.path.push('?');
        h.path.push_str(&target.query);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(scheme: &str, host: &str, path: &str, headers: &[(&str, &str)]) -> CheckRequest {
        let mut c = CheckRequest::default();
        c.attributes.request.http = HttpRequest {
            method: "GET".to_string(),
            scheme: scheme.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        c
    }

    #[test]
    fn test_normalize_splits_query() {
        for raw in ["/a/b?x=1&y=2", "/?", "/plain", "/a?b?c", ""] {
            let req = NormalizedRequest::from_check_request(&check("https", "h", raw, &[]));
            if req.query.is_empty() {
                assert!(!raw.contains('?') || raw.ends_with('?'), "raw={raw}");
                assert_eq!(req.path, raw.trim_end_matches('?'));
            } else {
                assert_eq!(format!("{}?{}", req.path, req.query), raw);
            }
        }
        let req = NormalizedRequest::from_check_request(&check("https", "h", "/a?b?c", &[]));
        assert_eq!(req.path, "/a");
        assert_eq!(req.query, "b?c");
    }

    #[test]
    fn test_normalize_host_and_headers() {
        let req = NormalizedRequest::from_check_request(&check(
            "https",
            "app.example.com:443",
            "/dashboard",
            &[("x-request-id", "abc"), ("content-type", "text/plain")],
        ));
        assert_eq!(req.host, "app.example.com");
        assert_eq!(req.headers.get("X-Request-Id").map(String::as_str), Some("abc"));
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.url_string(), "https://app.example.com/dashboard");

        // Keys that canonicalize to the same name collapse to one, last wins.
        let req = NormalizedRequest::from_check_request(&check(
            "https",
            "app.example.com",
            "/",
            &[("X-A", "first"), ("x-a", "second")],
        ));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("X-A"), Some("second"));
        assert_eq!(
            req.headers,
            check_request_headers(&check(
                "https",
                "app.example.com",
                "/",
                &[("x-a", "second"), ("X-A", "first")],
            ))
        );
    }

    #[test]
    fn test_peer_certificate() {
        let mut c = check("https", "h", "/", &[]);
        c.attributes.source.certificate =
            "-----BEGIN%20CERTIFICATE-----%0AMIIB%2B%0A-----END%20CERTIFICATE-----%0A".to_string();
        assert_eq!(
            peer_certificate(&c),
            "-----BEGIN CERTIFICATE-----\nMIIB+\n-----END CERTIFICATE-----\n"
        );

        c.attributes.source.certificate = "broken%zz".to_string();
        assert_eq!(peer_certificate(&c), "");
        let req = NormalizedRequest::from_check_request(&c);
        assert_eq!(req.client_certificate, "");

        // Multi-byte character right after the escape marker
        c.attributes.source.certificate = "-----BEGIN%aé".to_string();
        let req = NormalizedRequest::from_check_request(&c);
        assert_eq!(req.client_certificate, "");
    }

    #[test]
    fn test_is_forward_auth() {
        let fwd = Url::parse("https://auth.example.com").unwrap();
        assert!(is_forward_auth(&check("https", "auth.example.com:8443", "/", &[]), Some(&fwd)));
        assert!(is_forward_auth(&check("https", "auth.example.com", "/", &[]), Some(&fwd)));
        assert!(!is_forward_auth(&check("https", "app.example.com", "/", &[]), Some(&fwd)));
        assert!(!is_forward_auth(&check("https", "auth.example.com", "/", &[]), None));
    }

    #[test]
    fn test_forward_auth_target_from_query() {
        let req = NormalizedRequest::from_check_request(&check(
            "https",
            "auth.example.com",
            "/?uri=https://app.example.com/secret%3Ffoo=1",
            &[],
        ));
        let target = forward_auth_target(&req);
        assert_eq!(
            target,
            ForwardAuthTarget {
                scheme: "https".to_string(),
                host: "app.example.com".to_string(),
                path: "/secret".to_string(),
                query: "foo=1".to_string(),
            }
        );

        let mut c = check("https", "auth.example.com", "/", &[]);
        rewrite_forward_auth(&mut c, &target);
        let rewritten = NormalizedRequest::from_check_request(&c);
        assert_eq!(rewritten.url_string(), "https://app.example.com/secret?foo=1");
    }

    #[test]
    fn test_forward_auth_target_falls_back_to_headers() {
        let headers = [
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "app.example.com"),
            ("x-forwarded-uri", "/reports?q=1"),
        ];
        for path in ["/verify", "/verify?uri=not-a-url"] {
            let req =
                NormalizedRequest::from_check_request(&check("https", "auth.example.com", path, &headers));
            let target = forward_auth_target(&req);
            assert_eq!(target.scheme, "https");
            assert_eq!(target.host, "app.example.com");
            assert_eq!(target.path, "/reports");
            assert_eq!(target.query, "q=1");
        }
    }

    #[test]
    fn test_check_response_json_shape() {
        let resp = CheckResponse {
            status: RpcStatus {
                code: RpcStatus::OK,
                message: String::new(),
            },
            http_response: HttpResponse::OkResponse(OkHttpResponse {
                headers: vec![HeaderValueOption::new("X-A", "b", false)],
            }),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["httpResponse"]["okResponse"]["headers"][0]["header"]["key"], "X-A");
        assert!(resp.is_allowed());
        assert_eq!(resp.redirect_location(), None);
    }
}
