//! Session token lookup and decoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Options;
use crate::envoy::NormalizedRequest;

/// Query parameter that may carry a session token
pub const QUERY_SESSION: &str = "authorize_session";

/// Identity carried by a decoded session token
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionState {
    pub id: String,
    #[serde(default)]
    pub impersonate_email: Option<String>,
    #[serde(default)]
    pub impersonate_groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed session token")]
    Malformed,
    #[error("session token expired")]
    Expired,
    #[error("invalid session token: {0}")]
    Invalid(String),
}

/// Turns a raw session token into a [`SessionState`]. Signing and encryption of
/// the token are owned by the implementation.
pub trait SessionDecoder: Send + Sync {
    fn decode(&self, raw: &str) -> Result<SessionState, SessionError>;
}

/// Finds the session token on a request: the session cookie first, then an
/// `Authorization: Bearer` header, then the session query parameter.
pub fn load_raw_session(req: &NormalizedRequest, options: &Options) -> Option<String> {
    if let Some(tok) = session_cookie(req, &options.cookie_name) {
        return Some(tok);
    }

    if let Some(tok) = req
        .header("Authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(tok.to_string());
    }

    req.query_param(QUERY_SESSION).filter(|t| !t.is_empty())
}

fn session_cookie(req: &NormalizedRequest, cookie_name: &str) -> Option<String> {
    let cookie_header = req.header("Cookie")?;
    for cookie in cookie_header.split(';') {
        let cookie = cookie.trim();
        if let Some(value) = cookie
            .strip_prefix(cookie_name)
            .and_then(|s| s.strip_prefix('='))
        {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Decodes `raw`; an undecodable token is treated exactly like no token.
pub fn load_session(decoder: &dyn SessionDecoder, raw: Option<&str>) -> Option<SessionState> {
    let raw = raw?;
    match decoder.decode(raw) {
        Ok(state) => Some(state),
        Err(e) => {
            debug!(error = %e, "ignoring undecodable session token");
            None
        }
    }
}
