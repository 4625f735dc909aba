//! Routing policies and first-match selection.

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::urlutil;

/// A policy as written in the options file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawPolicy {
    /// Source URL; its scheme and host select the requests this policy covers
    pub from: String,
    /// Exact path match
    pub path: Option<String>,
    /// Path prefix match
    pub prefix: Option<String>,
    /// Whole-path regular expression match
    pub regex: Option<String>,
    pub sub_policies: Vec<SubPolicy>,
}

/// A named group of custom policy fragments handed to the evaluator verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubPolicy {
    pub name: String,
    pub rego: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PathMatch {
    Any,
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub source: Url,
    pub path: PathMatch,
    pub sub_policies: Vec<SubPolicy>,
}

impl TryFrom<RawPolicy> for Policy {
    type Error = anyhow::Error;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        let source = urlutil::parse_and_validate_url(&raw.from)?;
        let path = if let Some(p) = raw.path.filter(|p| !p.is_empty()) {
            PathMatch::Exact(p)
        } else if let Some(p) = raw.prefix.filter(|p| !p.is_empty()) {
            PathMatch::Prefix(p)
        } else if let Some(r) = raw.regex.filter(|r| !r.is_empty()) {
            // Anchor so the expression has to cover the whole path.
            PathMatch::Regex(Regex::new(&format!("^(?:{r})$"))?)
        } else {
            PathMatch::Any
        };
        Ok(Policy {
            source,
            path,
            sub_policies: raw.sub_policies,
        })
    }
}

impl Policy {
    /// Whether this policy covers the request URL.
    pub fn matches(&self, request_url: &Url) -> bool {
        if self.source.scheme() != request_url.scheme() {
            return false;
        }
        if authority(&self.source) != authority(request_url) {
            return false;
        }
        let path = request_url.path();
        match &self.path {
            PathMatch::Any => true,
            PathMatch::Exact(p) => path == p,
            PathMatch::Prefix(p) => path.starts_with(p.as_str()),
            PathMatch::Regex(r) => r.is_match(path),
        }
    }

    /// All custom policy fragments of this policy, in declaration order.
    pub fn custom_policies(&self) -> Vec<String> {
        self.sub_policies
            .iter()
            .flat_map(|sp| sp.rego.iter().cloned())
            .collect()
    }
}

fn authority(u: &Url) -> String {
    let host = u.host_str().unwrap_or_default();
    match u.port() {
        Some(port) => urlutil::canonical_host(u.scheme(), &format!("{host}:{port}")),
        None => host.to_string(),
    }
}

/// Returns the first policy accepting `request_url`.
pub fn matching_policy<'a>(policies: &'a [Policy], request_url: &Url) -> Option<&'a Policy> {
    policies.iter().find(|p| p.matches(request_url))
}
