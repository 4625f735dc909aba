//! Authorize options parsing and the swappable options snapshot.
//!
//! Options arrive as YAML (or JSON) in [`RawOptions`] and are validated into
//! [`Options`]: URLs are parsed and policy regexes compiled once, up front.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::policy::{Policy, RawPolicy};

/// Options as written by the operator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawOptions {
    /// Sign-in service unauthenticated users are redirected to
    pub authenticate_url: String,

    /// Forward-auth endpoint; requests addressed to its host are forward-auth checks
    pub forward_auth_url: Option<String>,

    /// Cookie carrying the session token
    pub cookie_name: String,

    /// JWT claims copied into `X-Authorize-Claim-<Claim>` request headers
    pub jwt_claim_headers: Vec<String>,

    /// Header carrying the evaluator's signed JWT to the upstream
    pub jwt_assertion_header: String,

    /// Deadline for a single check in milliseconds (unset = no deadline)
    pub check_timeout_ms: Option<u64>,

    /// Routing policies (first match wins)
    pub policies: Vec<RawPolicy>,

    /// Directory service connection
    pub data_broker: RawDataBrokerOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawDataBrokerOptions {
    pub url: Option<String>,
    pub service_token: Option<String>,
    pub timeout_ms: u64,
    /// How long deleted records are remembered to fence off in-flight fetches
    pub tombstone_ttl_ms: u64,
}

mod defaults {
    pub fn authenticate_url() -> String {
        "https://authenticate.localhost.example".to_string()
    }
    pub fn cookie_name() -> String {
        "_authorize".to_string()
    }
    pub fn jwt_assertion_header() -> String {
        "X-Authorize-Jwt-Assertion".to_string()
    }
    pub fn data_broker_timeout_ms() -> u64 {
        500
    }
    pub fn tombstone_ttl_ms() -> u64 {
        300_000
    }
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            authenticate_url: defaults::authenticate_url(),
            forward_auth_url: None,
            cookie_name: defaults::cookie_name(),
            jwt_claim_headers: Vec::new(),
            jwt_assertion_header: defaults::jwt_assertion_header(),
            check_timeout_ms: None,
            policies: Vec::new(),
            data_broker: RawDataBrokerOptions::default(),
        }
    }
}

impl Default for RawDataBrokerOptions {
    fn default() -> Self {
        Self {
            url: None,
            service_token: None,
            timeout_ms: defaults::data_broker_timeout_ms(),
            tombstone_ttl_ms: defaults::tombstone_ttl_ms(),
        }
    }
}

/// Validated options used on the check path
#[derive(Debug, Clone)]
pub struct Options {
    pub authenticate_url: Url,
    pub forward_auth_url: Option<Url>,
    pub cookie_name: String,
    pub jwt_claim_headers: Vec<String>,
    pub jwt_assertion_header: String,
    pub check_timeout: Option<Duration>,
    pub policies: Vec<Policy>,
    pub data_broker: DataBrokerOptions,
}

#[derive(Debug, Clone)]
pub struct DataBrokerOptions {
    pub url: Option<Url>,
    pub service_token: Option<String>,
    pub timeout: Duration,
    pub tombstone_ttl: Duration,
}

impl Options {
    /// Load options from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read options from {}", path.display()))?;

        Self::from_yaml(&contents)
    }

    /// Parse options from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: RawOptions =
            serde_yaml::from_str(yaml).with_context(|| "Failed to parse authorize options YAML")?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawOptions) -> Result<Self> {
        let authenticate_url = Url::parse(&raw.authenticate_url)
            .with_context(|| format!("invalid authenticate_url {}", raw.authenticate_url))?;
        let forward_auth_url = raw
            .forward_auth_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| Url::parse(u).with_context(|| format!("invalid forward_auth_url {u}")))
            .transpose()?;
        let policies = raw
            .policies
            .into_iter()
            .enumerate()
            .map(|(idx, p)| Policy::try_from(p).with_context(|| format!("invalid policy #{idx}")))
            .collect::<Result<Vec<_>>>()?;
        let data_broker_url = raw
            .data_broker
            .url
            .as_deref()
            .map(|u| Url::parse(u).with_context(|| format!("invalid data_broker.url {u}")))
            .transpose()?;

        if raw.jwt_assertion_header.trim().is_empty() {
            anyhow::bail!("jwt_assertion_header must not be empty");
        }
        if raw.data_broker.tombstone_ttl_ms <= raw.data_broker.timeout_ms {
            anyhow::bail!(
                "data_broker.tombstone_ttl_ms ({}) must exceed data_broker.timeout_ms ({})",
                raw.data_broker.tombstone_ttl_ms,
                raw.data_broker.timeout_ms
            );
        }

        Ok(Options {
            authenticate_url,
            forward_auth_url,
            cookie_name: raw.cookie_name,
            jwt_claim_headers: raw.jwt_claim_headers,
            jwt_assertion_header: raw.jwt_assertion_header,
            check_timeout: raw.check_timeout_ms.map(Duration::from_millis),
            policies,
            data_broker: DataBrokerOptions {
                url: data_broker_url,
                service_token: raw.data_broker.service_token,
                timeout: Duration::from_millis(raw.data_broker.timeout_ms),
                tombstone_ttl: Duration::from_millis(raw.data_broker.tombstone_ttl_ms),
            },
        })
    }
}

/// The current options snapshot. Readers clone the `Arc` and keep it for the whole
/// check; reloads replace the snapshot wholesale and never mutate it in place.
#[derive(Debug, Clone)]
pub struct OptionsStore {
    current: Arc<RwLock<Arc<Options>>>,
}

impl OptionsStore {
    pub fn new(options: Options) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(options))),
        }
    }

    pub fn load(&self) -> Arc<Options> {
        self.current.read().clone()
    }

    pub fn store(&self, options: Options) {
        *self.current.write() = Arc::new(options);
    }
}
