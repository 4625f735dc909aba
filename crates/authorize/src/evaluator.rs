//! Interface to the policy evaluation engine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::databroker::DataBrokerData;

/// Everything the evaluator needs to decide on one check. Built fresh per check.
///
/// `data_broker_data` borrows the directory cache under the read lock the check
/// holds, so the evaluator sees one consistent snapshot.
#[derive(Debug)]
pub struct Request<'a> {
    pub data_broker_data: &'a DataBrokerData,
    pub http: RequestHttp,
    pub session: Option<RequestSession>,
    pub custom_policies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestHttp {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub client_certificate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestSession {
    pub id: String,
    pub impersonate_email: Option<String>,
    pub impersonate_groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EvaluatorResult {
    pub status: u16,
    pub message: String,
    /// JWT describing the caller, forwarded to the upstream on allow
    pub signed_jwt: String,
    pub user_email: String,
    pub user_groups: Vec<String>,
}

impl EvaluatorResult {
    pub fn is_allowed(&self) -> bool {
        self.status == 200
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, req: &Request<'_>) -> anyhow::Result<EvaluatorResult>;
}
