//! The check pipeline: normalize, resolve identity, match policy, evaluate, render.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, error, warn};

use crate::config::{Options, OptionsStore};
use crate::databroker::{DataBrokerClient, DataBrokerData, HttpDataBrokerClient, Record, RecordType};
use crate::envoy::response::{denied_response, ok_response, redirect_response};
use crate::envoy::{self, CheckRequest, CheckResponse, NormalizedRequest};
use crate::errors::{Error, Result};
use crate::evaluator::{Evaluator, Request, RequestHttp, RequestSession};
use crate::log::log_authorize_check;
use crate::policy::matching_policy;
use crate::session::{load_raw_session, load_session, SessionDecoder, SessionState};

/// Path forward-auth callers probe; they expect a terminal 401 rather than a redirect.
pub const FORWARD_AUTH_VERIFY_PATH: &str = "/verify";

/// External collaborators of a check, swapped as a unit.
#[derive(Clone)]
pub struct AuthorizeState {
    pub evaluator: Arc<dyn Evaluator>,
    pub decoder: Arc<dyn SessionDecoder>,
    pub data_broker_client: Arc<dyn DataBrokerClient>,
}

impl AuthorizeState {
    /// State backed by the HTTP directory client configured in `options`.
    pub fn with_http_data_broker(
        options: &Options,
        evaluator: Arc<dyn Evaluator>,
        decoder: Arc<dyn SessionDecoder>,
    ) -> Result<Self> {
        let client = HttpDataBrokerClient::new(&options.data_broker)
            .map_err(|e| Error::Config(format!("data broker client: {e}")))?;
        Ok(AuthorizeState {
            evaluator,
            decoder,
            data_broker_client: Arc::new(client),
        })
    }
}

impl std::fmt::Debug for AuthorizeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizeState").finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
#[error("session {0} not found")]
pub struct SessionNotFound(pub String);

/// Authorization decision point.
///
/// Options and collaborators are snapshots replaced wholesale. The directory cache
/// sits behind one reader/writer lock; a check holds the read side from building
/// the evaluator request until its response is rendered, so writers (streamed
/// updates, fetch-on-miss inserts) wait for in-flight evaluations.
#[derive(Debug, Clone)]
pub struct Authorize {
    options: OptionsStore,
    state: Arc<RwLock<Arc<AuthorizeState>>>,
    data_broker_data: Arc<AsyncRwLock<DataBrokerData>>,
}

impl Authorize {
    /// The tombstone retention window is taken from `options` here and not
    /// changed by later reloads.
    pub fn new(options: Options, state: AuthorizeState) -> Self {
        let data = DataBrokerData::with_tombstone_ttl(options.data_broker.tombstone_ttl);
        Self {
            options: OptionsStore::new(options),
            state: Arc::new(RwLock::new(Arc::new(state))),
            data_broker_data: Arc::new(AsyncRwLock::new(data)),
        }
    }

    pub fn options(&self) -> Arc<Options> {
        self.options.load()
    }

    /// Installs reloaded options. Checks already running keep the snapshot they started with.
    pub fn on_config_change(&self, options: Options) {
        self.options.store(options);
    }

    pub fn set_state(&self, state: AuthorizeState) {
        *self.state.write() = Arc::new(state);
    }

    fn state(&self) -> Arc<AuthorizeState> {
        self.state.read().clone()
    }

    /// Shared handle to the directory cache, for the streaming updater.
    pub fn data_broker_data(&self) -> Arc<AsyncRwLock<DataBrokerData>> {
        self.data_broker_data.clone()
    }

    /// Applies one streamed directory record.
    pub async fn update_record(&self, record: Record) -> bool {
        self.data_broker_data.write().await.update(record)
    }

    /// Decides one ext_authz check.
    ///
    /// Only an evaluator failure (or the configured check deadline) is an error;
    /// every other failure degrades to proceeding without the missing data.
    pub async fn check(&self, req: CheckRequest) -> Result<CheckResponse> {
        let options = self.options.load();
        match options.check_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.check_with(req, &options))
                .await
                .map_err(|_| {
                    warn!(?deadline, "authorize check timed out");
                    Error::Timeout(deadline)
                })?,
            None => self.check_with(req, &options).await,
        }
    }

    async fn check_with(&self, mut req: CheckRequest, options: &Options) -> Result<CheckResponse> {
        let state = self.state();

        // The request as received; token lookup and the /verify probe use it.
        let hreq = NormalizedRequest::from_check_request(&req);

        let is_forward_auth = envoy::is_forward_auth(&req, options.forward_auth_url.as_ref());
        if is_forward_auth {
            let target = envoy::forward_auth_target(&hreq);
            debug!(scheme = %target.scheme, host = %target.host, path = %target.path, "forward auth check");
            envoy::rewrite_forward_auth(&mut req, &target);
        }
        let effective = NormalizedRequest::from_check_request(&req);

        let raw_session = load_raw_session(&hreq, options);
        let mut session_state = load_session(state.decoder.as_ref(), raw_session.as_deref());

        if let Err(e) = self.force_sync(&state, session_state.as_ref()).await {
            warn!(error = %e, "clearing session due to force sync failure");
            session_state = None;
        }

        let data = self.data_broker_data.read().await;

        let eval_req = evaluator_request(&effective, options, session_state.as_ref(), &data);
        let reply = match state.evaluator.evaluate(&eval_req).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "error during policy evaluation");
                return Err(Error::Evaluate(e));
            }
        };
        log_authorize_check(&req, &reply);

        let resp = match reply.status {
            200 => ok_response(options, &reply),
            401 if is_forward_auth && hreq.path == FORWARD_AUTH_VERIFY_PATH => {
                denied_response(401, "Unauthenticated", Vec::new())
            }
            401 => redirect_response(options, &effective),
            status => denied_response(status, &reply.message, Vec::new()),
        };
        drop(data);
        Ok(resp)
    }

    /// Refreshes the session's record, and then its user's, from the directory
    /// service. A session that cannot be found at all is an error; a missing user
    /// is not.
    pub async fn force_sync(
        &self,
        state: &AuthorizeState,
        session: Option<&SessionState>,
    ) -> std::result::Result<(), SessionNotFound> {
        let Some(session) = session else {
            return Ok(());
        };
        let Some(record) = self.force_sync_session(state, &session.id).await else {
            return Err(SessionNotFound(session.id.clone()));
        };
        if let Some(user_id) = record.user_id() {
            if self
                .resolve_record(state, RecordType::User, user_id)
                .await
                .is_none()
            {
                debug!(%user_id, "proceeding without user record");
            }
        }
        Ok(())
    }

    /// A session id may name a session or a service account.
    async fn force_sync_session(&self, state: &AuthorizeState, session_id: &str) -> Option<Record> {
        {
            let data = self.data_broker_data.read().await;
            if let Some(s) = data.get(RecordType::Session, session_id) {
                return Some(s.clone());
            }
            if let Some(sa) = data.get(RecordType::ServiceAccount, session_id) {
                return Some(sa.clone());
            }
        }
        self.fetch_record(state, RecordType::Session, session_id).await
    }

    /// Cached record for the key, fetched from the directory service on a miss.
    /// Fetch failures are logged and read as "not found".
    pub async fn resolve_record(
        &self,
        state: &AuthorizeState,
        record_type: RecordType,
        id: &str,
    ) -> Option<Record> {
        if let Some(r) = self.data_broker_data.read().await.get(record_type, id) {
            return Some(r.clone());
        }
        self.fetch_record(state, record_type, id).await
    }

    async fn fetch_record(
        &self,
        state: &AuthorizeState,
        record_type: RecordType,
        id: &str,
    ) -> Option<Record> {
        let fetched = match state.data_broker_client.get(record_type, id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, %record_type, %id, "failed to get record from databroker");
                return None;
            }
        };

        // A streamed update may have landed during the round trip; it wins.
        let mut data = self.data_broker_data.write().await;
        data.insert_if_absent(fetched);
        data.get(record_type, id).cloned()
    }
}

fn evaluator_request<'a>(
    req: &NormalizedRequest,
    options: &Options,
    session: Option<&SessionState>,
    data: &'a DataBrokerData,
) -> Request<'a> {
    let custom_policies = req
        .url()
        .and_then(|u| matching_policy(&options.policies, &u).map(|p| p.custom_policies()))
        .unwrap_or_default();

    Request {
        data_broker_data: data,
        http: RequestHttp {
            method: req.method.clone(),
            url: req.url_string(),
            headers: req.headers.clone(),
            client_certificate: req.client_certificate.clone(),
        },
        session: session.map(|s| RequestSession {
            id: s.id.clone(),
            impersonate_email: s.impersonate_email.clone(),
            impersonate_groups: s.impersonate_groups.clone(),
        }),
        custom_policies,
    }
}
