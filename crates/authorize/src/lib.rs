//! authorize: authorization decision point for an identity-aware access proxy
//!
//! Envoy forwards every proxied request to this crate as an ext_authz
//! [`CheckRequest`]. [`Authorize::check`] answers with one of three responses:
//!
//! - **Allow**: the request continues upstream with identity headers injected
//! - **Redirect**: unauthenticated users are sent to the sign-in service
//! - **Deny**: the evaluator's status and message are returned to the caller
//!
//! Sessions and users are resolved against a local cache of directory records,
//! refreshed from the directory service on demand ("force sync") and kept current
//! by the directory's update stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use authorize::{Authorize, AuthorizeState, Options};
//!
//! let options = Options::from_yaml(r#"
//!     authenticate_url: "https://authenticate.example.com"
//!     policies:
//!       - from: "https://app.example.com"
//! "#)?;
//! let state = AuthorizeState::with_http_data_broker(&options, evaluator, decoder)?;
//! let authorize = Authorize::new(options, state);
//!
//! // Feed the directory stream into the cache
//! tokio::spawn(authorize::databroker::run_record_sync(authorize.data_broker_data(), records_rx));
//!
//! let response = authorize.check(check_request).await?;
//! if response.is_allowed() {
//!     println!("allowed");
//! }
//! ```

pub mod authorize;
pub mod config;
pub mod databroker;
pub mod envoy;
pub mod errors;
pub mod evaluator;
pub mod log;
pub mod policy;
pub mod session;
pub mod urlutil;

// Re-export public types
pub use authorize::{Authorize, AuthorizeState};
pub use config::{Options, OptionsStore, RawOptions};
pub use databroker::{DataBrokerClient, DataBrokerData, Record, RecordData, RecordType};
pub use envoy::{CheckRequest, CheckResponse, NormalizedRequest};
pub use errors::{Error, Result};
pub use evaluator::{Evaluator, EvaluatorResult};
pub use session::{SessionDecoder, SessionError, SessionState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::authorize::{Authorize, AuthorizeState};
    pub use crate::config::Options;
    pub use crate::databroker::{DataBrokerClient, Record, RecordType};
    pub use crate::envoy::{CheckRequest, CheckResponse};
    pub use crate::evaluator::{Evaluator, EvaluatorResult, Request};
    pub use crate::session::{SessionDecoder, SessionState};
}
