//! Directory records (sessions, users, service accounts), the local cache of them, and
//! the clients that fill it.
//!
//! Type URLs only exist on the wire; inside the crate records are keyed by
//! [`RecordType`].

mod cache;
mod client;
mod sync;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::DataBrokerData;
pub use client::{DataBrokerClient, DataBrokerError, HttpDataBrokerClient};
pub use sync::run_record_sync;

pub const SESSION_TYPE_URL: &str = "type.googleapis.com/session.Session";
pub const USER_TYPE_URL: &str = "type.googleapis.com/user.User";
pub const SERVICE_ACCOUNT_TYPE_URL: &str = "type.googleapis.com/user.ServiceAccount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum RecordType {
    #[serde(rename = "type.googleapis.com/session.Session")]
    Session,
    #[serde(rename = "type.googleapis.com/user.User")]
    User,
    #[serde(rename = "type.googleapis.com/user.ServiceAccount")]
    ServiceAccount,
}

impl RecordType {
    pub fn type_url(&self) -> &'static str {
        match self {
            RecordType::Session => SESSION_TYPE_URL,
            RecordType::User => USER_TYPE_URL,
            RecordType::ServiceAccount => SERVICE_ACCOUNT_TYPE_URL,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordData {
    Session {
        user_id: String,
        #[serde(default)]
        expires_at: Option<i64>,
    },
    User {
        #[serde(default)]
        email: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        groups: Vec<String>,
    },
    ServiceAccount {
        user_id: String,
        #[serde(default)]
        expires_at: Option<i64>,
    },
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::Session { .. } => RecordType::Session,
            RecordData::User { .. } => RecordType::User,
            RecordData::ServiceAccount { .. } => RecordType::ServiceAccount,
        }
    }
}

/// One directory record. `version` grows monotonically per key on the directory
/// service; a cached record is only replaced by one with an equal or higher version.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    pub data: RecordData,
}

impl Record {
    pub fn session(id: impl Into<String>, version: u64, user_id: impl Into<String>) -> Self {
        Record {
            record_type: RecordType::Session,
            id: id.into(),
            version,
            deleted: false,
            data: RecordData::Session {
                user_id: user_id.into(),
                expires_at: None,
            },
        }
    }

    pub fn user(
        id: impl Into<String>,
        version: u64,
        email: impl Into<String>,
        groups: Vec<String>,
    ) -> Self {
        Record {
            record_type: RecordType::User,
            id: id.into(),
            version,
            deleted: false,
            data: RecordData::User {
                email: email.into(),
                name: None,
                groups,
            },
        }
    }

    pub fn service_account(
        id: impl Into<String>,
        version: u64,
        user_id: impl Into<String>,
    ) -> Self {
        Record {
            record_type: RecordType::ServiceAccount,
            id: id.into(),
            version,
            deleted: false,
            data: RecordData::ServiceAccount {
                user_id: user_id.into(),
                expires_at: None,
            },
        }
    }

    /// Marks this record as deleted, bumping it to `version`.
    pub fn into_tombstone(mut self, version: u64) -> Self {
        self.version = version;
        self.deleted = true;
        self
    }

    /// The user owning a session or service account.
    pub fn user_id(&self) -> Option<&str> {
        match &self.data {
            RecordData::Session { user_id, .. } | RecordData::ServiceAccount { user_id, .. } => {
                Some(user_id)
            }
            RecordData::User { .. } => None,
        }
    }

    pub fn key(&self) -> (RecordType, &str) {
        (self.record_type, &self.id)
    }
}
