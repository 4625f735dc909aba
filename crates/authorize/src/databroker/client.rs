//! Directory service lookups used on cache miss.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use super::{Record, RecordType};
use crate::config::DataBrokerOptions;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?');

#[derive(Debug, Error)]
pub enum DataBrokerError {
    #[error("record not found")]
    NotFound,
    #[error("directory service returned status {0}")]
    Status(u16),
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid directory response: {0}")]
    Decode(String),
    #[error("no directory service configured")]
    Unconfigured,
}

/// Single-record lookup against the directory service.
#[async_trait]
pub trait DataBrokerClient: Send + Sync {
    async fn get(&self, record_type: RecordType, id: &str) -> Result<Record, DataBrokerError>;
}

/// HTTP client for the directory service's record endpoint:
/// `GET {url}/records/{type-url}/{id}`.
#[derive(Debug, Clone)]
pub struct HttpDataBrokerClient {
    base_url: Option<Url>,
    service_token: Option<String>,
    http: Client,
}

impl HttpDataBrokerClient {
    pub fn new(options: &DataBrokerOptions) -> Result<Self, DataBrokerError> {
        let http = Client::builder().timeout(options.timeout).build()?;
        Ok(Self {
            base_url: options.url.clone(),
            service_token: options.service_token.clone(),
            http,
        })
    }

    fn record_url(&self, record_type: RecordType, id: &str) -> Result<String, DataBrokerError> {
        let base = self.base_url.as_ref().ok_or(DataBrokerError::Unconfigured)?;
        Ok(format!(
            "{}/records/{}/{}",
            base.as_str().trim_end_matches('/'),
            utf8_percent_encode(record_type.type_url(), PATH_SEGMENT),
            utf8_percent_encode(id, PATH_SEGMENT),
        ))
    }
}

#[async_trait]
impl DataBrokerClient for HttpDataBrokerClient {
    async fn get(&self, record_type: RecordType, id: &str) -> Result<Record, DataBrokerError> {
        let url = self.record_url(record_type, id)?;

        let mut req = self.http.get(&url);
        if let Some(token) = &self.service_token {
            req = req.header("X-Service-Token", token);
        }

        let resp = req.send().await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(DataBrokerError::NotFound),
            status => return Err(DataBrokerError::Status(status.as_u16())),
        }

        let record: Record = resp
            .json()
            .await
            .map_err(|e| DataBrokerError::Decode(e.to_string()))?;
        if record.record_type != record_type || record.id != id {
            return Err(DataBrokerError::Decode(format!(
                "asked for {record_type}/{id}, got {}/{}",
                record.record_type, record.id
            )));
        }
        Ok(record)
    }
}
