use std::time::Duration;

use thiserror::Error;

/// Errors that abort a check. Everything else degrades to "absent" inside the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("error during policy evaluation")]
    Evaluate(#[source] anyhow::Error),

    #[error("authorization check exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
