//! CLI error type. Variants map to the surface they came from so the
//! top-level handler can print a useful one-liner.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("state storage error: {0}")]
    Prefs(#[from] otacore::prefs::PrefsError),

    #[error("update check failed: {0}")]
    Check(#[from] otacore::CheckError),

    #[error("HTTP client error: {0}")]
    Http(#[from] otacore::http::HttpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
