use thiserror::Error;

/// Raised while building [`crate::config::Config`], before any network activity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    Missing(&'static str),
    #[error("a personal access token is required: set {0}")]
    MissingToken(&'static str),
}
