/// Error types for the dispatch layer
use crate::publisher::PublishError;
use crate::resolver::ResolveError;
use crate::transport::TransportError;
use std::fmt::Display;
use thiserror::Error;

/// Main error type for dispatch operations
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A single topic declaration could not be resolved
    #[error("Topic resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// One or more handlers reference topic groups that are missing or empty
    #[error("{}", format_missing_groups(.missing, .available))]
    MissingGroups {
        /// Every offending handler/group pair
        missing: Vec<MissingGroup>,
        /// Groups present in configuration
        available: Vec<String>,
    },

    /// A handler registration is malformed
    #[error("Invalid registration for handler '{handler}': {reason}")]
    InvalidRegistration {
        /// Binding id of the handler (`consumer::handler`)
        handler: String,
        /// What is wrong with it
        reason: String,
    },

    /// A declared feature exists but is not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Operation is not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Broker transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Publishing failed
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// YAML parsing failed
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing failed
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// A handler that references a group which is absent or has no topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingGroup {
    /// Binding id of the referencing handler
    pub handler: String,
    /// Referenced group name
    pub group: String,
    /// True when the group exists but lists no topics
    pub empty: bool,
}

impl Display for MissingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.empty {
            write!(f, "{}: group '{}' has no topics", self.handler, self.group)
        } else {
            write!(f, "{}: group '{}' is not configured", self.handler, self.group)
        }
    }
}

fn format_missing_groups(missing: &[MissingGroup], available: &[String]) -> String {
    let mut out = format!(
        "{} handler(s) reference unusable topic groups",
        missing.len()
    );
    for (i, entry) in missing.iter().enumerate() {
        out.push_str(&format!("\n  [{}] {}", i + 1, entry));
    }
    if available.is_empty() {
        out.push_str("\n  available groups: (none)");
    } else {
        out.push_str(&format!("\n  available groups: {}", available.join(", ")));
    }
    out
}
