//! Topic resolution
//!
//! A handler declares where its topics come from with a [`TopicSpec`]. The
//! resolver turns that declaration into concrete topic names using this
//! priority:
//!
//! 1. topics listed directly on the handler
//! 2. a named topic group looked up in configuration
//! 3. a configuration path (declared but not supported)
//! 4. the global fallback topic list
//!
//! Resolution never returns an empty list.

use crate::config::DispatchConfig;
use crate::error::{DispatchError, MissingGroup};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Why a [`TopicSpec`] could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Referenced group is not configured
    #[error("topic group '{group}' is not configured (available: {})", display_list(.available))]
    MissingGroup {
        /// Requested group
        group: String,
        /// Groups that are configured
        available: Vec<String>,
    },

    /// Referenced group exists but has no topics
    #[error("topic group '{0}' has no topics")]
    EmptyGroup(String),

    /// Config-path topic sources are declared but not supported
    #[error("config-path topic source '{0}' is not implemented")]
    NotImplemented(String),

    /// Nothing on the handler or in configuration yields a topic
    #[error("no topics resolvable: handler names no topics or group and no fallback topics are configured")]
    NoTopics,
}

fn display_list(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Where a handler's topics come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSpec {
    /// Explicit topic names
    pub direct: Vec<String>,
    /// Named topic group
    pub group: Option<String>,
    /// Configuration path naming the topics
    pub config_path: Option<String>,
}

impl TopicSpec {
    /// Subscribe to explicit topics
    pub fn direct<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            direct: topics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Subscribe to a named topic group
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            group: Some(name.into()),
            ..Default::default()
        }
    }

    /// Subscribe to topics listed at a configuration path
    pub fn config_path(path: impl Into<String>) -> Self {
        Self {
            config_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Use the global fallback topic list
    pub fn fallback() -> Self {
        Self::default()
    }

    /// Short human-readable description for logs
    pub fn describe(&self) -> String {
        if !self.direct.is_empty() {
            format!("topics [{}]", self.direct.join(", "))
        } else if let Some(group) = &self.group {
            format!("group '{}'", group)
        } else if let Some(path) = &self.config_path {
            format!("config path '{}'", path)
        } else {
            "fallback topics".to_string()
        }
    }
}

/// Topic-related part of the configuration
#[derive(Debug, Clone, Copy)]
pub struct TopicsConfig<'a> {
    /// Named groups
    pub groups: &'a BTreeMap<String, Vec<String>>,
    /// Global fallback list
    pub topics: &'a [String],
}

impl<'a> From<&'a DispatchConfig> for TopicsConfig<'a> {
    fn from(config: &'a DispatchConfig) -> Self {
        Self {
            groups: &config.topic_groups,
            topics: &config.topics,
        }
    }
}

impl TopicsConfig<'_> {
    fn available_groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}

/// Resolve a topic spec to concrete, de-duplicated topic names
pub fn resolve(spec: &TopicSpec, config: TopicsConfig<'_>) -> Result<Vec<String>, ResolveError> {
    if !spec.direct.is_empty() {
        return Ok(dedup(&spec.direct));
    }

    if let Some(group) = &spec.group {
        let topics = config
            .groups
            .get(group)
            .ok_or_else(|| ResolveError::MissingGroup {
                group: group.clone(),
                available: config.available_groups(),
            })?;
        if topics.is_empty() {
            return Err(ResolveError::EmptyGroup(group.clone()));
        }
        return Ok(dedup(topics));
    }

    if let Some(path) = &spec.config_path {
        return Err(ResolveError::NotImplemented(path.clone()));
    }

    if !config.topics.is_empty() {
        return Ok(dedup(config.topics));
    }

    Err(ResolveError::NoTopics)
}

/// Check every referenced group up front
///
/// `references` yields `(handler binding id, topic spec)` pairs. Every
/// missing or empty group is collected so a single error reports them all.
pub fn validate_groups<'s, I>(references: I, config: TopicsConfig<'_>) -> Result<(), DispatchError>
where
    I: IntoIterator<Item = (&'s str, &'s TopicSpec)>,
{
    let mut missing = Vec::new();

    for (handler, spec) in references {
        // Direct topics win over a group, so an unused group is not an error
        if !spec.direct.is_empty() {
            continue;
        }
        let Some(group) = &spec.group else {
            continue;
        };
        match config.groups.get(group) {
            None => missing.push(MissingGroup {
                handler: handler.to_string(),
                group: group.clone(),
                empty: false,
            }),
            Some(topics) if topics.is_empty() => missing.push(MissingGroup {
                handler: handler.to_string(),
                group: group.clone(),
                empty: true,
            }),
            Some(_) => {}
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::MissingGroups {
            missing,
            available: config.available_groups(),
        })
    }
}

fn dedup(topics: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    topics
        .iter()
        .filter(|t| seen.insert(t.as_str()))
        .cloned()
        .collect()
}
