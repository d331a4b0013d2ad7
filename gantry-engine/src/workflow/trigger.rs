// Trigger Rules
// Explicit predicate objects deciding whether an event starts the pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptor of the event that triggered a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push { branch: String },
    Tag { name: String },
    PullRequest { target: String },
    Manual,
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerEvent::Push { branch } => write!(f, "push to '{}'", branch),
            TriggerEvent::Tag { name } => write!(f, "tag '{}'", name),
            TriggerEvent::PullRequest { target } => write!(f, "pull request into '{}'", target),
            TriggerEvent::Manual => write!(f, "manual dispatch"),
        }
    }
}

/// A single trigger predicate.
///
/// ```yaml
/// on:
///   - event: push
///     branch: main
///   - event: tag
///     prefix: v
///   - event: pull_request
///     target: main
///   - event: manual
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerRule {
    /// Push to exactly this branch
    Push { branch: String },
    /// Tag whose name starts with the prefix
    Tag { prefix: String },
    /// Pull request targeting exactly this branch
    PullRequest { target: String },
    /// Manual invocation
    Manual,
}

impl TriggerRule {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match (self, event) {
            (TriggerRule::Push { branch }, TriggerEvent::Push { branch: pushed }) => {
                branch == pushed
            }
            (TriggerRule::Tag { prefix }, TriggerEvent::Tag { name }) => name.starts_with(prefix),
            (TriggerRule::PullRequest { target }, TriggerEvent::PullRequest { target: into }) => {
                target == into
            }
            (TriggerRule::Manual, TriggerEvent::Manual) => true,
            _ => false,
        }
    }
}

/// Index of the first rule matching the event, if any
pub fn first_match(rules: &[TriggerRule], event: &TriggerEvent) -> Option<usize> {
    rules.iter().position(|rule| rule.matches(event))
}
